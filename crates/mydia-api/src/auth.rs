//! Authentication — argon2 hashing and token minting/verification.
//!
//! Two token families share the signing secret but never each other's `typ`:
//! user access tokens (login sessions) and media access tokens (paired
//! devices). The media token service lives here: mint, verify against the
//! device registry, and refresh with preserved permissions.

use argon2::{
    password_hash::{rand_core::OsRng, PasswordHash, PasswordHasher, PasswordVerifier, SaltString},
    Argon2,
};
use base64::{engine::general_purpose::STANDARD as B64, Engine as _};
use chrono::{Duration, Utc};
use jsonwebtoken::{encode, EncodingKey, Header};
use mydia_common::{
    auth::{self, MediaClaims, TokenError, UserClaims, ACCESS_TOKEN_TYPE, MEDIA_TOKEN_TYPE},
    config::AuthConfig,
    error::MydiaError,
    models::{device::Device, user::User},
};
use rand::RngCore;
use uuid::Uuid;

/// Hash a password using Argon2id.
pub fn hash_password(password: &str) -> Result<String, argon2::password_hash::Error> {
    let salt = SaltString::generate(&mut OsRng);
    let argon2 = Argon2::default();
    let hash = argon2.hash_password(password.as_bytes(), &salt)?;
    Ok(hash.to_string())
}

/// Verify a password against an Argon2id hash (constant-time).
pub fn verify_password(password: &str, hash: &str) -> Result<bool, argon2::password_hash::Error> {
    let parsed_hash = PasswordHash::new(hash)?;
    Ok(Argon2::default()
        .verify_password(password.as_bytes(), &parsed_hash)
        .is_ok())
}

/// Generate a device bearer token: 32 bytes of OS randomness, base64.
/// Returned to the client exactly once at pairing; only its hash persists.
pub fn generate_device_token() -> String {
    let mut bytes = [0u8; 32];
    rand::rng().fill_bytes(&mut bytes);
    B64.encode(bytes)
}

/// Hash a device token for storage. Device tokens are high-entropy secrets
/// but get the same treatment as passwords.
pub fn hash_device_token(token: &str) -> Result<String, argon2::password_hash::Error> {
    hash_password(token)
}

/// Verify a device token against its stored hash.
pub fn verify_device_token(
    token: &str,
    hash: &str,
) -> Result<bool, argon2::password_hash::Error> {
    verify_password(token, hash)
}

// ─── User access tokens ──────────────────────────────────────────────────────

/// Generate a user access token.
pub fn generate_access_token(
    user: &User,
    cfg: &AuthConfig,
) -> Result<String, jsonwebtoken::errors::Error> {
    let now = Utc::now();
    let claims = UserClaims {
        sub: user.id.to_string(),
        username: user.username.clone(),
        role: user.role.as_str().to_string(),
        iat: now.timestamp(),
        exp: (now + Duration::seconds(cfg.access_token_ttl_secs as i64)).timestamp(),
        token_type: ACCESS_TOKEN_TYPE.to_string(),
    };

    encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(cfg.token_secret.as_bytes()),
    )
}

// ─── Media access tokens ─────────────────────────────────────────────────────

/// Options for media token minting.
#[derive(Debug, Default, Clone)]
pub struct MediaTokenOptions {
    /// TTL override in seconds; defaults to the configured media token TTL.
    pub ttl_secs: Option<u64>,
    /// Permission override; defaults to the full set.
    pub permissions: Option<Vec<String>>,
}

/// Mint a signed media access token for a paired device.
pub fn create_token(
    device: &Device,
    cfg: &AuthConfig,
    opts: MediaTokenOptions,
) -> Result<(String, MediaClaims), jsonwebtoken::errors::Error> {
    let now = Utc::now();
    let ttl = opts.ttl_secs.unwrap_or(cfg.media_token_ttl_secs) as i64;
    let claims = MediaClaims {
        sub: device.id.to_string(),
        user_id: device.user_id.to_string(),
        permissions: opts.permissions.unwrap_or_else(auth::default_permissions),
        typ: MEDIA_TOKEN_TYPE.to_string(),
        iss: cfg.issuer.clone(),
        iat: now.timestamp(),
        exp: (now + Duration::seconds(ttl)).timestamp(),
    };

    let token = encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(cfg.token_secret.as_bytes()),
    )?;
    Ok((token, claims))
}

/// Media token verification failures, in the order the checks run.
#[derive(Debug, thiserror::Error)]
pub enum TokenVerifyError {
    #[error("token expired")]
    Expired,

    #[error("invalid token")]
    Invalid,

    #[error("device not found")]
    DeviceNotFound,

    #[error("device revoked")]
    DeviceRevoked,

    #[error(transparent)]
    Db(#[from] sqlx::Error),
}

impl From<TokenVerifyError> for MydiaError {
    fn from(e: TokenVerifyError) -> Self {
        match e {
            TokenVerifyError::Expired => MydiaError::TokenExpired,
            TokenVerifyError::Invalid => MydiaError::InvalidToken,
            TokenVerifyError::DeviceNotFound => MydiaError::InvalidDevice,
            TokenVerifyError::DeviceRevoked => MydiaError::DeviceRevoked,
            TokenVerifyError::Db(e) => MydiaError::Database(e),
        }
    }
}

/// Verify a media token end to end: signature and structure, expiry, type
/// claim, then the bearer device's registry state.
pub async fn verify_token(
    pool: &sqlx::AnyPool,
    token: &str,
    cfg: &AuthConfig,
) -> Result<(Device, User, MediaClaims), TokenVerifyError> {
    let claims = auth::decode_media_claims(token, &cfg.token_secret).map_err(|e| match e {
        TokenError::Expired => TokenVerifyError::Expired,
        TokenError::Invalid => TokenVerifyError::Invalid,
    })?;

    let device_id = Uuid::parse_str(&claims.sub).map_err(|_| TokenVerifyError::Invalid)?;
    let device = mydia_db::repository::devices::find_by_id(pool, device_id)
        .await?
        .ok_or(TokenVerifyError::DeviceNotFound)?;
    if device.is_revoked() {
        return Err(TokenVerifyError::DeviceRevoked);
    }

    let user = mydia_db::repository::users::find_by_id(pool, device.user_id)
        .await?
        .ok_or(TokenVerifyError::DeviceNotFound)?;

    Ok((device, user, claims))
}

/// Refresh a media token: full verification (including revocation), then a
/// fresh mint carrying over the original permissions.
pub async fn refresh_token(
    pool: &sqlx::AnyPool,
    token: &str,
    cfg: &AuthConfig,
) -> Result<(String, MediaClaims), TokenVerifyError> {
    let (device, _user, claims) = verify_token(pool, token, cfg).await?;
    create_token(
        &device,
        cfg,
        MediaTokenOptions { ttl_secs: None, permissions: Some(claims.permissions) },
    )
    .map_err(|_| TokenVerifyError::Invalid)
}

#[cfg(test)]
mod tests {
    use super::*;
    use mydia_common::models::user::UserRole;
    use mydia_db::repository::{devices, users};

    fn auth_cfg() -> AuthConfig {
        AuthConfig {
            token_secret: "test-signing-secret".into(),
            app_secret: "test-app-secret".into(),
            issuer: "mydia".into(),
            access_token_ttl_secs: 900,
            media_token_ttl_secs: 600,
        }
    }

    fn sample_device() -> Device {
        Device {
            id: Uuid::new_v4(),
            user_id: Uuid::new_v4(),
            device_name: "Phone".into(),
            platform: "iOS".into(),
            device_static_public_key: "pub".into(),
            device_token_hash: "hash".into(),
            last_seen_at: None,
            revoked_at: None,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn minted_token_carries_expected_claims() {
        let device = sample_device();
        let (token, claims) = create_token(&device, &auth_cfg(), MediaTokenOptions::default())
            .unwrap();
        assert!(!token.is_empty());
        assert_eq!(claims.sub, device.id.to_string());
        assert_eq!(claims.user_id, device.user_id.to_string());
        assert_eq!(claims.typ, MEDIA_TOKEN_TYPE);
        assert_eq!(claims.iss, "mydia");
        assert_eq!(claims.permissions, vec!["stream", "download", "thumbnails"]);
        assert_eq!(claims.exp - claims.iat, 600);
    }

    /// Encode a token whose `exp` is firmly in the past.
    fn expired_token(device: &Device, cfg: &AuthConfig) -> String {
        let now = Utc::now().timestamp();
        let claims = MediaClaims {
            sub: device.id.to_string(),
            user_id: device.user_id.to_string(),
            permissions: auth::default_permissions(),
            typ: MEDIA_TOKEN_TYPE.to_string(),
            iss: cfg.issuer.clone(),
            iat: now - 700,
            exp: now - 100,
        };
        encode(
            &Header::default(),
            &claims,
            &EncodingKey::from_secret(cfg.token_secret.as_bytes()),
        )
        .unwrap()
    }

    #[test]
    fn decode_rejects_wrong_type_and_expiry() {
        let cfg = auth_cfg();
        let device = sample_device();

        let expired = expired_token(&device, &cfg);
        assert_eq!(
            auth::decode_media_claims(&expired, &cfg.token_secret),
            Err(TokenError::Expired)
        );

        let user = User {
            id: device.user_id,
            username: "owner".into(),
            password_hash: "x".into(),
            role: UserRole::User,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        let access = generate_access_token(&user, &cfg).unwrap();
        assert_eq!(
            auth::decode_media_claims(&access, &cfg.token_secret),
            Err(TokenError::Invalid)
        );
    }

    #[tokio::test]
    async fn verify_round_trip_against_registry() {
        let db = mydia_db::Database::connect_memory().await.unwrap();
        let cfg = auth_cfg();

        let user_id = Uuid::new_v4();
        users::create_user(&db.pool, user_id, "owner", "hash", UserRole::User)
            .await
            .unwrap();
        let device = devices::create_device(&db.pool, user_id, "Phone", "iOS", "pub-t", "hash")
            .await
            .unwrap();

        let (token, _) = create_token(&device, &cfg, MediaTokenOptions::default()).unwrap();
        let (verified, verified_user, claims) = verify_token(&db.pool, &token, &cfg).await.unwrap();
        assert_eq!(verified.id, device.id);
        assert_eq!(verified_user.id, user_id);
        assert_eq!(claims.sub, device.id.to_string());
    }

    #[tokio::test]
    async fn refresh_preserves_permissions() {
        let db = mydia_db::Database::connect_memory().await.unwrap();
        let cfg = auth_cfg();

        let user_id = Uuid::new_v4();
        users::create_user(&db.pool, user_id, "owner", "hash", UserRole::User)
            .await
            .unwrap();
        let device = devices::create_device(&db.pool, user_id, "Phone", "iOS", "pub-r", "hash")
            .await
            .unwrap();

        let (token, _) = create_token(
            &device,
            &cfg,
            MediaTokenOptions { ttl_secs: None, permissions: Some(vec!["stream".into()]) },
        )
        .unwrap();
        let (refreshed, claims) = refresh_token(&db.pool, &token, &cfg).await.unwrap();
        assert_ne!(refreshed, token);
        assert_eq!(claims.permissions, vec!["stream"]);
    }

    #[tokio::test]
    async fn revoked_device_fails_verification_forever() {
        let db = mydia_db::Database::connect_memory().await.unwrap();
        let cfg = auth_cfg();

        let user_id = Uuid::new_v4();
        users::create_user(&db.pool, user_id, "owner", "hash", UserRole::User)
            .await
            .unwrap();
        let device = devices::create_device(&db.pool, user_id, "Phone", "iOS", "pub-v", "hash")
            .await
            .unwrap();
        let (token, _) = create_token(&device, &cfg, MediaTokenOptions::default()).unwrap();

        devices::revoke_device(&db.pool, device.id).await.unwrap();

        for _ in 0..2 {
            let err = verify_token(&db.pool, &token, &cfg).await.unwrap_err();
            assert!(matches!(err, TokenVerifyError::DeviceRevoked));
        }
        let err = refresh_token(&db.pool, &token, &cfg).await.unwrap_err();
        assert!(matches!(err, TokenVerifyError::DeviceRevoked));
    }
}
