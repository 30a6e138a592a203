//! Shared token claims and validation.
//!
//! Claim types and stateless token validation live here so both mydia-api and
//! mydia-gateway can use them without circular dependencies. Hashing and token
//! generation stay in mydia-api since they're API-specific.

use jsonwebtoken::{decode, errors::ErrorKind, DecodingKey, Validation};
use serde::{Deserialize, Serialize};

/// `typ` claim of media access tokens.
pub const MEDIA_TOKEN_TYPE: &str = "media_access";
/// `typ` claim of user access tokens.
pub const ACCESS_TOKEN_TYPE: &str = "access";

/// The full permission set granted when a token is minted without an
/// explicit list.
pub fn default_permissions() -> Vec<String> {
    vec!["stream".into(), "download".into(), "thumbnails".into()]
}

/// Claims embedded in media access tokens. The bearer is a paired device,
/// not a user session: `sub` is the device id and `user_id` its owner.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct MediaClaims {
    /// Subject (device ID as string)
    pub sub: String,
    /// Owning user ID
    pub user_id: String,
    /// Granted permissions; a missing key means no permissions at all.
    #[serde(default)]
    pub permissions: Vec<String>,
    /// Token type — always [`MEDIA_TOKEN_TYPE`]
    pub typ: String,
    /// Issuer
    pub iss: String,
    /// Issued at (Unix timestamp)
    pub iat: i64,
    /// Expiration (Unix timestamp)
    pub exp: i64,
}

/// Claims embedded in user access tokens.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct UserClaims {
    /// Subject (user ID as string)
    pub sub: String,
    /// Username
    pub username: String,
    /// Role tag (`admin`, `user`, `viewer`)
    pub role: String,
    /// Issued at (Unix timestamp)
    pub iat: i64,
    /// Expiration (Unix timestamp)
    pub exp: i64,
    /// Token type — always [`ACCESS_TOKEN_TYPE`]
    pub token_type: String,
}

/// Stateless token failure. Expiry is kept distinct because clients react
/// differently (refresh vs re-pair); everything else is just invalid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum TokenError {
    #[error("token expired")]
    Expired,
    #[error("invalid token")]
    Invalid,
}

/// Validate and decode a media access token (signature, structure, expiry,
/// type claim). Device/revocation state is checked by the caller.
pub fn decode_media_claims(token: &str, secret: &str) -> Result<MediaClaims, TokenError> {
    let claims = decode_claims::<MediaClaims>(token, secret)?;
    if claims.typ != MEDIA_TOKEN_TYPE {
        return Err(TokenError::Invalid);
    }
    Ok(claims)
}

/// Validate and decode a user access token.
pub fn decode_user_claims(token: &str, secret: &str) -> Result<UserClaims, TokenError> {
    let claims = decode_claims::<UserClaims>(token, secret)?;
    if claims.token_type != ACCESS_TOKEN_TYPE {
        return Err(TokenError::Invalid);
    }
    Ok(claims)
}

fn decode_claims<T: serde::de::DeserializeOwned>(
    token: &str,
    secret: &str,
) -> Result<T, TokenError> {
    let mut validation = Validation::default();
    validation.leeway = 0;

    match decode::<T>(token, &DecodingKey::from_secret(secret.as_bytes()), &validation) {
        Ok(data) => Ok(data.claims),
        Err(e) => match e.kind() {
            ErrorKind::ExpiredSignature => Err(TokenError::Expired),
            _ => Err(TokenError::Invalid),
        },
    }
}

/// Check whether a claim set grants a named permission.
pub fn has_permission(claims: &MediaClaims, permission: &str) -> bool {
    claims.permissions.iter().any(|p| p == permission)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn permission_membership() {
        let claims = MediaClaims {
            sub: "d".into(),
            user_id: "u".into(),
            permissions: vec!["stream".into(), "thumbnails".into()],
            typ: MEDIA_TOKEN_TYPE.into(),
            iss: "mydia".into(),
            iat: 0,
            exp: 0,
        };
        assert!(has_permission(&claims, "stream"));
        assert!(!has_permission(&claims, "download"));
    }

    #[test]
    fn missing_permissions_key_means_empty() {
        let json = r#"{"sub":"d","user_id":"u","typ":"media_access","iss":"mydia","iat":0,"exp":0}"#;
        let claims: MediaClaims = serde_json::from_str(json).unwrap();
        assert!(claims.permissions.is_empty());
        assert!(!has_permission(&claims, "stream"));
    }
}
