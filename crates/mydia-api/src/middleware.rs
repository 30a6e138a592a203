//! Middleware — authentication extraction for users, media devices, and the
//! co-located relay-exit process.

use std::net::{IpAddr, SocketAddr};

use axum::{
    extract::{ConnectInfo, Request, State},
    http::header,
    middleware::Next,
    response::Response,
};
use base64::{engine::general_purpose::STANDARD as B64, Engine as _};
use hmac::{Hmac, Mac};
use mydia_common::{
    auth::{self, MediaClaims, UserClaims},
    error::MydiaError,
    models::{device::Device, user::User},
};
use sha2::Sha256;
use std::sync::Arc;
use uuid::Uuid;

use crate::AppState;

type HmacSha256 = Hmac<Sha256>;

/// Maximum age of a relay header timestamp.
const RELAY_TIMESTAMP_MAX_AGE_SECS: i64 = 60;

// ─── User authentication ─────────────────────────────────────────────────────

/// Authentication context extracted from a user access token.
#[derive(Debug, Clone)]
pub struct AuthContext {
    pub user_id: Uuid,
    pub username: String,
    pub role: String,
}

impl AuthContext {
    pub fn is_admin(&self) -> bool {
        self.role == "admin"
    }
}

/// Extract and validate the user JWT from `Authorization: Bearer <token>`.
pub async fn user_auth(
    State(state): State<Arc<AppState>>,
    mut request: Request,
    next: Next,
) -> Result<Response, MydiaError> {
    let token = bearer_token(&request).ok_or(MydiaError::Unauthorized)?;

    let claims: UserClaims = auth::decode_user_claims(&token, &state.config.auth.token_secret)
        .map_err(|_| MydiaError::InvalidToken)?;

    let user_id = claims.sub.parse::<Uuid>().map_err(|_| MydiaError::InvalidToken)?;

    request.extensions_mut().insert(AuthContext {
        user_id,
        username: claims.username,
        role: claims.role,
    });

    Ok(next.run(request).await)
}

// ─── Media authentication ────────────────────────────────────────────────────

/// Context attached to requests that authenticated with a media token.
#[derive(Debug, Clone)]
pub struct MediaContext {
    pub device: Device,
    pub user: User,
    pub claims: MediaClaims,
    /// The bearer token as presented, for endpoints that re-mint.
    pub token: String,
}

impl MediaContext {
    /// Fail with 403 unless every named permission is granted.
    pub fn require_permissions(&self, required: &[&str]) -> Result<(), MydiaError> {
        for permission in required {
            if !auth::has_permission(&self.claims, permission) {
                return Err(MydiaError::InsufficientPermissions);
            }
        }
        Ok(())
    }
}

/// The media authentication gate.
///
/// Accepts the token from `Authorization: Bearer <t>` or, failing that, a
/// `?token=` query parameter — the header wins when both are present. On
/// success the resolved device, user, and claims ride along in request
/// extensions; permission checks happen per-route via
/// [`MediaContext::require_permissions`].
pub async fn media_auth(
    State(state): State<Arc<AppState>>,
    mut request: Request,
    next: Next,
) -> Result<Response, MydiaError> {
    let token = bearer_token(&request)
        .or_else(|| query_token(&request))
        .ok_or(MydiaError::MissingToken)?;

    let (device, user, claims) =
        crate::auth::verify_token(&state.db.pool, &token, &state.config.auth).await?;

    tracing::debug!(device_id = %device.id, user_id = %user.id, "Media token accepted");

    request.extensions_mut().insert(MediaContext { device, user, claims, token });
    Ok(next.run(request).await)
}

fn bearer_token(request: &Request) -> Option<String> {
    request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::to_owned)
}

fn query_token(request: &Request) -> Option<String> {
    request.uri().query().and_then(|query| {
        query.split('&').find_map(|pair| {
            pair.strip_prefix("token=").map(str::to_owned)
        })
    })
}

// ─── Relay-device authentication ─────────────────────────────────────────────

/// Context attached when a request arrived through this server's own
/// relay-exit process and its signed header set checked out.
#[derive(Debug, Clone)]
pub struct RelayContext {
    pub device: Device,
    pub user: User,
}

/// Validate the `x-relay-*` header set on requests from the co-located
/// relay-exit process.
///
/// This layer never rejects: on any failed check the request simply proceeds
/// without an authenticated user and the normal gates take over. All checks
/// must pass — loopback peer, fresh timestamp, valid HMAC, live device — for
/// the device's owner to be attached.
pub async fn relay_device_auth(
    State(state): State<Arc<AppState>>,
    mut request: Request,
    next: Next,
) -> Response {
    let device_id = verify_relay_headers(&state, &request);
    if let Some(device_id) = device_id {
        if let Some(ctx) = resolve_relay_context(&state, device_id).await {
            tracing::debug!(device_id = %ctx.device.id, "Relay-tunnel request authenticated");
            request.extensions_mut().insert(ctx);
        }
    }
    next.run(request).await
}

/// Synchronously validate the relay headers on `request` and return the
/// claimed device id if every check (loopback peer, fresh timestamp, valid
/// HMAC) passes. Kept free of `.await` so the caller never holds a
/// reference to the request body across a suspension point.
fn verify_relay_headers(state: &AppState, request: &Request) -> Option<Uuid> {
    let headers = request.headers();

    let is_tunnel = headers
        .get("x-relay-tunnel")
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v == "true");
    let device_id = headers.get("x-relay-device-id")?.to_str().ok()?;
    if !is_tunnel {
        return None;
    }

    // Only the relay-exit process on this host may speak these headers. An
    // undeterminable peer address counts as non-loopback.
    let peer = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip());
    match peer {
        Some(IpAddr::V4(ip)) if ip.is_loopback() => {}
        Some(IpAddr::V6(ip)) if ip.is_loopback() => {}
        _ => return None,
    }

    let secret = state.config.relay.header_secret.as_deref()?;
    let timestamp = headers.get("x-relay-timestamp")?.to_str().ok()?;
    let signature = headers.get("x-relay-signature")?.to_str().ok()?;

    let ts: i64 = timestamp.parse().ok()?;
    if chrono::Utc::now().timestamp() - ts > RELAY_TIMESTAMP_MAX_AGE_SECS {
        tracing::warn!("Relay headers present but timestamp is stale");
        return None;
    }

    let provided = B64.decode(signature).ok()?;
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .expect("HMAC accepts any key length");
    mac.update(format!("{device_id}:{timestamp}").as_bytes());
    if mac.verify_slice(&provided).is_err() {
        tracing::warn!("Relay headers present but signature does not verify");
        return None;
    }

    Uuid::parse_str(device_id).ok()
}

async fn resolve_relay_context(state: &AppState, device_id: Uuid) -> Option<RelayContext> {
    let device = mydia_db::repository::devices::find_by_id(&state.db.pool, device_id)
        .await
        .ok()
        .flatten()?;
    if device.is_revoked() {
        return None;
    }
    let user = mydia_db::repository::users::find_by_id(&state.db.pool, device.user_id)
        .await
        .ok()
        .flatten()?;

    Some(RelayContext { device, user })
}

/// Compute the relay header signature for a device id + timestamp pair.
/// The relay-exit process uses this; tests and tooling share it.
pub fn sign_relay_headers(secret: &str, device_id: &str, timestamp: i64) -> String {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .expect("HMAC accepts any key length");
    mac.update(format!("{device_id}:{timestamp}").as_bytes());
    B64.encode(mac.finalize().into_bytes())
}
