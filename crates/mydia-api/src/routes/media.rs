//! Media routes — the endpoints paired devices call with their media token.
//!
//! The streaming pipeline proper consumes [`MediaContext`] the same way these
//! routes do; what lives here is the token lifecycle surface.

use axum::{extract::{Extension, State}, routing::{get, post}, Json, Router};
use mydia_common::error::MydiaResult;
use serde::Serialize;
use std::sync::Arc;
use uuid::Uuid;

use crate::{auth, middleware::MediaContext, AppState};

/// Media router. Callers wrap it with the media-auth middleware.
pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/media/token/refresh", post(refresh_token))
        .route("/media/session", get(session))
}

#[derive(Serialize)]
struct RefreshResponse {
    token: String,
    expires_at: i64,
}

/// POST /api/v1/media/token/refresh
///
/// Exchange a still-valid media token for a fresh one with the same
/// permissions.
async fn refresh_token(
    State(state): State<Arc<AppState>>,
    Extension(ctx): Extension<MediaContext>,
) -> MydiaResult<Json<RefreshResponse>> {
    let (token, claims) =
        auth::refresh_token(&state.db.pool, &ctx.token, &state.config.auth).await?;

    tracing::debug!(device_id = %ctx.device.id, "Media token refreshed");

    Ok(Json(RefreshResponse { token, expires_at: claims.exp }))
}

#[derive(Serialize)]
struct SessionResponse {
    device_id: Uuid,
    user_id: Uuid,
    permissions: Vec<String>,
    expires_at: i64,
}

/// GET /api/v1/media/session
///
/// Echo the authenticated session — who the gate thinks you are. Requires
/// the `stream` permission.
async fn session(
    Extension(ctx): Extension<MediaContext>,
) -> MydiaResult<Json<SessionResponse>> {
    ctx.require_permissions(&["stream"])?;

    Ok(Json(SessionResponse {
        device_id: ctx.device.id,
        user_id: ctx.user.id,
        permissions: ctx.claims.permissions.clone(),
        expires_at: ctx.claims.exp,
    }))
}
