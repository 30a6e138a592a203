//! Device management routes — claim-code issuance, device listing, revocation.
//!
//! All routes here sit behind the user-auth middleware; pairing itself
//! happens on the gateway channel, authorized by the issued claim code.

use axum::{
    extract::{Extension, Path, State},
    routing::{delete, get, post},
    Json, Router,
};
use chrono::{DateTime, Duration, Utc};
use mydia_common::{
    error::{MydiaError, MydiaResult},
    models::device::{DeviceResponse, IssueClaimCodeRequest},
    validation::validate_request,
};
use mydia_db::repository::{claim_codes, devices};
use serde::Serialize;
use std::sync::Arc;
use uuid::Uuid;

use crate::{middleware::AuthContext, AppState};

/// Device router. Callers wrap it with the user-auth middleware.
pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/devices/claim-codes", post(issue_claim_code))
        .route("/devices", get(list_devices))
        .route("/devices/{id}", delete(revoke_device))
}

#[derive(Serialize)]
struct ClaimCodeResponse {
    code: String,
    expires_at: DateTime<Utc>,
}

/// POST /api/v1/devices/claim-codes
///
/// Issue a one-time pairing code bound to the calling user.
async fn issue_claim_code(
    State(state): State<Arc<AppState>>,
    Extension(auth): Extension<AuthContext>,
    Json(body): Json<IssueClaimCodeRequest>,
) -> MydiaResult<Json<ClaimCodeResponse>> {
    validate_request(&body)?;

    let ttl_mins = body.ttl_mins.unwrap_or(state.config.pairing.claim_code_ttl_mins);
    let claim = claim_codes::issue(
        &state.db.pool,
        auth.user_id,
        state.config.pairing.claim_code_length,
        Duration::minutes(ttl_mins),
    )
    .await?;

    tracing::info!(user_id = %auth.user_id, expires_at = %claim.expires_at, "Claim code issued");

    Ok(Json(ClaimCodeResponse { code: claim.code, expires_at: claim.expires_at }))
}

/// GET /api/v1/devices
///
/// List the calling user's paired devices, newest first.
async fn list_devices(
    State(state): State<Arc<AppState>>,
    Extension(auth): Extension<AuthContext>,
) -> MydiaResult<Json<Vec<DeviceResponse>>> {
    let devices = devices::list_user_devices(&state.db.pool, auth.user_id).await?;
    Ok(Json(devices.into_iter().map(DeviceResponse::from).collect()))
}

/// DELETE /api/v1/devices/{id}
///
/// Revoke a device. Owners can revoke their own devices; admins can revoke
/// anyone's. Revocation is one-way and idempotent.
async fn revoke_device(
    State(state): State<Arc<AppState>>,
    Extension(auth): Extension<AuthContext>,
    Path(id): Path<Uuid>,
) -> MydiaResult<Json<DeviceResponse>> {
    let device = devices::find_by_id(&state.db.pool, id)
        .await?
        .ok_or(MydiaError::NotFound { resource: "Device".into() })?;

    if device.user_id != auth.user_id && !auth.is_admin() {
        return Err(MydiaError::Forbidden);
    }

    let revoked = devices::revoke_device(&state.db.pool, id)
        .await?
        .ok_or(MydiaError::NotFound { resource: "Device".into() })?;

    tracing::info!(device_id = %id, by = %auth.user_id, "Device revoked");

    Ok(Json(revoked.into()))
}
