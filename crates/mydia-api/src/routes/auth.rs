//! Authentication routes — register and login.
//!
//! Accounts exist so that claim codes have an owner to bind pairings to.
//! The first account on a fresh installation becomes the admin.

use axum::{extract::State, routing::post, Json, Router};
use mydia_common::{
    error::{MydiaError, MydiaResult},
    models::user::{CreateUserRequest, LoginRequest, UserResponse, UserRole},
    validation::validate_request,
};
use mydia_db::repository::users;
use serde::Serialize;
use std::sync::Arc;
use uuid::Uuid;

use crate::{auth, AppState};

/// Auth router.
pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/auth/register", post(register))
        .route("/auth/login", post(login))
}

#[derive(Serialize)]
struct AuthResponse {
    user: UserResponse,
    access_token: String,
    expires_in: u64,
    token_type: String,
}

/// POST /api/v1/auth/register
async fn register(
    State(state): State<Arc<AppState>>,
    Json(body): Json<CreateUserRequest>,
) -> MydiaResult<Json<AuthResponse>> {
    validate_request(&body)?;

    if users::find_by_username(&state.db.pool, &body.username)
        .await?
        .is_some()
    {
        return Err(MydiaError::AlreadyExists {
            resource: "Username".into(),
        });
    }

    let password_hash = auth::hash_password(&body.password)
        .map_err(|e| MydiaError::Internal(anyhow::anyhow!("{e}")))?;

    // First account administers the installation.
    let role = if users::count_users(&state.db.pool).await? == 0 {
        UserRole::Admin
    } else {
        UserRole::User
    };

    let user =
        users::create_user(&state.db.pool, Uuid::new_v4(), &body.username, &password_hash, role)
            .await?;

    let access_token = auth::generate_access_token(&user, &state.config.auth)
        .map_err(|e| MydiaError::Internal(e.into()))?;

    tracing::info!(user_id = %user.id, username = %user.username, "New user registered");

    Ok(Json(AuthResponse {
        user: user.into(),
        access_token,
        expires_in: state.config.auth.access_token_ttl_secs,
        token_type: "Bearer".into(),
    }))
}

/// POST /api/v1/auth/login
async fn login(
    State(state): State<Arc<AppState>>,
    Json(body): Json<LoginRequest>,
) -> MydiaResult<Json<AuthResponse>> {
    validate_request(&body)?;

    let user = users::find_by_username(&state.db.pool, &body.username)
        .await?
        .ok_or(MydiaError::InvalidCredentials)?;

    let valid = auth::verify_password(&body.password, &user.password_hash)
        .map_err(|_| MydiaError::InvalidCredentials)?;
    if !valid {
        return Err(MydiaError::InvalidCredentials);
    }

    let access_token = auth::generate_access_token(&user, &state.config.auth)
        .map_err(|e| MydiaError::Internal(e.into()))?;

    tracing::info!(user_id = %user.id, "User logged in");

    Ok(Json(AuthResponse {
        user: user.into(),
        access_token,
        expires_in: state.config.auth.access_token_ttl_secs,
        token_type: "Bearer".into(),
    }))
}
