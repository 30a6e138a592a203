//! # mydia-api
//!
//! HTTP layer for Mydia's remote-access core: the media token service, the
//! authentication gates, and the device-management endpoints.

pub mod auth;
pub mod middleware;
pub mod routes;

use axum::{middleware::from_fn_with_state, Router};
use mydia_common::config::AppConfig;
use mydia_db::Database;
use std::sync::Arc;

/// Shared application state available to all route handlers.
///
/// The signing secret and relay secret travel inside `config`; nothing in
/// this crate reaches for process-wide state.
#[derive(Clone)]
pub struct AppState {
    pub db: Database,
    pub config: AppConfig,
}

/// Build the complete API router with all routes and middleware.
pub fn build_router(state: AppState) -> Router {
    let state = Arc::new(state);

    let user_routes = Router::new()
        .merge(routes::devices::router())
        .layer(from_fn_with_state(state.clone(), middleware::user_auth));

    let media_routes = Router::new()
        .merge(routes::media::router())
        .layer(from_fn_with_state(state.clone(), middleware::media_auth));

    let api_routes = Router::new()
        .merge(routes::auth::router())
        .merge(user_routes)
        .merge(media_routes);

    Router::new()
        .nest("/api/v1", api_routes)
        .merge(routes::health::router())
        .layer(from_fn_with_state::<_, _, (axum::extract::State<Arc<AppState>>, axum::extract::Request)>(
            state.clone(),
            middleware::relay_device_auth,
        ))
        .layer(
            tower_http::cors::CorsLayer::new()
                .allow_origin(tower_http::cors::Any)
                .allow_methods(tower_http::cors::Any)
                .allow_headers(tower_http::cors::Any),
        )
        .layer(tower_http::trace::TraceLayer::new_for_http())
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::MediaTokenOptions;
    use axum::{
        body::Body,
        extract::ConnectInfo,
        http::{header, Request, StatusCode},
    };
    use mydia_common::{
        config::{
            AppConfig, AuthConfig, DatabaseConfig, PairingConfig, RelayConfig, ServerConfig,
        },
        models::{device::Device, user::UserRole},
    };
    use mydia_db::repository::{devices, users};
    use serde_json::Value;
    use std::net::SocketAddr;
    use tower::ServiceExt;
    use uuid::Uuid;

    fn test_config() -> AppConfig {
        AppConfig {
            server: ServerConfig {
                host: "127.0.0.1".into(),
                port: 0,
                gateway_port: 0,
                direct_urls: vec![],
                instance_id: None,
                cert_fingerprint: None,
            },
            database: DatabaseConfig {
                url: "sqlite::memory:".into(),
                max_connections: 1,
                min_connections: 1,
            },
            auth: AuthConfig {
                token_secret: "test-signing-secret".into(),
                app_secret: "test-app-secret".into(),
                issuer: "mydia".into(),
                access_token_ttl_secs: 900,
                media_token_ttl_secs: 600,
            },
            pairing: PairingConfig { claim_code_ttl_mins: 10, claim_code_length: 8 },
            relay: RelayConfig { header_secret: Some("relay-secret".into()) },
        }
    }

    async fn test_state() -> AppState {
        AppState {
            db: Database::connect_memory().await.unwrap(),
            config: test_config(),
        }
    }

    async fn seed_device(state: &AppState) -> Device {
        let user_id = Uuid::new_v4();
        users::create_user(&state.db.pool, user_id, "owner", "hash", UserRole::User)
            .await
            .unwrap();
        devices::create_device(&state.db.pool, user_id, "Phone", "iOS", "pub-key", "hash")
            .await
            .unwrap()
    }

    async fn body_json(response: axum::response::Response) -> Value {
        let bytes = axum::body::to_bytes(response.into_body(), 64 * 1024).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn missing_token_is_401_with_exact_body() {
        let state = test_state().await;
        let app = build_router(state);

        let response = app
            .oneshot(
                Request::get("/api/v1/media/session").body(Body::empty()).unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        let body = body_json(response).await;
        assert_eq!(body["error"], "Unauthorized");
        assert_eq!(body["message"], "Missing authentication token");
    }

    /// Encode a media token whose `exp` is firmly in the past.
    fn expired_token(device: &Device, cfg: &AuthConfig) -> String {
        use jsonwebtoken::{encode, EncodingKey, Header};
        let now = chrono::Utc::now().timestamp();
        let claims = mydia_common::auth::MediaClaims {
            sub: device.id.to_string(),
            user_id: device.user_id.to_string(),
            permissions: mydia_common::auth::default_permissions(),
            typ: mydia_common::auth::MEDIA_TOKEN_TYPE.to_string(),
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

    #[tokio::test]
    async fn expired_token_is_401_token_expired() {
        let state = test_state().await;
        let device = seed_device(&state).await;
        let token = expired_token(&device, &state.config.auth);
        let app = build_router(state);

        let response = app
            .oneshot(
                Request::get("/api/v1/media/session")
                    .header(header::AUTHORIZATION, format!("Bearer {token}"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        let body = body_json(response).await;
        assert_eq!(body["error"], "Unauthorized");
        assert_eq!(body["message"], "Token expired");
    }

    #[tokio::test]
    async fn garbage_token_is_401_invalid_token() {
        let state = test_state().await;
        let app = build_router(state);

        let response = app
            .oneshot(
                Request::get("/api/v1/media/session")
                    .header(header::AUTHORIZATION, "Bearer not-a-jwt")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        let body = body_json(response).await;
        assert_eq!(body["message"], "Invalid token");
    }

    #[tokio::test]
    async fn query_token_works_but_header_wins() {
        let state = test_state().await;
        let device = seed_device(&state).await;
        let (good, _) =
            auth::create_token(&device, &state.config.auth, MediaTokenOptions::default()).unwrap();
        let app = build_router(state);

        // Token via query parameter alone.
        let response = app
            .clone()
            .oneshot(
                Request::get(format!("/api/v1/media/session?token={good}"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        // A bad header must not fall back to the good query token.
        let response = app
            .oneshot(
                Request::get(format!("/api/v1/media/session?token={good}"))
                    .header(header::AUTHORIZATION, "Bearer bogus")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn revoked_device_is_403() {
        let state = test_state().await;
        let device = seed_device(&state).await;
        let (token, _) =
            auth::create_token(&device, &state.config.auth, MediaTokenOptions::default()).unwrap();
        devices::revoke_device(&state.db.pool, device.id).await.unwrap();
        let app = build_router(state);

        let response = app
            .oneshot(
                Request::get("/api/v1/media/session")
                    .header(header::AUTHORIZATION, format!("Bearer {token}"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::FORBIDDEN);
        let body = body_json(response).await;
        assert_eq!(body["error"], "Forbidden");
    }

    #[tokio::test]
    async fn insufficient_permissions_is_403() {
        let state = test_state().await;
        let device = seed_device(&state).await;
        let (token, _) = auth::create_token(
            &device,
            &state.config.auth,
            MediaTokenOptions { ttl_secs: None, permissions: Some(vec!["download".into()]) },
        )
        .unwrap();
        let app = build_router(state);

        let response = app
            .oneshot(
                Request::get("/api/v1/media/session")
                    .header(header::AUTHORIZATION, format!("Bearer {token}"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::FORBIDDEN);
        let body = body_json(response).await;
        assert_eq!(body["message"], "Insufficient permissions");
    }

    #[tokio::test]
    async fn refresh_returns_fresh_token_with_same_permissions() {
        let state = test_state().await;
        let device = seed_device(&state).await;
        let (token, _) = auth::create_token(
            &device,
            &state.config.auth,
            MediaTokenOptions { ttl_secs: None, permissions: Some(vec!["stream".into()]) },
        )
        .unwrap();
        let secret = state.config.auth.token_secret.clone();
        let app = build_router(state);

        let response = app
            .oneshot(
                Request::post("/api/v1/media/token/refresh")
                    .header(header::AUTHORIZATION, format!("Bearer {token}"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        let new_token = body["token"].as_str().unwrap();
        let claims =
            mydia_common::auth::decode_media_claims(new_token, &secret).unwrap();
        assert_eq!(claims.permissions, vec!["stream"]);
    }

    // ── Relay-device gate ────────────────────────────────────────────────────

    fn relay_request(
        device_id: &str,
        timestamp: i64,
        signature: &str,
        peer: Option<SocketAddr>,
    ) -> Request<Body> {
        let mut request = Request::get("/api/v1/devices")
            .header("x-relay-tunnel", "true")
            .header("x-relay-device-id", device_id)
            .header("x-relay-timestamp", timestamp.to_string())
            .header("x-relay-signature", signature)
            .body(Body::empty())
            .unwrap();
        if let Some(addr) = peer {
            request.extensions_mut().insert(ConnectInfo(addr));
        }
        request
    }

    /// Probe router that reports whether the relay gate attached a user.
    fn relay_probe(state: AppState) -> Router {
        use axum::routing::get;
        let state = Arc::new(state);
        Router::new()
            .route(
                "/probe",
                get(|request: Request<Body>| async move {
                    let attached = request.extensions().get::<middleware::RelayContext>().is_some();
                    axum::Json(serde_json::json!({ "relay_user": attached }))
                }),
            )
            .layer(from_fn_with_state(state.clone(), middleware::relay_device_auth))
            .with_state(state)
    }

    async fn probe(app: Router, mut request: Request<Body>) -> bool {
        *request.uri_mut() = "/probe".parse().unwrap();
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        body_json(response).await["relay_user"].as_bool().unwrap()
    }

    #[tokio::test]
    async fn relay_gate_accepts_signed_loopback_request() {
        let state = test_state().await;
        let device = seed_device(&state).await;
        let ts = chrono::Utc::now().timestamp();
        let sig = middleware::sign_relay_headers("relay-secret", &device.id.to_string(), ts);
        let app = relay_probe(state);

        let loopback: SocketAddr = "127.0.0.1:9999".parse().unwrap();
        let attached = probe(
            app,
            relay_request(&device.id.to_string(), ts, &sig, Some(loopback)),
        )
        .await;
        assert!(attached);
    }

    #[tokio::test]
    async fn relay_gate_ignores_non_loopback_and_missing_peer() {
        let state = test_state().await;
        let device = seed_device(&state).await;
        let ts = chrono::Utc::now().timestamp();
        let sig = middleware::sign_relay_headers("relay-secret", &device.id.to_string(), ts);

        let remote: SocketAddr = "203.0.113.9:4000".parse().unwrap();
        let app = relay_probe(state.clone());
        let attached = probe(
            app,
            relay_request(&device.id.to_string(), ts, &sig, Some(remote)),
        )
        .await;
        assert!(!attached);

        // No peer address at all defaults to deny.
        let app = relay_probe(state);
        let attached =
            probe(app, relay_request(&device.id.to_string(), ts, &sig, None)).await;
        assert!(!attached);
    }

    #[tokio::test]
    async fn relay_gate_rejects_bad_signature_and_stale_timestamp() {
        let state = test_state().await;
        let device = seed_device(&state).await;
        let loopback: SocketAddr = "127.0.0.1:9999".parse().unwrap();

        // Wrong secret.
        let ts = chrono::Utc::now().timestamp();
        let bad_sig = middleware::sign_relay_headers("wrong", &device.id.to_string(), ts);
        let app = relay_probe(state.clone());
        let attached = probe(
            app,
            relay_request(&device.id.to_string(), ts, &bad_sig, Some(loopback)),
        )
        .await;
        assert!(!attached);

        // Stale timestamp, correctly signed.
        let stale = ts - 120;
        let sig = middleware::sign_relay_headers("relay-secret", &device.id.to_string(), stale);
        let app = relay_probe(state);
        let attached = probe(
            app,
            relay_request(&device.id.to_string(), stale, &sig, Some(loopback)),
        )
        .await;
        assert!(!attached);
    }

    #[tokio::test]
    async fn relay_gate_ignores_revoked_device() {
        let state = test_state().await;
        let device = seed_device(&state).await;
        devices::revoke_device(&state.db.pool, device.id).await.unwrap();

        let ts = chrono::Utc::now().timestamp();
        let sig = middleware::sign_relay_headers("relay-secret", &device.id.to_string(), ts);
        let loopback: SocketAddr = "127.0.0.1:9999".parse().unwrap();
        let app = relay_probe(state);

        let attached = probe(
            app,
            relay_request(&device.id.to_string(), ts, &sig, Some(loopback)),
        )
        .await;
        assert!(!attached);
    }
}
