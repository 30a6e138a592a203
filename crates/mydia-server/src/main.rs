//! # Mydia Server
//!
//! Main binary for the remote-access core:
//! - REST API (media token gates, device management)
//! - WebSocket gateway (pairing + reconnect channels)
//!
//! Both listeners run in a single process; the relay-exit process, when
//! deployed, talks to the API over loopback.

use mydia_api::{build_router, AppState};
use mydia_db::Database;
use mydia_gateway::GatewayState;
use std::net::SocketAddr;
use std::sync::Arc;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load configuration
    let config = mydia_common::config::init()?;

    // Initialize tracing (structured logging)
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "mydia=debug,tower_http=debug".into()),
        )
        .with_target(true)
        .init();

    tracing::info!("Starting Mydia v{}", env!("CARGO_PKG_VERSION"));

    // Connect to the database and apply migrations
    let db = Database::connect(config).await?;
    db.migrate().await?;

    // Load the server identity, generating and sealing it on first run.
    // Clients pin this public key at pairing; losing it breaks every
    // paired device, so it never leaves the database unsealed.
    let server_keypair = Arc::new(
        mydia_db::repository::keystore::load_or_generate(&db.pool, &config.auth.app_secret)
            .await?,
    );
    tracing::info!(public_key = %server_keypair.public_base64(), "Server identity ready");

    // === REST API ===
    let api_state = AppState { db: db.clone(), config: config.clone() };
    let api_router = build_router(api_state);
    let api_addr = SocketAddr::new(config.server.host.parse()?, config.server.port);

    // === Device gateway ===
    let gateway_state = GatewayState::new(db.clone(), config.clone(), server_keypair);
    let gateway_router = mydia_gateway::build_router(gateway_state);
    let gateway_addr = SocketAddr::new(config.server.host.parse()?, config.server.gateway_port);

    tracing::info!("REST API listening on http://{api_addr}");
    tracing::info!("Device gateway listening on ws://{gateway_addr}");

    // Run both servers concurrently. The API serves with peer-address info
    // so the relay-device gate can enforce its loopback check.
    tokio::try_join!(
        async {
            let listener = tokio::net::TcpListener::bind(api_addr).await?;
            axum::serve(
                listener,
                api_router.into_make_service_with_connect_info::<SocketAddr>(),
            )
            .await?;
            Ok::<_, anyhow::Error>(())
        },
        async {
            let listener = tokio::net::TcpListener::bind(gateway_addr).await?;
            axum::serve(listener, gateway_router).await?;
            Ok::<_, anyhow::Error>(())
        },
    )?;

    Ok(())
}
