//! # mydia-client
//!
//! Rust client library for Mydia's remote-access protocol: pair once with a
//! claim code, then reconnect from anywhere — directly with a pinned
//! certificate, through a relay tunnel, or hot-swapping between the two.
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use mydia_client::{
//!     manager::{ConnectionConfig, ConnectionManager},
//!     pairing::PairingClient,
//!     store::ClientStore,
//! };
//!
//! #[tokio::main]
//! async fn main() -> mydia_client::error::Result<()> {
//!     let store = Arc::new(ClientStore::open("client.json")?);
//!
//!     // One-time pairing with the code shown on the server UI.
//!     let pairing = PairingClient::new("ws://192.168.1.10:8097");
//!     let material = pairing.pair("A1B2C3D4", "Living-room tablet", "Android").await?;
//!     mydia_client::pairing::persist_material(&store, &material)?;
//!
//!     // Every later session: bring up a transport and go.
//!     let manager = ConnectionManager::new(
//!         ConnectionConfig {
//!             instance_id: material.instance_id.clone(),
//!             relay_url: Some("wss://relay.mydia.app".into()),
//!             direct_urls: material.direct_urls.clone(),
//!             ..Default::default()
//!         },
//!         reqwest::Client::new(),
//!         Some(store),
//!     );
//!     manager.connect().await?;
//!     manager.spawn_probe_loop();
//!     Ok(())
//! }
//! ```

pub mod crypto;
pub mod direct;
pub mod error;
pub mod fingerprint;
pub mod graphql;
pub mod manager;
pub mod pairing;
pub mod relay;
pub mod store;

pub use error::{ClientError, TransportError};
pub use manager::{ConnectionConfig, ConnectionManager, ConnectionMode, ConnectionState};
pub use relay::{RelayTunnel, RelayTunnelInfo};
