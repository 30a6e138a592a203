//! The reconnect channel — topic `device:reconnect`.
//!
//! A single `key_exchange` round: the client presents its paired static
//! public key and its device token; the server checks the registry, verifies
//! the token hash, derives the session key, touches `last_seen_at`, and
//! returns a fresh media token.
//!
//! An unknown key and a revoked device get the same `device_not_found`
//! answer, so probing the channel reveals nothing about which keys were ever
//! paired. Argon2 verification dominates handler latency; repeated failures
//! on one connection are capped and the channel closed.

use mydia_common::crypto::{self, KeyPair};
use mydia_db::repository::devices;
use serde::Deserialize;
use serde_json::json;

use crate::{
    protocol::{ChannelFrame, Reason},
    GatewayState,
};

/// Failed attempts tolerated per connection before the channel closes.
const MAX_FAILED_ATTEMPTS: u32 = 5;

#[derive(Deserialize)]
struct KeyExchangePayload {
    client_public_key: String,
    device_token: String,
}

/// One reconnect channel, owned by a single connection task.
pub struct ReconnectChannel {
    ctx: GatewayState,
    /// Fresh per-connection ephemeral pair, generated on join. Not mixed
    /// into the current derivation; kept so a protocol rev can start
    /// mixing it in without changing channel state.
    #[allow(dead_code)]
    ephemeral: KeyPair,
    /// Session key after a successful exchange, for the connection's lifetime.
    session_key: Option<[u8; 32]>,
    failed_attempts: u32,
}

impl ReconnectChannel {
    pub fn new(ctx: GatewayState) -> Self {
        Self {
            ctx,
            ephemeral: KeyPair::generate(),
            session_key: None,
            failed_attempts: 0,
        }
    }

    /// The session key derived by the last successful exchange, if any.
    pub fn session_key(&self) -> Option<&[u8; 32]> {
        self.session_key.as_ref()
    }

    /// Whether the connection should be dropped (abuse damping).
    pub fn should_close(&self) -> bool {
        self.failed_attempts >= MAX_FAILED_ATTEMPTS
    }

    /// Process one client frame, strictly in arrival order.
    pub async fn handle(&mut self, frame: &ChannelFrame) -> ChannelFrame {
        match frame.event.as_str() {
            "key_exchange" => self.key_exchange(frame).await,
            // Pre-migration clients speak a Noise-style handshake; tell them
            // explicitly instead of failing obscurely.
            "handshake_init" => ChannelFrame::reply_error(frame, Reason::UseKeyExchange),
            _ => ChannelFrame::reply_error(frame, Reason::InvalidMessage),
        }
    }

    async fn key_exchange(&mut self, frame: &ChannelFrame) -> ChannelFrame {
        let payload: KeyExchangePayload = match serde_json::from_value(frame.payload.clone()) {
            Ok(p) => p,
            Err(_) => return ChannelFrame::reply_error(frame, Reason::InvalidMessage),
        };
        let client_static = match crypto::decode_key(&payload.client_public_key) {
            Ok(key) => key,
            Err(_) => return ChannelFrame::reply_error(frame, Reason::InvalidMessage),
        };

        let device = match devices::find_by_public_key(
            &self.ctx.db.pool,
            &payload.client_public_key,
        )
        .await
        {
            Ok(Some(device)) if !device.is_revoked() => device,
            Ok(_) => {
                // Unknown and revoked are deliberately the same answer.
                self.failed_attempts += 1;
                return ChannelFrame::reply_error(frame, Reason::DeviceNotFound);
            }
            Err(e) => {
                tracing::error!("Device lookup failed: {e}");
                return ChannelFrame::reply_error(frame, Reason::InvalidMessage);
            }
        };

        match mydia_api::auth::verify_device_token(&payload.device_token, &device.device_token_hash)
        {
            Ok(true) => {}
            Ok(false) | Err(_) => {
                self.failed_attempts += 1;
                tracing::warn!(device_id = %device.id, "Device token verification failed");
                return ChannelFrame::reply_error(frame, Reason::InvalidDeviceToken);
            }
        }

        let session_key =
            crypto::derive_session_key(&self.ctx.server_keypair, &client_static, None, None);
        self.session_key = Some(session_key);

        if let Err(e) = devices::touch_last_seen(&self.ctx.db.pool, device.id).await {
            tracing::warn!(device_id = %device.id, "Failed to update last_seen_at: {e}");
        }

        let (token, _claims) = match mydia_api::auth::create_token(
            &device,
            &self.ctx.config.auth,
            mydia_api::auth::MediaTokenOptions::default(),
        ) {
            Ok(minted) => minted,
            Err(e) => {
                tracing::error!("Media token mint failed during reconnect: {e}");
                return ChannelFrame::reply_error(frame, Reason::InvalidMessage);
            }
        };

        tracing::info!(device_id = %device.id, "Device reconnected");
        ChannelFrame::reply_ok(
            frame,
            json!({
                "device_id": device.id,
                "server_public_key": self.ctx.server_keypair.public_base64(),
                "token": token,
            }),
        )
    }
}
