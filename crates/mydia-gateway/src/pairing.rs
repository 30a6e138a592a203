//! The pairing channel — topic `device:pair`.
//!
//! Two sequential exchanges per connection:
//!
//! 1. `pairing_handshake` — the client sends an ephemeral X25519 public key;
//!    the server derives a shared secret with its static private key and
//!    replies with its static public key, which the client pins as the
//!    server identity for all future reconnects.
//! 2. `claim_code` — the client submits a claim code plus device metadata;
//!    the server consumes the code, creates the device, and returns the full
//!    pairing material in one reply. The client persists it and drops the
//!    channel.
//!
//! Out-of-order events are rejected by matching on the current state
//! variant; nothing here ever retries or rolls forward.

use mydia_common::crypto::{self, KeyPair};
use mydia_db::repository::{claim_codes::ClaimError, devices::RegistryError, pairing};
use serde::Deserialize;
use serde_json::json;

use crate::{
    protocol::{ChannelFrame, Reason},
    GatewayState,
};

/// Per-connection handshake state.
enum PairingState {
    Joined,
    HandshakeComplete {
        /// ECDH output with the client's ephemeral key. Held for the
        /// lifetime of the connection; proves nothing to the client on its
        /// own but pins the exchange to the server's static key.
        #[allow(dead_code)]
        shared_secret: [u8; 32],
    },
    Done,
}

#[derive(Deserialize)]
struct HandshakePayload {
    public_key: String,
}

#[derive(Deserialize)]
struct ClaimPayload {
    code: String,
    device_name: String,
    platform: String,
}

/// One pairing channel, owned by a single connection task.
pub struct PairingChannel {
    state: PairingState,
    ctx: GatewayState,
}

impl PairingChannel {
    pub fn new(ctx: GatewayState) -> Self {
        Self { state: PairingState::Joined, ctx }
    }

    /// Process one client frame, strictly in arrival order.
    pub async fn handle(&mut self, frame: &ChannelFrame) -> ChannelFrame {
        match (&self.state, frame.event.as_str()) {
            (PairingState::Joined, "pairing_handshake") => self.handshake(frame),
            (PairingState::HandshakeComplete { .. }, "claim_code") => {
                self.claim(frame).await
            }
            (PairingState::Joined, "claim_code") => {
                ChannelFrame::reply_error(frame, Reason::HandshakeIncomplete)
            }
            _ => ChannelFrame::reply_error(frame, Reason::InvalidMessage),
        }
    }

    fn handshake(&mut self, frame: &ChannelFrame) -> ChannelFrame {
        let payload: HandshakePayload = match serde_json::from_value(frame.payload.clone()) {
            Ok(p) => p,
            Err(_) => return ChannelFrame::reply_error(frame, Reason::InvalidMessage),
        };
        let client_ephemeral = match crypto::decode_key(&payload.public_key) {
            Ok(key) => key,
            Err(_) => return ChannelFrame::reply_error(frame, Reason::InvalidMessage),
        };

        let shared_secret = self.ctx.server_keypair.diffie_hellman(&client_ephemeral);
        self.state = PairingState::HandshakeComplete { shared_secret };

        tracing::debug!("Pairing handshake complete");
        ChannelFrame::reply_ok(
            frame,
            json!({ "public_key": self.ctx.server_keypair.public_base64() }),
        )
    }

    async fn claim(&mut self, frame: &ChannelFrame) -> ChannelFrame {
        let payload: ClaimPayload = match serde_json::from_value(frame.payload.clone()) {
            Ok(p) => p,
            Err(_) => return ChannelFrame::reply_error(frame, Reason::InvalidMessage),
        };

        // Fresh identity for the device: a static key pair it will prove on
        // reconnect and an opaque bearer token stored only as a hash.
        let device_keypair = KeyPair::generate();
        let device_token = mydia_api::auth::generate_device_token();
        let token_hash = match mydia_api::auth::hash_device_token(&device_token) {
            Ok(hash) => hash,
            Err(e) => {
                tracing::error!("Device token hashing failed: {e}");
                return ChannelFrame::reply_error(frame, Reason::InvalidMessage);
            }
        };

        let paired = match pairing::pair_device(
            &self.ctx.db.pool,
            &payload.code,
            &payload.device_name,
            &payload.platform,
            &device_keypair.public_base64(),
            &token_hash,
        )
        .await
        {
            Ok(paired) => paired,
            Err(e) => return ChannelFrame::reply_error(frame, claim_failure_reason(e)),
        };

        let (media_token, _claims) = match mydia_api::auth::create_token(
            &paired.device,
            &self.ctx.config.auth,
            mydia_api::auth::MediaTokenOptions::default(),
        ) {
            Ok(minted) => minted,
            Err(e) => {
                tracing::error!("Media token mint failed during pairing: {e}");
                return ChannelFrame::reply_error(frame, Reason::InvalidMessage);
            }
        };

        self.state = PairingState::Done;
        tracing::info!(
            device_id = %paired.device.id,
            user_id = %paired.device.user_id,
            platform = %paired.device.platform,
            "Pairing complete"
        );

        let server = &self.ctx.config.server;
        ChannelFrame::reply_ok(
            frame,
            json!({
                "device_id": paired.device.id,
                "media_token": media_token,
                "device_public_key": device_keypair.public_base64(),
                "device_private_key": device_keypair.secret_base64(),
                "device_token": device_token,
                "server_public_key": self.ctx.server_keypair.public_base64(),
                "direct_urls": server.direct_urls,
                "cert_fingerprint": server.cert_fingerprint,
                "instance_id": server.instance_id,
            }),
        )
    }
}

fn claim_failure_reason(error: pairing::PairingError) -> Reason {
    match error {
        pairing::PairingError::Claim(ClaimError::Expired) => Reason::ClaimCodeExpired,
        pairing::PairingError::Claim(ClaimError::NotFound)
        | pairing::PairingError::Claim(ClaimError::AlreadyUsed) => Reason::InvalidClaimCode,
        pairing::PairingError::Registry(RegistryError::Duplicate) => {
            tracing::error!("Freshly generated device key collided; rejecting pairing");
            Reason::InvalidMessage
        }
        pairing::PairingError::Claim(ClaimError::Db(e))
        | pairing::PairingError::Registry(RegistryError::Db(e))
        | pairing::PairingError::Db(e) => {
            tracing::error!("Pairing transaction failed: {e}");
            Reason::InvalidMessage
        }
    }
}
