//! Client side of the pairing and reconnect channels.
//!
//! Pairing runs once, against the gateway the user can reach (usually on the
//! local network): join `device:pair`, handshake, submit the claim code the
//! user typed, persist everything the server returns. Reconnect runs on
//! every later session: join `device:reconnect`, prove possession of the
//! paired key and token, come away with a fresh media token and a session
//! key.

use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};

use crate::crypto::{decode_key, KeyPair};
use crate::error::{ClientError, Result, TransportError};
use crate::store::{self, ClientStore};

/// One frame on the channel link — mirrors the server's wire shape.
#[derive(Debug, Serialize, Deserialize)]
struct ChannelFrame {
    topic: String,
    event: String,
    #[serde(rename = "ref", default, skip_serializing_if = "Option::is_none")]
    reference: Option<String>,
    #[serde(default)]
    payload: Value,
}

/// Everything the server hands back at pairing. Persist it (minus nothing —
/// the claim code itself is gone) and drop the channel.
#[derive(Debug, Clone, Deserialize)]
pub struct PairingMaterial {
    pub device_id: String,
    pub media_token: String,
    pub device_public_key: String,
    pub device_private_key: String,
    pub device_token: String,
    #[serde(default)]
    pub server_public_key: String,
    #[serde(default)]
    pub direct_urls: Vec<String>,
    #[serde(default)]
    pub cert_fingerprint: Option<String>,
    #[serde(default)]
    pub instance_id: Option<String>,
}

/// Result of a reconnect exchange.
#[derive(Debug, Clone)]
pub struct ReconnectOutcome {
    pub device_id: String,
    pub media_token: String,
    /// Session key both ends derived; lives only as long as the caller
    /// keeps it.
    pub session_key: [u8; 32],
}

type Socket = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

/// Client for the gateway channels of one server.
pub struct PairingClient {
    gateway_url: String,
}

impl PairingClient {
    /// `gateway_url` is the WebSocket base, e.g. `ws://192.168.1.10:8097`.
    pub fn new(gateway_url: impl Into<String>) -> Self {
        Self { gateway_url: gateway_url.into() }
    }

    /// Run the full pairing exchange with a claim code.
    pub async fn pair(
        &self,
        claim_code: &str,
        device_name: &str,
        platform: &str,
    ) -> Result<PairingMaterial> {
        let mut socket = self.join("device:pair").await?;

        // Handshake: fresh ephemeral out, server static key back.
        let ephemeral = KeyPair::generate();
        let response = request(
            &mut socket,
            "device:pair",
            "pairing_handshake",
            json!({ "public_key": ephemeral.public_base64() }),
            "2",
        )
        .await?;
        let server_public = response["public_key"]
            .as_str()
            .ok_or_else(|| ClientError::Other("handshake reply missing public_key".into()))?
            .to_owned();

        // Claim submission.
        let response = request(
            &mut socket,
            "device:pair",
            "claim_code",
            json!({
                "code": claim_code,
                "device_name": device_name,
                "platform": platform,
            }),
            "3",
        )
        .await?;

        let mut material: PairingMaterial = serde_json::from_value(response)?;
        // The handshake already authenticated this key; keep the two sources
        // consistent even if the reply omitted it.
        if material.server_public_key.is_empty() {
            material.server_public_key = server_public;
        }

        let _ = socket.close(None).await;
        tracing::info!(device_id = %material.device_id, "Pairing complete");
        Ok(material)
    }

    /// Re-establish trust with paired material and obtain a fresh media token.
    pub async fn reconnect(
        &self,
        device_private_key: &str,
        device_token: &str,
        pinned_server_public_key: &str,
    ) -> Result<ReconnectOutcome> {
        let device_key = KeyPair::from_secret_base64(device_private_key)?;
        let mut socket = self.join("device:reconnect").await?;

        let response = request(
            &mut socket,
            "device:reconnect",
            "key_exchange",
            json!({
                "client_public_key": device_key.public_base64(),
                "device_token": device_token,
            }),
            "2",
        )
        .await?;

        let device_id = response["device_id"]
            .as_str()
            .ok_or_else(|| ClientError::Other("reconnect reply missing device_id".into()))?
            .to_owned();
        let media_token = response["token"]
            .as_str()
            .ok_or_else(|| ClientError::Other("reconnect reply missing token".into()))?
            .to_owned();
        let server_public = response["server_public_key"]
            .as_str()
            .ok_or_else(|| ClientError::Other("reconnect reply missing server key".into()))?;

        // The server must present the key we pinned at pairing.
        if server_public != pinned_server_public_key {
            return Err(ClientError::FingerprintMismatch);
        }

        let session_key = device_key.derive_session_key(&decode_key(server_public)?);

        let _ = socket.close(None).await;
        tracing::info!(device_id = %device_id, "Reconnected");
        Ok(ReconnectOutcome { device_id, media_token, session_key })
    }

    async fn join(&self, topic: &str) -> Result<Socket> {
        let url = format!("{}/gateway", self.gateway_url.trim_end_matches('/'));
        let (mut socket, _) = connect_async(url.as_str())
            .await
            .map_err(TransportError::WebSocket)?;

        let reply = exchange(
            &mut socket,
            &ChannelFrame {
                topic: topic.to_owned(),
                event: "join".into(),
                reference: Some("1".into()),
                payload: Value::Null,
            },
        )
        .await?;
        expect_ok(reply)?;
        Ok(socket)
    }
}

/// Send one event and return the `response` object of an ok reply.
async fn request(
    socket: &mut Socket,
    topic: &str,
    event: &str,
    payload: Value,
    reference: &str,
) -> Result<Value> {
    let reply = exchange(
        socket,
        &ChannelFrame {
            topic: topic.to_owned(),
            event: event.to_owned(),
            reference: Some(reference.to_owned()),
            payload,
        },
    )
    .await?;
    expect_ok(reply)
}

async fn exchange(socket: &mut Socket, frame: &ChannelFrame) -> Result<Value> {
    let text = serde_json::to_string(frame)?;
    socket
        .send(Message::Text(text.into()))
        .await
        .map_err(TransportError::WebSocket)?;

    while let Some(message) = socket.next().await {
        match message.map_err(TransportError::WebSocket)? {
            Message::Text(text) => {
                let reply: ChannelFrame = serde_json::from_str(&text)?;
                if reply.event == "reply" {
                    return Ok(reply.payload);
                }
            }
            Message::Close(_) => break,
            _ => {}
        }
    }
    Err(TransportError::Closed.into())
}

/// Unwrap `{status: ok, response}` or surface the server's reason.
fn expect_ok(payload: Value) -> Result<Value> {
    match payload["status"].as_str() {
        Some("ok") => Ok(payload
            .get("response")
            .cloned()
            .unwrap_or(Value::Null)),
        _ => {
            let reason = payload["reason"].as_str().unwrap_or("unknown").to_owned();
            Err(ClientError::Rejected { reason })
        }
    }
}

/// Write pairing material to the persisted client state.
pub fn persist_material(store: &ClientStore, material: &PairingMaterial) -> Result<()> {
    store.set_string(store::KEY_DEVICE_ID, &material.device_id)?;
    store.set_string(store::KEY_MEDIA_TOKEN, &material.media_token)?;
    store.set_string(store::KEY_DEVICE_PUBLIC_KEY, &material.device_public_key)?;
    store.set_string(store::KEY_DEVICE_PRIVATE_KEY, &material.device_private_key)?;
    store.set_string(store::KEY_DEVICE_TOKEN, &material.device_token)?;
    store.set_string(store::KEY_SERVER_PUBLIC_KEY, &material.server_public_key)?;
    store.set_json(
        store::KEY_DIRECT_URLS,
        serde_json::to_value(&material.direct_urls)?,
    )?;
    if let Some(fingerprint) = &material.cert_fingerprint {
        store.set_string(store::KEY_CERT_FINGERPRINT, fingerprint)?;
    }
    if let Some(instance_id) = &material.instance_id {
        store.set_string(store::KEY_INSTANCE_ID, instance_id)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn material() -> PairingMaterial {
        PairingMaterial {
            device_id: "d-1".into(),
            media_token: "tok".into(),
            device_public_key: "pub".into(),
            device_private_key: "priv".into(),
            device_token: "bearer".into(),
            server_public_key: "server-pub".into(),
            direct_urls: vec!["https://media.example.org:8096".into()],
            cert_fingerprint: Some("AA:BB".into()),
            instance_id: Some("inst-1".into()),
        }
    }

    #[test]
    fn persist_writes_every_key() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(ClientStore::open(dir.path().join("client.json")).unwrap());

        persist_material(&store, &material()).unwrap();

        assert_eq!(store.get_string(store::KEY_DEVICE_ID).as_deref(), Some("d-1"));
        assert_eq!(store.get_string(store::KEY_MEDIA_TOKEN).as_deref(), Some("tok"));
        assert_eq!(
            store.get_string(store::KEY_DEVICE_PRIVATE_KEY).as_deref(),
            Some("priv")
        );
        assert_eq!(
            store.get_string(store::KEY_SERVER_PUBLIC_KEY).as_deref(),
            Some("server-pub")
        );
        assert_eq!(store.direct_urls(), vec!["https://media.example.org:8096".to_string()]);
        assert_eq!(store.get_string(store::KEY_INSTANCE_ID).as_deref(), Some("inst-1"));
    }

    #[test]
    fn rejection_reason_surfaces() {
        let err = expect_ok(json!({ "status": "error", "reason": "claim_code_expired" }))
            .unwrap_err();
        match err {
            ClientError::Rejected { reason } => assert_eq!(reason, "claim_code_expired"),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn material_parses_with_optional_fields_missing() {
        let value = json!({
            "device_id": "d-2",
            "media_token": "t",
            "device_public_key": "pk",
            "device_private_key": "sk",
            "device_token": "bt",
            "server_public_key": "sp",
            "direct_urls": [],
        });
        let material: PairingMaterial = serde_json::from_value(value).unwrap();
        assert!(material.cert_fingerprint.is_none());
        assert!(material.instance_id.is_none());
    }
}
