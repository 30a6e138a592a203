//! Relay tunnel transport.
//!
//! When the paired server is not directly reachable, requests travel through
//! a relay both ends can reach: the server keeps a persistent connection to
//! the relay, and the client opens a WebSocket identifying the target
//! installation by instance id. Requests are multiplexed over that socket by
//! request id and matched to response frames as they arrive.
//!
//! A timeout waiting for a response frame is a transport failure (retryable);
//! a non-2xx status that did arrive is an application answer and is returned.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use base64::{engine::general_purpose::STANDARD as B64, Engine as _};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::time::timeout;
use tokio_tungstenite::{connect_async, tungstenite::Message};

use crate::error::{ClientError, TransportError};

/// How long to wait for the relay's `tunnel_info` frame.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
/// Default per-request response timeout.
const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Connection options.
#[derive(Debug, Clone)]
pub struct RelayOptions {
    pub request_timeout: Duration,
}

impl Default for RelayOptions {
    fn default() -> Self {
        Self { request_timeout: DEFAULT_REQUEST_TIMEOUT }
    }
}

/// The relay's description of the tunnel it established.
#[derive(Debug, Clone, Deserialize)]
pub struct RelayTunnelInfo {
    pub session_id: String,
    pub instance_id: String,
    /// The target server's static public key, for cross-checking the pin.
    pub public_key_base64: String,
    /// Direct URLs the server advertises; fed to the connection manager for
    /// later direct-connection probing.
    #[serde(default)]
    pub direct_urls: Vec<String>,
}

/// A proxied HTTP response.
#[derive(Debug, Clone)]
pub struct TunnelResponse {
    pub status: u16,
    pub headers: HashMap<String, String>,
    pub body: Vec<u8>,
}

impl TunnelResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn json<T: serde::de::DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_slice(&self.body)
    }
}

type PendingMap = Arc<Mutex<HashMap<u64, oneshot::Sender<TunnelResponse>>>>;

/// One open tunnel to a paired server, shared behind an `Arc`.
pub struct RelayTunnel {
    info: RelayTunnelInfo,
    outbound: mpsc::Sender<Message>,
    pending: PendingMap,
    active: Arc<AtomicBool>,
    next_request_id: AtomicU64,
    request_timeout: Duration,
}

impl RelayTunnel {
    /// Connect to the relay and wait for the tunnel to come up.
    pub async fn connect(relay_url: &str, instance_id: &str) -> Result<Self, TransportError> {
        Self::connect_with_options(relay_url, instance_id, RelayOptions::default()).await
    }

    pub async fn connect_with_options(
        relay_url: &str,
        instance_id: &str,
        options: RelayOptions,
    ) -> Result<Self, TransportError> {
        let url = format!(
            "{}/tunnel?instance_id={}",
            relay_url.trim_end_matches('/'),
            instance_id
        );
        let (socket, _) = connect_async(url.as_str()).await?;
        let (mut sink, mut stream) = socket.split();

        // The relay speaks first: a tunnel_info frame describing the session.
        let info = timeout(CONNECT_TIMEOUT, async {
            while let Some(message) = stream.next().await {
                if let Message::Text(text) = message? {
                    let value: Value = match serde_json::from_str(&text) {
                        Ok(v) => v,
                        Err(_) => continue,
                    };
                    if value["type"] == "tunnel_info" {
                        if let Ok(info) = serde_json::from_value::<RelayTunnelInfo>(value) {
                            return Ok(info);
                        }
                    }
                }
            }
            Err(tokio_tungstenite::tungstenite::Error::ConnectionClosed)
        })
        .await
        .map_err(|_| TransportError::Timeout)??;

        tracing::info!(
            session_id = %info.session_id,
            instance_id = %info.instance_id,
            "Relay tunnel established"
        );

        let (outbound, mut outbound_rx) = mpsc::channel::<Message>(64);
        let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));
        let active = Arc::new(AtomicBool::new(true));

        // Writer: forward queued frames to the socket.
        tokio::spawn(async move {
            while let Some(message) = outbound_rx.recv().await {
                if sink.send(message).await.is_err() {
                    break;
                }
            }
            let _ = sink.close().await;
        });

        // Reader: match response frames to their pending request.
        let reader_pending = pending.clone();
        let reader_active = active.clone();
        tokio::spawn(async move {
            while let Some(Ok(message)) = stream.next().await {
                match message {
                    Message::Text(text) => {
                        let value: Value = match serde_json::from_str(&text) {
                            Ok(v) => v,
                            Err(_) => continue,
                        };
                        if value["type"] != "http_response" {
                            continue;
                        }
                        let Some(id) = value["id"].as_u64() else { continue };
                        let response = parse_response(&value);
                        if let Some(sender) = reader_pending.lock().await.remove(&id) {
                            let _ = sender.send(response);
                        }
                    }
                    Message::Close(_) => break,
                    _ => {}
                }
            }

            // The tunnel is gone; every in-flight request fails fast rather
            // than waiting out its timeout.
            reader_active.store(false, Ordering::SeqCst);
            let drained = reader_pending.lock().await.drain().count();
            if drained > 0 {
                tracing::warn!(count = drained, "Relay tunnel closed with requests in flight");
            }
        });

        Ok(Self {
            info,
            outbound,
            pending,
            active,
            next_request_id: AtomicU64::new(1),
            request_timeout: options.request_timeout,
        })
    }

    pub fn info(&self) -> &RelayTunnelInfo {
        &self.info
    }

    /// Direct URLs advertised by the server through the relay.
    pub fn direct_urls(&self) -> &[String] {
        &self.info.direct_urls
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    /// Proxy one HTTP-like request through the tunnel.
    pub async fn request(
        &self,
        method: &str,
        path: &str,
        headers: &[(&str, &str)],
        body: Option<&[u8]>,
    ) -> Result<TunnelResponse, ClientError> {
        if !self.is_active() {
            return Err(TransportError::NotConnected.into());
        }

        let id = self.next_request_id.fetch_add(1, Ordering::SeqCst);
        let (sender, receiver) = oneshot::channel();
        self.pending.lock().await.insert(id, sender);

        let header_map: HashMap<&str, &str> = headers.iter().copied().collect();
        let frame = json!({
            "type": "http_request",
            "id": id,
            "method": method,
            "path": path,
            "headers": header_map,
            "body": body.map(|b| B64.encode(b)),
        });

        if self
            .outbound
            .send(Message::Text(frame.to_string().into()))
            .await
            .is_err()
        {
            self.pending.lock().await.remove(&id);
            return Err(TransportError::Closed.into());
        }

        match timeout(self.request_timeout, receiver).await {
            Ok(Ok(response)) => Ok(response),
            // Sender dropped: the reader drained us on disconnect.
            Ok(Err(_)) => Err(TransportError::Closed.into()),
            Err(_) => {
                self.pending.lock().await.remove(&id);
                Err(TransportError::Timeout.into())
            }
        }
    }

    /// Close the tunnel. In-flight requests fail with `Closed`.
    pub async fn close(&self) {
        self.active.store(false, Ordering::SeqCst);
        let _ = self.outbound.send(Message::Close(None)).await;
        self.pending.lock().await.clear();
    }

    /// A tunnel that was never connected — routing tests only.
    #[cfg(test)]
    pub(crate) fn disconnected_for_tests() -> Arc<Self> {
        let (outbound, _rx) = mpsc::channel(1);
        Arc::new(Self {
            info: RelayTunnelInfo {
                session_id: "test-session".into(),
                instance_id: "test-instance".into(),
                public_key_base64: String::new(),
                direct_urls: vec![],
            },
            outbound,
            pending: Arc::new(Mutex::new(HashMap::new())),
            active: Arc::new(AtomicBool::new(true)),
            next_request_id: AtomicU64::new(1),
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
        })
    }
}

fn parse_response(value: &Value) -> TunnelResponse {
    let status = value["status"].as_u64().unwrap_or(502) as u16;
    let headers = value["headers"]
        .as_object()
        .map(|o| {
            o.iter()
                .filter_map(|(k, v)| v.as_str().map(|s| (k.clone(), s.to_owned())))
                .collect()
        })
        .unwrap_or_default();
    let body = value["body"]
        .as_str()
        .and_then(|b| B64.decode(b).ok())
        .unwrap_or_default();
    TunnelResponse { status, headers, body }
}
