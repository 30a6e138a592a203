//! # mydia-gateway
//!
//! WebSocket channel gateway for Mydia's remote-access core. Carries exactly
//! two topics:
//!
//! - `device:pair` — first-time pairing (handshake + claim code)
//! - `device:reconnect` — key exchange for already-paired devices
//!
//! Each connection is owned by one task; frames are processed strictly in
//! arrival order, and handshake state dies with the connection.

pub mod pairing;
pub mod protocol;
pub mod reconnect;

use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    response::Response,
    routing::get,
    Router,
};
use futures_util::{SinkExt, StreamExt};
use mydia_common::{config::AppConfig, crypto::KeyPair};
use mydia_db::Database;
use pairing::PairingChannel;
use protocol::{ChannelFrame, Reason, EVENT_JOIN, TOPIC_PAIR, TOPIC_RECONNECT};
use reconnect::ReconnectChannel;
use serde_json::Value;
use std::sync::Arc;

/// Gateway state shared by all connections.
#[derive(Clone)]
pub struct GatewayState {
    pub db: Database,
    pub config: AppConfig,
    /// The installation's long-lived X25519 identity, unsealed at startup.
    pub server_keypair: Arc<KeyPair>,
}

impl GatewayState {
    pub fn new(db: Database, config: AppConfig, server_keypair: Arc<KeyPair>) -> Self {
        Self { db, config, server_keypair }
    }
}

/// Build the gateway WebSocket router.
pub fn build_router(state: GatewayState) -> Router {
    Router::new()
        .route("/gateway", get(ws_handler))
        .with_state(Arc::new(state))
}

/// WebSocket upgrade handler.
async fn ws_handler(ws: WebSocketUpgrade, State(state): State<Arc<GatewayState>>) -> Response {
    ws.on_upgrade(move |socket| handle_connection(socket, state))
}

/// Per-topic handler, created once the join frame arrives.
enum ChannelHandler {
    Pairing(PairingChannel),
    Reconnect(ReconnectChannel),
}

impl ChannelHandler {
    async fn handle(&mut self, frame: &ChannelFrame) -> ChannelFrame {
        match self {
            Self::Pairing(channel) => channel.handle(frame).await,
            Self::Reconnect(channel) => channel.handle(frame).await,
        }
    }

    fn should_close(&self) -> bool {
        match self {
            Self::Pairing(_) => false,
            Self::Reconnect(channel) => channel.should_close(),
        }
    }
}

/// Handle a single WebSocket connection.
async fn handle_connection(socket: WebSocket, state: Arc<GatewayState>) {
    let (mut sender, mut receiver) = socket.split();

    // The first frame must join one of the two device topics.
    let join = loop {
        match receiver.next().await {
            Some(Ok(Message::Text(text))) => match serde_json::from_str::<ChannelFrame>(&text) {
                Ok(frame) => break frame,
                Err(_) => {
                    let reject = ChannelFrame {
                        topic: String::new(),
                        event: protocol::EVENT_REPLY.to_string(),
                        reference: None,
                        payload: serde_json::json!({
                            "status": "error",
                            "reason": Reason::InvalidMessage.as_wire(),
                        }),
                    };
                    let _ = send_frame(&mut sender, &reject).await;
                    return;
                }
            },
            Some(Ok(Message::Close(_))) | None => return,
            Some(Ok(_)) => continue,
            Some(Err(_)) => return,
        }
    };

    if join.event != EVENT_JOIN {
        let _ = send_frame(&mut sender, &ChannelFrame::reply_error(&join, Reason::InvalidMessage))
            .await;
        return;
    }

    let mut handler = match join.topic.as_str() {
        TOPIC_PAIR => ChannelHandler::Pairing(PairingChannel::new((*state).clone())),
        TOPIC_RECONNECT => ChannelHandler::Reconnect(ReconnectChannel::new((*state).clone())),
        other => {
            tracing::debug!(topic = %other, "Join rejected: unknown topic");
            let _ =
                send_frame(&mut sender, &ChannelFrame::reply_error(&join, Reason::InvalidTopic))
                    .await;
            return;
        }
    };

    tracing::debug!(topic = %join.topic, "Channel joined");
    if send_frame(&mut sender, &ChannelFrame::reply_ok(&join, Value::Null)).await.is_err() {
        return;
    }

    // Frames are handled one at a time; the next frame is not read until the
    // previous reply went out, so handshake state can never interleave.
    while let Some(Ok(message)) = receiver.next().await {
        match message {
            Message::Text(text) => {
                let reply = match serde_json::from_str::<ChannelFrame>(&text) {
                    Ok(frame) => handler.handle(&frame).await,
                    Err(_) => ChannelFrame {
                        topic: join.topic.clone(),
                        event: protocol::EVENT_REPLY.to_string(),
                        reference: None,
                        payload: serde_json::json!({
                            "status": "error",
                            "reason": Reason::InvalidMessage.as_wire(),
                        }),
                    },
                };
                if send_frame(&mut sender, &reply).await.is_err() {
                    break;
                }
                if handler.should_close() {
                    tracing::warn!(topic = %join.topic, "Closing channel after repeated failures");
                    break;
                }
            }
            Message::Close(_) => break,
            _ => {}
        }
    }

    tracing::debug!(topic = %join.topic, "Channel closed");
}

async fn send_frame(
    sender: &mut (impl futures_util::Sink<Message, Error = axum::Error> + Unpin),
    frame: &ChannelFrame,
) -> Result<(), axum::Error> {
    let text = serde_json::to_string(frame)
        .expect("channel frames always serialize");
    sender.send(Message::Text(text.into())).await
}
