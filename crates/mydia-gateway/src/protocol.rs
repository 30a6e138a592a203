//! Channel wire protocol.
//!
//! A connection carries exactly one topic, joined with the first frame.
//! Every frame is `{topic, event, ref, payload}`; binary payload fields are
//! base64. Rejections always carry a machine-readable `reason` string —
//! internally those are a closed enum, mapped to the wire tokens here at the
//! boundary.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

/// Topic of the first-time pairing channel.
pub const TOPIC_PAIR: &str = "device:pair";
/// Topic of the reconnect channel.
pub const TOPIC_RECONNECT: &str = "device:reconnect";

/// Event name that opens a channel.
pub const EVENT_JOIN: &str = "join";
/// Event name of every server reply.
pub const EVENT_REPLY: &str = "reply";

/// One frame on the channel link.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelFrame {
    pub topic: String,
    pub event: String,
    /// Correlation id echoed back in the reply.
    #[serde(rename = "ref", default, skip_serializing_if = "Option::is_none")]
    pub reference: Option<String>,
    #[serde(default)]
    pub payload: Value,
}

impl ChannelFrame {
    /// Successful reply to `request`, carrying `response` under `status: ok`.
    pub fn reply_ok(request: &ChannelFrame, response: Value) -> Self {
        Self {
            topic: request.topic.clone(),
            event: EVENT_REPLY.to_string(),
            reference: request.reference.clone(),
            payload: json!({ "status": "ok", "response": response }),
        }
    }

    /// Rejection reply to `request` with a wire reason.
    pub fn reply_error(request: &ChannelFrame, reason: Reason) -> Self {
        Self {
            topic: request.topic.clone(),
            event: EVENT_REPLY.to_string(),
            reference: request.reference.clone(),
            payload: json!({ "status": "error", "reason": reason.as_wire() }),
        }
    }
}

/// Every reason a channel frame can be rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reason {
    /// Malformed base64, wrong length, unparseable payload.
    InvalidMessage,
    /// Join attempted on an unknown topic.
    InvalidTopic,
    /// Claim code not found, or found but already used.
    InvalidClaimCode,
    /// Claim code present but past its expiry.
    ClaimCodeExpired,
    /// `claim_code` sent before the handshake succeeded.
    HandshakeIncomplete,
    /// Reconnect key unknown — or the device is revoked; the two are
    /// indistinguishable on purpose.
    DeviceNotFound,
    /// Device token failed verification.
    InvalidDeviceToken,
    /// Deprecated `handshake_init` received; clients must send `key_exchange`.
    UseKeyExchange,
}

impl Reason {
    pub fn as_wire(self) -> &'static str {
        match self {
            Self::InvalidMessage => "invalid_message",
            Self::InvalidTopic => "invalid_topic",
            Self::InvalidClaimCode => "invalid_claim_code",
            Self::ClaimCodeExpired => "claim_code_expired",
            Self::HandshakeIncomplete => "handshake_incomplete",
            Self::DeviceNotFound => "device_not_found",
            Self::InvalidDeviceToken => "invalid_device_token",
            Self::UseKeyExchange => "use_key_exchange",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_round_trips_with_ref() {
        let frame = ChannelFrame {
            topic: TOPIC_PAIR.into(),
            event: "pairing_handshake".into(),
            reference: Some("42".into()),
            payload: json!({ "public_key": "AAAA" }),
        };
        let text = serde_json::to_string(&frame).unwrap();
        assert!(text.contains(r#""ref":"42""#));
        let parsed: ChannelFrame = serde_json::from_str(&text).unwrap();
        assert_eq!(parsed.reference.as_deref(), Some("42"));
    }

    #[test]
    fn error_reply_carries_wire_reason() {
        let request = ChannelFrame {
            topic: TOPIC_RECONNECT.into(),
            event: "key_exchange".into(),
            reference: Some("1".into()),
            payload: Value::Null,
        };
        let reply = ChannelFrame::reply_error(&request, Reason::DeviceNotFound);
        assert_eq!(reply.payload["reason"], "device_not_found");
        assert_eq!(reply.payload["status"], "error");
        assert_eq!(reply.reference.as_deref(), Some("1"));
    }
}
