//! Paired device model.
//!
//! A device is a remote endpoint that completed pairing once. It carries the
//! static public key it proves possession of on every reconnect and the hash
//! of its opaque bearer token. Revocation is one-way: a revoked row is kept
//! (claim rows reference it) and every gate rejects it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use validator::Validate;

/// A paired remote device.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Device {
    /// Opaque, server-generated device ID
    pub id: Uuid,

    /// Owning user
    pub user_id: Uuid,

    /// Free-form name shown in device lists ("Living-room tablet")
    pub device_name: String,

    /// Free-form platform tag ("iOS", "Android", "macOS")
    pub platform: String,

    /// X25519 static public key, base64 (32 bytes decoded).
    /// Unique across all non-revoked devices.
    pub device_static_public_key: String,

    /// Argon2id hash of the device bearer token. The token itself is
    /// returned to the client exactly once at pairing and never stored.
    #[serde(skip_serializing)]
    pub device_token_hash: String,

    /// Updated on every successful reconnect
    pub last_seen_at: Option<DateTime<Utc>>,

    /// Non-null means the device is revoked; the transition is one-way.
    pub revoked_at: Option<DateTime<Utc>>,

    pub created_at: DateTime<Utc>,
}

impl Device {
    pub fn is_revoked(&self) -> bool {
        self.revoked_at.is_some()
    }
}

/// Device representation for API responses.
#[derive(Debug, Serialize)]
pub struct DeviceResponse {
    pub id: Uuid,
    pub device_name: String,
    pub platform: String,
    pub last_seen_at: Option<DateTime<Utc>>,
    pub revoked_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl From<Device> for DeviceResponse {
    fn from(d: Device) -> Self {
        Self {
            id: d.id,
            device_name: d.device_name,
            platform: d.platform,
            last_seen_at: d.last_seen_at,
            revoked_at: d.revoked_at,
            created_at: d.created_at,
        }
    }
}

/// Claim-code issuance request.
#[derive(Debug, Deserialize, Validate)]
pub struct IssueClaimCodeRequest {
    /// Minutes until the code expires; capped server-side.
    #[validate(range(min = 1, max = 60, message = "TTL must be 1-60 minutes"))]
    pub ttl_mins: Option<i64>,
}
