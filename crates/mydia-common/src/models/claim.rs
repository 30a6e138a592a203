//! One-time claim codes binding a pairing attempt to a pre-authorized user.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A human-enterable one-time pairing code.
///
/// Usable iff `used_at` is null and `expires_at` is in the future.
/// Consumed rows are retained for audit; `used_at` and `device_id` are set
/// together or not at all.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClaimCode {
    pub id: Uuid,

    /// Short printable code, cryptographically random, unique.
    pub code: String,

    /// The user this pairing will bind to.
    pub user_id: Uuid,

    pub expires_at: DateTime<Utc>,

    /// Set exactly once, when the code is consumed.
    pub used_at: Option<DateTime<Utc>>,

    /// The device created by consuming this code.
    pub device_id: Option<Uuid>,

    pub created_at: DateTime<Utc>,
}

impl ClaimCode {
    pub fn is_used(&self) -> bool {
        self.used_at.is_some()
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}
