//! Repository modules — all SQL lives here.

pub mod claim_codes;
pub mod devices;
pub mod keystore;
pub mod pairing;
pub mod users;

use chrono::{DateTime, SecondsFormat, Utc};

/// Render a timestamp the way every table stores it: RFC 3339, UTC,
/// microsecond precision. The fixed width keeps TEXT comparisons
/// (`expires_at > ?`) correct on both backends.
pub(crate) fn ts(t: DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub(crate) fn now_ts() -> String {
    ts(Utc::now())
}
