//! Manual `sqlx::FromRow<'_, sqlx::any::AnyRow>` implementations for all
//! mydia-common model types.
//!
//! `sqlx::AnyPool` only decodes primitive types natively (i64, f64, bool,
//! String, bytes).  UUID and DateTime columns must be decoded as `String` and
//! then parsed.
//!
//! **Why manual instead of `#[derive(sqlx::FromRow)]`?**
//! The derive macro generates a *blanket* `impl<DB>` with trait bounds.  Rust's
//! coherence checker rejects a manual `impl<AnyRow>` alongside that blanket even
//! when the bounds are never satisfied for `Any`, because a future downstream
//! crate might add the missing impls.  Removing the derive from the struct and
//! writing the AnyRow impl directly sidesteps the conflict entirely.

use chrono::{DateTime, Utc};
use sqlx::{any::AnyRow, Row};
use uuid::Uuid;

use crate::models::{
    claim::ClaimCode,
    device::Device,
    user::{User, UserRole},
};

// ── Internal helpers ──────────────────────────────────────────────────────────

fn uuid(row: &AnyRow, col: &str) -> Result<Uuid, sqlx::Error> {
    let s: String = row.try_get(col)?;
    Uuid::parse_str(&s).map_err(|e| sqlx::Error::Decode(Box::new(e) as _))
}

fn opt_uuid(row: &AnyRow, col: &str) -> Result<Option<Uuid>, sqlx::Error> {
    let s: Option<String> = row.try_get(col)?;
    s.map(|v| Uuid::parse_str(&v).map_err(|e| sqlx::Error::Decode(Box::new(e) as _)))
        .transpose()
}

fn dt(row: &AnyRow, col: &str) -> Result<DateTime<Utc>, sqlx::Error> {
    let s: String = row.try_get(col)?;
    parse_dt(&s).map_err(sqlx::Error::Decode)
}

fn opt_dt(row: &AnyRow, col: &str) -> Result<Option<DateTime<Utc>>, sqlx::Error> {
    let s: Option<String> = row.try_get(col)?;
    s.map(|v| parse_dt(&v).map_err(sqlx::Error::Decode)).transpose()
}

fn parse_dt(
    s: &str,
) -> Result<DateTime<Utc>, Box<dyn std::error::Error + Send + Sync + 'static>> {
    if let Ok(d) = DateTime::parse_from_rfc3339(s) {
        return Ok(d.with_timezone(&Utc));
    }
    if let Ok(d) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S") {
        return Ok(d.and_utc());
    }
    if let Ok(d) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f") {
        return Ok(d.and_utc());
    }
    Err(format!("cannot parse timestamp '{s}'").into())
}

// ── Model impls ──────────────────────────────────────────────────────────────

impl sqlx::FromRow<'_, AnyRow> for User {
    fn from_row(row: &AnyRow) -> Result<Self, sqlx::Error> {
        let role_str: String = row.try_get("role")?;
        let role = UserRole::parse(&role_str).ok_or_else(|| {
            sqlx::Error::Decode(format!("unknown user role '{role_str}'").into())
        })?;
        Ok(User {
            id: uuid(row, "id")?,
            username: row.try_get("username")?,
            password_hash: row.try_get("password_hash")?,
            role,
            created_at: dt(row, "created_at")?,
            updated_at: dt(row, "updated_at")?,
        })
    }
}

impl sqlx::FromRow<'_, AnyRow> for Device {
    fn from_row(row: &AnyRow) -> Result<Self, sqlx::Error> {
        Ok(Device {
            id: uuid(row, "id")?,
            user_id: uuid(row, "user_id")?,
            device_name: row.try_get("device_name")?,
            platform: row.try_get("platform")?,
            device_static_public_key: row.try_get("device_static_public_key")?,
            device_token_hash: row.try_get("device_token_hash")?,
            last_seen_at: opt_dt(row, "last_seen_at")?,
            revoked_at: opt_dt(row, "revoked_at")?,
            created_at: dt(row, "created_at")?,
        })
    }
}

impl sqlx::FromRow<'_, AnyRow> for ClaimCode {
    fn from_row(row: &AnyRow) -> Result<Self, sqlx::Error> {
        Ok(ClaimCode {
            id: uuid(row, "id")?,
            code: row.try_get("code")?,
            user_id: uuid(row, "user_id")?,
            expires_at: dt(row, "expires_at")?,
            used_at: opt_dt(row, "used_at")?,
            device_id: opt_uuid(row, "device_id")?,
            created_at: dt(row, "created_at")?,
        })
    }
}
