//! Claim-code issuer — one-time, short-lived pairing codes.
//!
//! A code is usable iff `used_at` is null and `expires_at` is in the future.
//! Consumption is a single conditional UPDATE, so two racing attempts can
//! never both succeed; consumed rows are retained for audit.

use chrono::{Duration, Utc};
use mydia_common::models::claim::ClaimCode;
use rand::{distr::Alphanumeric, Rng};
use uuid::Uuid;

use super::{now_ts, ts};

/// Consumption failures. `NotFound` and `AlreadyUsed` surface identically on
/// the pairing channel; `Expired` gets its own wire reason.
#[derive(Debug, thiserror::Error)]
pub enum ClaimError {
    #[error("claim code not found")]
    NotFound,

    #[error("claim code already used")]
    AlreadyUsed,

    #[error("claim code expired")]
    Expired,

    #[error(transparent)]
    Db(#[from] sqlx::Error),
}

/// Generate a printable claim code.
fn generate_code(length: usize) -> String {
    rand::rng()
        .sample_iter(Alphanumeric)
        .take(length)
        .map(char::from)
        .collect()
}

/// Issue a new claim code for a user.
///
/// The code is cryptographically random; on the rare collision with an
/// existing row the insert is retried with a fresh code.
pub async fn issue(
    pool: &sqlx::AnyPool,
    user_id: Uuid,
    code_length: usize,
    ttl: Duration,
) -> Result<ClaimCode, sqlx::Error> {
    let expires_at = ts(Utc::now() + ttl);

    loop {
        let code = generate_code(code_length);
        let collision = sqlx::query("SELECT 1 FROM claim_codes WHERE code = ?")
            .bind(&code)
            .fetch_optional(pool)
            .await?;
        if collision.is_some() {
            continue;
        }

        return sqlx::query_as::<_, ClaimCode>(
            r#"
            INSERT INTO claim_codes (id, code, user_id, expires_at, created_at)
            VALUES (?, ?, ?, ?, ?)
            RETURNING *
            "#,
        )
        .bind(Uuid::new_v4().to_string())
        .bind(&code)
        .bind(user_id.to_string())
        .bind(&expires_at)
        .bind(now_ts())
        .fetch_one(pool)
        .await;
    }
}

/// Look up a claim code without consuming it.
pub async fn lookup(pool: &sqlx::AnyPool, code: &str) -> Result<Option<ClaimCode>, sqlx::Error> {
    sqlx::query_as::<_, ClaimCode>("SELECT * FROM claim_codes WHERE code = ?")
        .bind(code)
        .fetch_optional(pool)
        .await
}

/// Consume a claim code, binding it to a device.
///
/// Sets `used_at` and `device_id` together, only if the code is currently
/// unused and unexpired. Exactly one of two racing calls wins.
pub async fn consume(
    pool: &sqlx::AnyPool,
    code: &str,
    device_id: Uuid,
) -> Result<ClaimCode, ClaimError> {
    let consumed = sqlx::query_as::<_, ClaimCode>(
        r#"
        UPDATE claim_codes
        SET used_at = ?, device_id = ?
        WHERE code = ? AND used_at IS NULL AND expires_at > ?
        RETURNING *
        "#,
    )
    .bind(now_ts())
    .bind(device_id.to_string())
    .bind(code)
    .bind(now_ts())
    .fetch_optional(pool)
    .await?;

    match consumed {
        Some(claim) => Ok(claim),
        None => Err(classify_failure(pool, code).await),
    }
}

/// Mark a code consumed inside the pairing transaction; the device back-link
/// follows once the device row exists.
pub(crate) async fn mark_used_tx(
    tx: &mut sqlx::Transaction<'_, sqlx::Any>,
    code: &str,
) -> Result<Option<ClaimCode>, sqlx::Error> {
    sqlx::query_as::<_, ClaimCode>(
        r#"
        UPDATE claim_codes
        SET used_at = ?
        WHERE code = ? AND used_at IS NULL AND expires_at > ?
        RETURNING *
        "#,
    )
    .bind(now_ts())
    .bind(code)
    .bind(now_ts())
    .fetch_optional(&mut **tx)
    .await
}

/// Work out why a conditional consume matched nothing.
pub(crate) async fn classify_failure(pool: &sqlx::AnyPool, code: &str) -> ClaimError {
    match lookup(pool, code).await {
        Ok(None) => ClaimError::NotFound,
        Ok(Some(claim)) if claim.is_used() => ClaimError::AlreadyUsed,
        Ok(Some(_)) => ClaimError::Expired,
        Err(e) => ClaimError::Db(e),
    }
}
