//! Device registry — persistent records of paired remote devices.
//!
//! A device row is created once at pairing and afterwards only touched in two
//! ways: `touch_last_seen` on successful reconnect and `revoke` (one-way).
//! Rows are never deleted while claim rows reference them.

use mydia_common::models::device::Device;
use uuid::Uuid;

use super::now_ts;

/// Registry failures that callers must tell apart from plain SQL errors.
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    /// Another non-revoked device already carries this static public key.
    #[error("device with this static public key already exists")]
    Duplicate,

    #[error(transparent)]
    Db(#[from] sqlx::Error),
}

/// Register a new paired device.
///
/// The token hash must already be an argon2 hash; the plaintext token never
/// reaches this layer. Uniqueness of the static public key across active
/// rows is checked inside the same transaction as the insert.
pub async fn create_device(
    pool: &sqlx::AnyPool,
    user_id: Uuid,
    device_name: &str,
    platform: &str,
    static_public_key: &str,
    device_token_hash: &str,
) -> Result<Device, RegistryError> {
    let mut tx = pool.begin().await?;
    let device = insert_device_tx(
        &mut tx,
        user_id,
        device_name,
        platform,
        static_public_key,
        device_token_hash,
    )
    .await?;
    tx.commit().await?;
    Ok(device)
}

/// Insert a device inside an existing transaction (pairing uses this so the
/// claim consumption and the device row commit together).
pub(crate) async fn insert_device_tx(
    tx: &mut sqlx::Transaction<'_, sqlx::Any>,
    user_id: Uuid,
    device_name: &str,
    platform: &str,
    static_public_key: &str,
    device_token_hash: &str,
) -> Result<Device, RegistryError> {
    // The Any driver exposes no portable unique-violation kind, so the
    // active-key check runs in the transaction ahead of the insert. The
    // partial unique index remains the backstop.
    let existing = sqlx::query(
        "SELECT 1 FROM devices WHERE device_static_public_key = ? AND revoked_at IS NULL",
    )
    .bind(static_public_key)
    .fetch_optional(&mut **tx)
    .await?;
    if existing.is_some() {
        return Err(RegistryError::Duplicate);
    }

    let device = sqlx::query_as::<_, Device>(
        r#"
        INSERT INTO devices
            (id, user_id, device_name, platform,
             device_static_public_key, device_token_hash, created_at)
        VALUES (?, ?, ?, ?, ?, ?, ?)
        RETURNING *
        "#,
    )
    .bind(Uuid::new_v4().to_string())
    .bind(user_id.to_string())
    .bind(device_name)
    .bind(platform)
    .bind(static_public_key)
    .bind(device_token_hash)
    .bind(now_ts())
    .fetch_one(&mut **tx)
    .await?;

    Ok(device)
}

/// Find a single device by ID.
pub async fn find_by_id(pool: &sqlx::AnyPool, id: Uuid) -> Result<Option<Device>, sqlx::Error> {
    sqlx::query_as::<_, Device>("SELECT * FROM devices WHERE id = ?")
        .bind(id.to_string())
        .fetch_optional(pool)
        .await
}

/// Find a device by its static public key. Returns revoked rows too —
/// reconnect handlers collapse revoked and missing into one answer, which is
/// their decision, not this layer's.
pub async fn find_by_public_key(
    pool: &sqlx::AnyPool,
    static_public_key: &str,
) -> Result<Option<Device>, sqlx::Error> {
    sqlx::query_as::<_, Device>(
        "SELECT * FROM devices WHERE device_static_public_key = ? ORDER BY created_at DESC LIMIT 1",
    )
    .bind(static_public_key)
    .fetch_optional(pool)
    .await
}

/// List all devices belonging to a user, newest first.
pub async fn list_user_devices(
    pool: &sqlx::AnyPool,
    user_id: Uuid,
) -> Result<Vec<Device>, sqlx::Error> {
    sqlx::query_as::<_, Device>(
        "SELECT * FROM devices WHERE user_id = ? ORDER BY created_at DESC",
    )
    .bind(user_id.to_string())
    .fetch_all(pool)
    .await
}

/// Revoke a device. Idempotent: an already-revoked row keeps its original
/// `revoked_at`. Returns the row as it stands after the call.
pub async fn revoke_device(
    pool: &sqlx::AnyPool,
    id: Uuid,
) -> Result<Option<Device>, sqlx::Error> {
    sqlx::query_as::<_, Device>(
        r#"
        UPDATE devices
        SET revoked_at = COALESCE(revoked_at, ?)
        WHERE id = ?
        RETURNING *
        "#,
    )
    .bind(now_ts())
    .bind(id.to_string())
    .fetch_optional(pool)
    .await
}

/// Touch last_seen_at for a device.
pub async fn touch_last_seen(pool: &sqlx::AnyPool, id: Uuid) -> Result<(), sqlx::Error> {
    sqlx::query("UPDATE devices SET last_seen_at = ? WHERE id = ?")
        .bind(now_ts())
        .bind(id.to_string())
        .execute(pool)
        .await?;
    Ok(())
}
