//! The pairing transaction: claim consumption, device creation, and the
//! claim→device back-link commit together or not at all.

use mydia_common::models::{claim::ClaimCode, device::Device};

use super::{claim_codes, devices};

/// Outcome of a successful pairing transaction.
#[derive(Debug)]
pub struct PairedDevice {
    pub device: Device,
    pub claim: ClaimCode,
}

#[derive(Debug, thiserror::Error)]
pub enum PairingError {
    #[error(transparent)]
    Claim(#[from] claim_codes::ClaimError),

    #[error(transparent)]
    Registry(#[from] devices::RegistryError),

    #[error(transparent)]
    Db(#[from] sqlx::Error),
}

/// Consume `code` and create the device it authorizes.
///
/// Runs as one transaction: if the claim is unusable no device is created,
/// and if device creation fails the claim stays unconsumed.
pub async fn pair_device(
    pool: &sqlx::AnyPool,
    code: &str,
    device_name: &str,
    platform: &str,
    static_public_key: &str,
    device_token_hash: &str,
) -> Result<PairedDevice, PairingError> {
    let mut tx = pool.begin().await.map_err(PairingError::Db)?;

    let claim = match claim_codes::mark_used_tx(&mut tx, code).await.map_err(PairingError::Db)? {
        Some(claim) => claim,
        None => {
            tx.rollback().await.map_err(PairingError::Db)?;
            return Err(claim_codes::classify_failure(pool, code).await.into());
        }
    };

    let device = devices::insert_device_tx(
        &mut tx,
        claim.user_id,
        device_name,
        platform,
        static_public_key,
        device_token_hash,
    )
    .await?;

    let claim = sqlx::query_as::<_, ClaimCode>(
        "UPDATE claim_codes SET device_id = ? WHERE id = ? RETURNING *",
    )
    .bind(device.id.to_string())
    .bind(claim.id.to_string())
    .fetch_one(&mut *tx)
    .await
    .map_err(PairingError::Db)?;

    tx.commit().await.map_err(PairingError::Db)?;

    tracing::info!(device_id = %device.id, user_id = %device.user_id, "Device paired");
    Ok(PairedDevice { device, claim })
}
