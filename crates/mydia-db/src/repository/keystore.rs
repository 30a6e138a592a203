//! Server key pair storage.
//!
//! Each installation possesses a single long-lived X25519 key pair. Clients
//! pin the public half at pairing time and the private half proves the
//! server's identity on every handshake, so it is sealed under the
//! application secret before it touches the database. On startup the row is
//! loaded, or generated and persisted on first run.

use anyhow::{anyhow, Result};
use base64::{engine::general_purpose::STANDARD as B64, Engine as _};
use mydia_common::crypto::{self, KeyPair};
use sqlx::{any::AnyRow, Row};

use super::now_ts;

/// The persisted (sealed) form of the server key pair.
#[derive(Debug)]
pub struct StoredServerKey {
    pub public_key: String,
    pub private_key_sealed: String,
    pub private_key_nonce: String,
}

impl sqlx::FromRow<'_, AnyRow> for StoredServerKey {
    fn from_row(row: &AnyRow) -> Result<Self, sqlx::Error> {
        Ok(StoredServerKey {
            public_key: row.try_get("public_key")?,
            private_key_sealed: row.try_get("private_key_sealed")?,
            private_key_nonce: row.try_get("private_key_nonce")?,
        })
    }
}

/// Fetch the singleton key row, if present.
pub async fn load(pool: &sqlx::AnyPool) -> Result<Option<StoredServerKey>, sqlx::Error> {
    sqlx::query_as::<_, StoredServerKey>(
        "SELECT public_key, private_key_sealed, private_key_nonce FROM server_keys WHERE id = 1",
    )
    .fetch_optional(pool)
    .await
}

/// Load the server key pair, generating and persisting one on first run.
///
/// The private key is unsealed with `app_secret`; a wrong secret (for
/// example after a config change) fails loudly rather than generating a new
/// identity that would break every paired client.
pub async fn load_or_generate(pool: &sqlx::AnyPool, app_secret: &str) -> Result<KeyPair> {
    if let Some(stored) = load(pool).await? {
        let ciphertext = B64
            .decode(&stored.private_key_sealed)
            .map_err(|_| anyhow!("server key row is corrupt: sealed key is not base64"))?;
        let nonce = B64
            .decode(&stored.private_key_nonce)
            .map_err(|_| anyhow!("server key row is corrupt: nonce is not base64"))?;

        let secret = crypto::unseal_private(&ciphertext, &nonce, app_secret)
            .map_err(|_| anyhow!("cannot unseal server private key; has the app secret changed?"))?;
        let keypair = KeyPair::from_secret_bytes(secret);

        if keypair.public_base64() != stored.public_key {
            return Err(anyhow!("server key row is corrupt: public key mismatch"));
        }
        return Ok(keypair);
    }

    let keypair = KeyPair::generate();
    let sealed = crypto::seal_private(&keypair.secret_bytes(), app_secret);

    sqlx::query(
        r#"
        INSERT INTO server_keys (id, public_key, private_key_sealed, private_key_nonce, created_at)
        VALUES (1, ?, ?, ?, ?)
        "#,
    )
    .bind(keypair.public_base64())
    .bind(B64.encode(&sealed.ciphertext))
    .bind(B64.encode(sealed.nonce))
    .bind(now_ts())
    .execute(pool)
    .await?;

    tracing::info!(public_key = %keypair.public_base64(), "Generated server key pair");
    Ok(keypair)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::memory_db;

    #[tokio::test]
    async fn generate_then_load_round_trips() {
        let db = memory_db().await;

        let generated = load_or_generate(&db.pool, "app-secret").await.unwrap();
        let loaded = load_or_generate(&db.pool, "app-secret").await.unwrap();

        assert_eq!(generated.public_base64(), loaded.public_base64());
        assert_eq!(generated.secret_bytes(), loaded.secret_bytes());
    }

    #[tokio::test]
    async fn wrong_app_secret_fails_instead_of_regenerating() {
        let db = memory_db().await;

        load_or_generate(&db.pool, "app-secret").await.unwrap();
        let err = load_or_generate(&db.pool, "other-secret").await.unwrap_err();
        assert!(err.to_string().contains("unseal"));
    }
}
