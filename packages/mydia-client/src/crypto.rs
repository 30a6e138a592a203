//! Client-side key material.
//!
//! The client end of the pairing and reconnect exchanges: X25519 key pairs
//! and the HKDF-SHA256 session-key derivation. The server derives the same
//! bytes; the shared fixed vectors are asserted in both test suites.

use base64::{engine::general_purpose::STANDARD as B64, Engine as _};
use hkdf::Hkdf;
use rand_core::OsRng;
use sha2::Sha256;
use x25519_dalek::{PublicKey, StaticSecret};

use crate::error::ClientError;

/// Byte length of keys on this protocol.
pub const KEY_LEN: usize = 32;

/// HKDF info string both sides bind session keys to.
const SESSION_KEY_INFO: &[u8] = b"mydia-session-key";

/// An X25519 key pair — the device static identity or a per-connection
/// ephemeral.
pub struct KeyPair {
    secret: StaticSecret,
    public: PublicKey,
}

impl KeyPair {
    pub fn generate() -> Self {
        let secret = StaticSecret::random_from_rng(OsRng);
        let public = PublicKey::from(&secret);
        Self { secret, public }
    }

    pub fn from_secret_bytes(bytes: [u8; KEY_LEN]) -> Self {
        let secret = StaticSecret::from(bytes);
        let public = PublicKey::from(&secret);
        Self { secret, public }
    }

    pub fn from_secret_base64(encoded: &str) -> Result<Self, ClientError> {
        Ok(Self::from_secret_bytes(decode_key(encoded)?))
    }

    pub fn public_bytes(&self) -> [u8; KEY_LEN] {
        *self.public.as_bytes()
    }

    pub fn public_base64(&self) -> String {
        B64.encode(self.public.as_bytes())
    }

    pub fn secret_base64(&self) -> String {
        B64.encode(self.secret.to_bytes())
    }

    /// Derive the session key shared with a peer: ECDH, then HKDF-SHA256
    /// with a 32-zero-byte salt and the protocol info string.
    pub fn derive_session_key(&self, peer_public: &[u8; KEY_LEN]) -> [u8; KEY_LEN] {
        let peer = PublicKey::from(*peer_public);
        let shared = self.secret.diffie_hellman(&peer);

        let salt = [0u8; KEY_LEN];
        let hk = Hkdf::<Sha256>::new(Some(&salt), shared.as_bytes());
        let mut okm = [0u8; KEY_LEN];
        hk.expand(SESSION_KEY_INFO, &mut okm)
            .expect("32 bytes is a valid HKDF-SHA256 output length");
        okm
    }
}

impl std::fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyPair")
            .field("public", &self.public_base64())
            .finish_non_exhaustive()
    }
}

/// Decode a base64-encoded 32-byte key.
pub fn decode_key(encoded: &str) -> Result<[u8; KEY_LEN], ClientError> {
    let bytes = B64
        .decode(encoded)
        .map_err(|_| ClientError::Other("key material is not valid base64".into()))?;
    bytes
        .try_into()
        .map_err(|_| ClientError::Other("key material has the wrong length".into()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_key_matches_server_derivation() {
        // Fixed vectors shared with the server and mobile implementations.
        let alice =
            KeyPair::from_secret_base64("dwdtCnMYpX08FsFyUbJmRd9ML4frwJkqsXf7pR25LCo=").unwrap();
        let bob =
            KeyPair::from_secret_base64("XasIfmJKikt54X+Lg4AO5m87sSkmGLb9HC+LJ/+I4Os=").unwrap();

        let key = alice.derive_session_key(&bob.public_bytes());
        assert_eq!(B64.encode(key), "O4JgYEVzaUyxG0tuQz5E1ptxX2qcdrjbrY43QLM+xQw=");
        assert_eq!(key, bob.derive_session_key(&alice.public_bytes()));
    }

    #[test]
    fn generated_pairs_are_distinct() {
        let a = KeyPair::generate();
        let b = KeyPair::generate();
        assert_ne!(a.public_bytes(), b.public_bytes());
    }
}
