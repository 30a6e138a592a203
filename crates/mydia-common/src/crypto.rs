//! Device-pairing crypto primitives.
//!
//! Everything the pairing and reconnect channels need to agree on with
//! remote clients lives here:
//!
//! - **X25519 key pairs** — long-lived server/device static keys and
//!   per-connection ephemerals.
//! - **Session-key derivation** — ECDH followed by HKDF-SHA256, producing a
//!   32-byte key both ends derive independently.
//! - **ChaCha20-Poly1305 AEAD** — ciphertext, nonce, and MAC are carried as
//!   separate fields so field sizes are unambiguous on the wire.
//! - **Private-key sealing** — the server's static private key is stored
//!   encrypted under the deployment application secret.
//!
//! Clients on other platforms derive the same bytes; the vectors in the test
//! module are checked bit-for-bit against the mobile implementations.

use base64::{engine::general_purpose::STANDARD as B64, Engine as _};
use chacha20poly1305::{
    aead::{Aead, AeadCore, KeyInit, OsRng},
    ChaCha20Poly1305, Key, Nonce,
};
use hkdf::Hkdf;
use sha2::{Digest, Sha256};
use x25519_dalek::{PublicKey, StaticSecret};

/// Byte length of X25519 keys and derived session keys.
pub const KEY_LEN: usize = 32;
/// Byte length of the AEAD nonce.
pub const NONCE_LEN: usize = 12;
/// Byte length of the Poly1305 MAC.
pub const MAC_LEN: usize = 16;

/// HKDF info string both sides bind session keys to.
pub const SESSION_KEY_INFO: &[u8] = b"mydia-session-key";

/// Error surfaced by the primitives in this module.
///
/// All AEAD failures collapse into [`CryptoError::DecryptionFailed`] — a
/// tampered ciphertext, MAC, or nonce, a wrong key, and a wrong field size
/// are indistinguishable to callers.
#[derive(Debug, PartialEq, Eq, thiserror::Error)]
pub enum CryptoError {
    #[error("decryption failed")]
    DecryptionFailed,

    #[error("key material is not valid base64 of the expected length")]
    InvalidKey,
}

/// An X25519 key pair. Used for the server static key, device static keys,
/// and per-connection ephemerals alike.
pub struct KeyPair {
    secret: StaticSecret,
    public: PublicKey,
}

impl KeyPair {
    /// Generate a fresh random key pair.
    pub fn generate() -> Self {
        let secret = StaticSecret::random_from_rng(OsRng);
        let public = PublicKey::from(&secret);
        Self { secret, public }
    }

    /// Reconstruct a key pair from raw 32-byte secret material.
    pub fn from_secret_bytes(bytes: [u8; KEY_LEN]) -> Self {
        let secret = StaticSecret::from(bytes);
        let public = PublicKey::from(&secret);
        Self { secret, public }
    }

    /// Reconstruct a key pair from a base64-encoded secret.
    pub fn from_secret_base64(encoded: &str) -> Result<Self, CryptoError> {
        Ok(Self::from_secret_bytes(decode_key(encoded)?))
    }

    pub fn public_bytes(&self) -> [u8; KEY_LEN] {
        *self.public.as_bytes()
    }

    pub fn public_base64(&self) -> String {
        B64.encode(self.public.as_bytes())
    }

    /// Raw secret bytes, for sealing or client-side persistence.
    pub fn secret_bytes(&self) -> [u8; KEY_LEN] {
        self.secret.to_bytes()
    }

    pub fn secret_base64(&self) -> String {
        B64.encode(self.secret.to_bytes())
    }

    /// ECDH with a peer's public key, yielding the raw 32-byte shared secret.
    pub fn diffie_hellman(&self, peer_public: &[u8; KEY_LEN]) -> [u8; KEY_LEN] {
        let peer = PublicKey::from(*peer_public);
        *self.secret.diffie_hellman(&peer).as_bytes()
    }
}

impl std::fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Secret bytes stay out of logs.
        f.debug_struct("KeyPair")
            .field("public", &self.public_base64())
            .finish_non_exhaustive()
    }
}

/// Derive a session key from our secret and a peer public key.
///
/// ECDH to a raw shared secret, then HKDF-SHA256 (extract-then-expand).
/// `salt` defaults to 32 zero bytes and `info` to [`SESSION_KEY_INFO`];
/// both ends must pass the same values.
pub fn derive_session_key(
    ours: &KeyPair,
    peer_public: &[u8; KEY_LEN],
    salt: Option<&[u8]>,
    info: Option<&[u8]>,
) -> [u8; KEY_LEN] {
    let shared = ours.diffie_hellman(peer_public);
    session_key_from_shared(&shared, salt, info)
}

/// HKDF-SHA256 expansion of an already-computed shared secret.
pub fn session_key_from_shared(
    shared: &[u8; KEY_LEN],
    salt: Option<&[u8]>,
    info: Option<&[u8]>,
) -> [u8; KEY_LEN] {
    let zero_salt = [0u8; KEY_LEN];
    let hk = Hkdf::<Sha256>::new(Some(salt.unwrap_or(&zero_salt)), shared);
    let mut okm = [0u8; KEY_LEN];
    hk.expand(info.unwrap_or(SESSION_KEY_INFO), &mut okm)
        .expect("32 bytes is a valid HKDF-SHA256 output length");
    okm
}

/// An AEAD-sealed payload with ciphertext, nonce, and MAC as separate fields.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sealed {
    pub ciphertext: Vec<u8>,
    pub nonce: [u8; NONCE_LEN],
    pub mac: [u8; MAC_LEN],
}

/// Encrypt with ChaCha20-Poly1305 under a random nonce.
pub fn encrypt(plaintext: &[u8], key: &[u8; KEY_LEN]) -> Sealed {
    let nonce = ChaCha20Poly1305::generate_nonce(&mut OsRng);
    encrypt_with_nonce(plaintext, key, &nonce.into())
}

/// Encrypt under a caller-supplied nonce.
///
/// Exposed for cross-platform interop checks; production paths use
/// [`encrypt`], which draws a fresh random nonce per message.
pub fn encrypt_with_nonce(
    plaintext: &[u8],
    key: &[u8; KEY_LEN],
    nonce: &[u8; NONCE_LEN],
) -> Sealed {
    let cipher = ChaCha20Poly1305::new(Key::from_slice(key));
    let mut combined = cipher
        .encrypt(Nonce::from_slice(nonce), plaintext)
        .expect("ChaCha20-Poly1305 encryption is infallible for in-memory payloads");

    // The aead crate appends the 16-byte tag; split it off so the wire
    // carries unambiguous field sizes.
    let mac_start = combined.len() - MAC_LEN;
    let mac: [u8; MAC_LEN] = combined[mac_start..].try_into().expect("tag is 16 bytes");
    combined.truncate(mac_start);

    Sealed { ciphertext: combined, nonce: *nonce, mac }
}

/// Decrypt a [`Sealed`]-shaped payload.
///
/// Field sizes are validated here; any mismatch, like any authentication
/// failure, returns the same [`CryptoError::DecryptionFailed`].
pub fn decrypt(
    ciphertext: &[u8],
    nonce: &[u8],
    mac: &[u8],
    key: &[u8; KEY_LEN],
) -> Result<Vec<u8>, CryptoError> {
    if nonce.len() != NONCE_LEN || mac.len() != MAC_LEN {
        return Err(CryptoError::DecryptionFailed);
    }

    let cipher = ChaCha20Poly1305::new(Key::from_slice(key));
    let mut combined = Vec::with_capacity(ciphertext.len() + MAC_LEN);
    combined.extend_from_slice(ciphertext);
    combined.extend_from_slice(mac);

    cipher
        .decrypt(Nonce::from_slice(nonce), combined.as_slice())
        .map_err(|_| CryptoError::DecryptionFailed)
}

/// A private key sealed at rest: AEAD ciphertext (tag appended) plus nonce.
#[derive(Debug, Clone)]
pub struct SealedKey {
    pub ciphertext: Vec<u8>,
    pub nonce: [u8; NONCE_LEN],
}

/// Seal a 32-byte private key under the deployment application secret.
pub fn seal_private(secret_key: &[u8; KEY_LEN], app_secret: &str) -> SealedKey {
    let sealed = encrypt(secret_key, &sealing_key(app_secret));
    let mut combined = sealed.ciphertext;
    combined.extend_from_slice(&sealed.mac);
    SealedKey { ciphertext: combined, nonce: sealed.nonce }
}

/// Unseal a private key previously sealed with [`seal_private`].
pub fn unseal_private(
    ciphertext: &[u8],
    nonce: &[u8],
    app_secret: &str,
) -> Result<[u8; KEY_LEN], CryptoError> {
    if ciphertext.len() < MAC_LEN {
        return Err(CryptoError::DecryptionFailed);
    }
    let (body, mac) = ciphertext.split_at(ciphertext.len() - MAC_LEN);
    let plaintext = decrypt(body, nonce, mac, &sealing_key(app_secret))?;
    plaintext.try_into().map_err(|_| CryptoError::DecryptionFailed)
}

fn sealing_key(app_secret: &str) -> [u8; KEY_LEN] {
    let digest = Sha256::digest(app_secret.as_bytes());
    digest.into()
}

/// Decode a base64-encoded 32-byte key.
pub fn decode_key(encoded: &str) -> Result<[u8; KEY_LEN], CryptoError> {
    let bytes = B64.decode(encoded).map_err(|_| CryptoError::InvalidKey)?;
    bytes.try_into().map_err(|_| CryptoError::InvalidKey)
}

/// Encode arbitrary bytes to base64 (standard alphabet, padded).
pub fn to_base64(bytes: &[u8]) -> String {
    B64.encode(bytes)
}

/// Decode base64 to bytes, returning `None` on failure.
pub fn from_base64(encoded: &str) -> Option<Vec<u8>> {
    B64.decode(encoded).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_keypairs_are_distinct() {
        let a = KeyPair::generate();
        let b = KeyPair::generate();
        assert_ne!(a.public_bytes(), b.public_bytes());
        assert_ne!(a.secret_bytes(), b.secret_bytes());
        assert_ne!(a.public_bytes(), a.secret_bytes());
    }

    #[test]
    fn ecdh_agrees_both_directions() {
        let a = KeyPair::generate();
        let b = KeyPair::generate();
        let k1 = derive_session_key(&a, &b.public_bytes(), None, None);
        let k2 = derive_session_key(&b, &a.public_bytes(), None, None);
        assert_eq!(k1, k2);
        assert_eq!(k1.len(), KEY_LEN);
    }

    #[test]
    fn aead_round_trip() {
        let key = [7u8; KEY_LEN];
        let sealed = encrypt(b"media access handshake payload", &key);
        let plain = decrypt(&sealed.ciphertext, &sealed.nonce, &sealed.mac, &key).unwrap();
        assert_eq!(plain, b"media access handshake payload");
    }

    #[test]
    fn tampering_fails_uniformly() {
        let key = [9u8; KEY_LEN];
        let sealed = encrypt(b"payload", &key);

        let mut ct = sealed.ciphertext.clone();
        ct[0] ^= 0x01;
        assert_eq!(
            decrypt(&ct, &sealed.nonce, &sealed.mac, &key),
            Err(CryptoError::DecryptionFailed)
        );

        let mut mac = sealed.mac;
        mac[0] ^= 0x01;
        assert_eq!(
            decrypt(&sealed.ciphertext, &sealed.nonce, &mac, &key),
            Err(CryptoError::DecryptionFailed)
        );

        let mut nonce = sealed.nonce;
        nonce[0] ^= 0x01;
        assert_eq!(
            decrypt(&sealed.ciphertext, &nonce, &sealed.mac, &key),
            Err(CryptoError::DecryptionFailed)
        );

        let wrong_key = [8u8; KEY_LEN];
        assert_eq!(
            decrypt(&sealed.ciphertext, &sealed.nonce, &sealed.mac, &wrong_key),
            Err(CryptoError::DecryptionFailed)
        );

        // Wrong field sizes are indistinguishable from tampering.
        assert_eq!(
            decrypt(&sealed.ciphertext, &sealed.nonce[..8], &sealed.mac, &key),
            Err(CryptoError::DecryptionFailed)
        );
        assert_eq!(
            decrypt(&sealed.ciphertext, &sealed.nonce, &sealed.mac[..8], &key),
            Err(CryptoError::DecryptionFailed)
        );
    }

    #[test]
    fn nonces_are_unique_per_message() {
        let key = [3u8; KEY_LEN];
        let a = encrypt(b"same plaintext", &key);
        let b = encrypt(b"same plaintext", &key);
        assert_ne!(a.nonce, b.nonce);
        assert_ne!(a.ciphertext, b.ciphertext);
    }

    #[test]
    fn seal_unseal_round_trip() {
        let kp = KeyPair::generate();
        let sealed = seal_private(&kp.secret_bytes(), "app-secret");
        let restored = unseal_private(&sealed.ciphertext, &sealed.nonce, "app-secret").unwrap();
        assert_eq!(restored, kp.secret_bytes());

        assert_eq!(
            unseal_private(&sealed.ciphertext, &sealed.nonce, "wrong-secret"),
            Err(CryptoError::DecryptionFailed)
        );
    }

    #[test]
    fn decode_key_rejects_bad_input() {
        assert_eq!(decode_key("not base64!!"), Err(CryptoError::InvalidKey));
        assert_eq!(decode_key(&B64.encode([0u8; 16])), Err(CryptoError::InvalidKey));
    }

    // Fixed vectors shared with the Flutter client; these must match
    // bit-for-bit on every platform.

    const ALICE_SECRET: &str = "dwdtCnMYpX08FsFyUbJmRd9ML4frwJkqsXf7pR25LCo=";
    const BOB_SECRET: &str = "XasIfmJKikt54X+Lg4AO5m87sSkmGLb9HC+LJ/+I4Os=";
    const SHARED_SECRET: &str = "Sl2dW6TOLeFyjjv0gDUPJeB+IclH0Z4zdvCbPB4WF0I=";
    const SESSION_KEY: &str = "O4JgYEVzaUyxG0tuQz5E1ptxX2qcdrjbrY43QLM+xQw=";
    const FIXED_NONCE: &str = "AAAAAAAAAAAAAAAB";

    #[test]
    fn interop_ecdh_and_session_key() {
        let alice = KeyPair::from_secret_base64(ALICE_SECRET).unwrap();
        let bob = KeyPair::from_secret_base64(BOB_SECRET).unwrap();

        let shared = alice.diffie_hellman(&bob.public_bytes());
        assert_eq!(to_base64(&shared), SHARED_SECRET);
        assert_eq!(shared, bob.diffie_hellman(&alice.public_bytes()));

        let session = session_key_from_shared(&shared, None, None);
        assert_eq!(to_base64(&session), SESSION_KEY);
    }

    #[test]
    fn interop_encrypt_under_session_key() {
        let key = decode_key(SESSION_KEY).unwrap();
        let nonce: [u8; NONCE_LEN] =
            from_base64(FIXED_NONCE).unwrap().try_into().unwrap();

        let sealed = encrypt_with_nonce(b"Hello from Elixir to Flutter!", &key, &nonce);
        assert_eq!(to_base64(&sealed.ciphertext), "FR87tXgCzdKEwRwego00v8WLjSpKQEpYhstK60k=");
        assert_eq!(to_base64(&sealed.mac), "dKLBE7tTUEB2tIOy3B9qHw==");

        let plain = decrypt(&sealed.ciphertext, &sealed.nonce, &sealed.mac, &key).unwrap();
        assert_eq!(plain, b"Hello from Elixir to Flutter!");
    }

    #[test]
    fn interop_encrypt_fixed_key() {
        let key = decode_key("qw1cYyAG63Ob8gMI9lgxhE+ejdxGIrrGDYsFwnOiwFQ=").unwrap();
        let nonce: [u8; NONCE_LEN] =
            from_base64(FIXED_NONCE).unwrap().try_into().unwrap();

        let sealed = encrypt_with_nonce(b"Hello, World!", &key, &nonce);
        assert_eq!(to_base64(&sealed.ciphertext), "sx9ZlIqKK5vS9Afj+A==");
        assert_eq!(to_base64(&sealed.mac), "YfqcJ3IcQw0+Lrw9MnwjtA==");
    }
}
