//! Certificate fingerprints and the trust-on-first-use store.
//!
//! Fingerprints are the SHA-256 of the leaf certificate's DER bytes,
//! rendered as uppercase hex pairs joined with `:`. The store maps a paired
//! instance id to the fingerprint observed at pairing time; the first
//! verification with no prior entry stores it, every later one requires
//! equality.

use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::io;
use std::sync::Arc;
use subtle::ConstantTimeEq;

use crate::store::ClientStore;

const STORE_KEY: &str = "cert_fingerprints";

/// Compute the colon-separated SHA-256 fingerprint of certificate DER bytes.
pub fn fingerprint(cert_der: &[u8]) -> String {
    let digest = Sha256::digest(cert_der);
    digest
        .iter()
        .map(|b| format!("{b:02X}"))
        .collect::<Vec<_>>()
        .join(":")
}

/// Group a fingerprint for human display, `bytes_per_line` bytes per line.
pub fn format_for_display(fp: &str, bytes_per_line: usize) -> String {
    let parts: Vec<&str> = fp.split(':').collect();
    parts
        .chunks(bytes_per_line.max(1))
        .map(|chunk| chunk.join(":"))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Constant-time fingerprint equality. Differing lengths fail immediately,
/// which leaks nothing an attacker doesn't already know.
pub fn fingerprints_equal(a: &str, b: &str) -> bool {
    a.len() == b.len() && a.as_bytes().ct_eq(b.as_bytes()).into()
}

/// Outcome of a TOFU verification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerifyOutcome {
    /// No prior entry; the observed fingerprint is now stored.
    TrustedFirstUse,
    /// Matched the stored fingerprint.
    Verified,
    /// Did not match the stored fingerprint.
    Mismatch,
}

/// Persistent instance-id → fingerprint map.
#[derive(Clone)]
pub struct FingerprintStore {
    store: Arc<ClientStore>,
}

impl FingerprintStore {
    pub fn new(store: Arc<ClientStore>) -> Self {
        Self { store }
    }

    /// The stored fingerprint for an instance, if any.
    pub fn lookup(&self, instance_id: &str) -> Option<String> {
        self.map().get(instance_id).cloned()
    }

    /// Explicitly pin a certificate for an instance.
    pub fn trust(&self, instance_id: &str, cert_der: &[u8]) -> io::Result<()> {
        let mut map = self.map();
        map.insert(instance_id.to_owned(), fingerprint(cert_der));
        self.save(&map)
    }

    /// Verify a certificate against the stored entry, trusting on first use.
    pub fn verify(&self, instance_id: &str, cert_der: &[u8]) -> io::Result<VerifyOutcome> {
        let observed = fingerprint(cert_der);
        match self.lookup(instance_id) {
            None => {
                let mut map = self.map();
                map.insert(instance_id.to_owned(), observed);
                self.save(&map)?;
                Ok(VerifyOutcome::TrustedFirstUse)
            }
            Some(stored) if fingerprints_equal(&stored, &observed) => Ok(VerifyOutcome::Verified),
            Some(_) => {
                tracing::warn!(instance_id, "Certificate fingerprint mismatch");
                Ok(VerifyOutcome::Mismatch)
            }
        }
    }

    /// Drop the entry for an instance (re-pairing flow).
    pub fn forget(&self, instance_id: &str) -> io::Result<()> {
        let mut map = self.map();
        map.remove(instance_id);
        self.save(&map)
    }

    fn map(&self) -> HashMap<String, String> {
        self.store
            .get_json(STORE_KEY)
            .and_then(|v| serde_json::from_value(v).ok())
            .unwrap_or_default()
    }

    fn save(&self, map: &HashMap<String, String>) -> io::Result<()> {
        let value = serde_json::to_value(map)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        self.store.set_json(STORE_KEY, value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_store() -> (tempfile::TempDir, FingerprintStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = ClientStore::open(dir.path().join("client.json")).unwrap();
        (dir, FingerprintStore::new(Arc::new(store)))
    }

    #[test]
    fn fingerprint_format() {
        let fp = fingerprint(b"certificate bytes");
        assert_eq!(fp.split(':').count(), 32);
        assert!(fp
            .split(':')
            .all(|p| p.len() == 2 && p.chars().all(|c| c.is_ascii_hexdigit())));
        assert_eq!(fp, fp.to_uppercase());
    }

    #[test]
    fn display_grouping() {
        let fp = fingerprint(b"x");
        let grouped = format_for_display(&fp, 16);
        let lines: Vec<&str> = grouped.lines().collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0].split(':').count(), 16);
        assert_eq!(lines[1].split(':').count(), 16);
    }

    #[test]
    fn first_use_stores_then_pins() {
        let (_dir, store) = test_store();

        assert_eq!(
            store.verify("inst", b"cert-a").unwrap(),
            VerifyOutcome::TrustedFirstUse
        );
        assert_eq!(store.verify("inst", b"cert-a").unwrap(), VerifyOutcome::Verified);
        assert_eq!(store.verify("inst", b"cert-b").unwrap(), VerifyOutcome::Mismatch);

        // A mismatch must not overwrite the pin.
        assert_eq!(store.verify("inst", b"cert-a").unwrap(), VerifyOutcome::Verified);
    }

    #[test]
    fn trust_then_verify_other_cert_fails() {
        let (_dir, store) = test_store();
        store.trust("inst", b"cert-a").unwrap();
        assert_eq!(store.verify("inst", b"cert-a").unwrap(), VerifyOutcome::Verified);
        assert_eq!(store.verify("inst", b"cert-b").unwrap(), VerifyOutcome::Mismatch);
    }

    #[test]
    fn instances_are_independent() {
        let (_dir, store) = test_store();
        store.trust("one", b"cert-a").unwrap();
        assert_eq!(
            store.verify("two", b"cert-b").unwrap(),
            VerifyOutcome::TrustedFirstUse
        );
        assert_eq!(store.verify("one", b"cert-a").unwrap(), VerifyOutcome::Verified);
    }
}
