//! Persisted client state.
//!
//! Everything the client owns after pairing lives in one JSON file behind a
//! mutex: the server's pinned public key, the device key pair and token, the
//! last-known direct URLs, and the connection manager's startup hints.
//! Writes go to a temp file and rename into place, so a value that was
//! `set` is durable before any later read observes it.

use serde_json::Value;
use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

// Well-known keys.
pub const KEY_SERVER_PUBLIC_KEY: &str = "server_public_key";
pub const KEY_DIRECT_URLS: &str = "pairing_direct_urls";
pub const KEY_DEVICE_ID: &str = "pairing_device_id";
pub const KEY_DEVICE_TOKEN: &str = "pairing_device_token";
pub const KEY_MEDIA_TOKEN: &str = "pairing_media_token";
pub const KEY_DEVICE_PUBLIC_KEY: &str = "pairing_device_public_key";
pub const KEY_DEVICE_PRIVATE_KEY: &str = "pairing_device_private_key";
pub const KEY_CERT_FINGERPRINT: &str = "pairing_cert_fingerprint";
pub const KEY_INSTANCE_ID: &str = "instance_id";
pub const KEY_LAST_CONNECTION_TYPE: &str = "connection_last_type";
pub const KEY_LAST_CONNECTION_URL: &str = "connection_last_url";

/// A small durable key-value store over one JSON file.
pub struct ClientStore {
    path: PathBuf,
    entries: Mutex<HashMap<String, Value>>,
}

impl ClientStore {
    /// Open (or create) the store at `path`.
    pub fn open(path: impl Into<PathBuf>) -> io::Result<Self> {
        let path = path.into();
        let entries = match fs::read(&path) {
            Ok(bytes) => serde_json::from_slice(&bytes)
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?,
            Err(e) if e.kind() == io::ErrorKind::NotFound => HashMap::new(),
            Err(e) => return Err(e),
        };
        Ok(Self { path, entries: Mutex::new(entries) })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn get_string(&self, key: &str) -> Option<String> {
        let entries = self.entries.lock().unwrap();
        entries.get(key).and_then(|v| v.as_str().map(str::to_owned))
    }

    pub fn get_json(&self, key: &str) -> Option<Value> {
        self.entries.lock().unwrap().get(key).cloned()
    }

    pub fn set_string(&self, key: &str, value: &str) -> io::Result<()> {
        self.set_json(key, Value::String(value.to_owned()))
    }

    pub fn set_json(&self, key: &str, value: Value) -> io::Result<()> {
        let mut entries = self.entries.lock().unwrap();
        entries.insert(key.to_owned(), value);
        self.persist(&entries)
    }

    pub fn remove(&self, key: &str) -> io::Result<()> {
        let mut entries = self.entries.lock().unwrap();
        entries.remove(key);
        self.persist(&entries)
    }

    /// The stored direct URLs, if any.
    pub fn direct_urls(&self) -> Vec<String> {
        self.get_json(KEY_DIRECT_URLS)
            .and_then(|v| serde_json::from_value(v).ok())
            .unwrap_or_default()
    }

    fn persist(&self, entries: &HashMap<String, Value>) -> io::Result<()> {
        let bytes = serde_json::to_vec_pretty(entries)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        let tmp = self.path.with_extension("tmp");
        fs::write(&tmp, bytes)?;
        fs::rename(&tmp, &self.path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn values_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("client.json");

        let store = ClientStore::open(&path).unwrap();
        store.set_string(KEY_DEVICE_ID, "device-1").unwrap();
        store
            .set_json(KEY_DIRECT_URLS, json!(["https://a.example", "https://b.example"]))
            .unwrap();
        drop(store);

        let store = ClientStore::open(&path).unwrap();
        assert_eq!(store.get_string(KEY_DEVICE_ID).as_deref(), Some("device-1"));
        assert_eq!(
            store.direct_urls(),
            vec!["https://a.example".to_string(), "https://b.example".to_string()]
        );
    }

    #[test]
    fn remove_deletes_durably() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("client.json");

        let store = ClientStore::open(&path).unwrap();
        store.set_string(KEY_MEDIA_TOKEN, "tok").unwrap();
        store.remove(KEY_MEDIA_TOKEN).unwrap();
        drop(store);

        let store = ClientStore::open(&path).unwrap();
        assert_eq!(store.get_string(KEY_MEDIA_TOKEN), None);
    }
}
