//! Key-value persistence for collector state.
//!
//! Il collector non sa nulla di `localStorage`/`sessionStorage`: parla con
//! un [`KeyValueStore`] per ciascuna classe di durabilità.
//!
//! - **durable**: session id, stato di privacy, preferenze digest;
//! - **session-scoped**: snapshot di attribuzione (sparisce con la sessione).
//!
//! Backend forniti:
//! - [`MemoryStore`] — in memoria, per test e come fallback;
//! - [`FileStore`] — mappa JSON su disco, write-through.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::warn;

use crate::error::StorageError;

/// Storage key for the persisted session identifier (durable).
pub const SESSION_ID_KEY: &str = "veil.session_id";
/// Storage key for the attribution snapshot (session-scoped).
pub const ATTRIBUTION_KEY: &str = "veil.attribution";
/// Storage key for epsilon, its history and the daily budget (durable).
pub const PRIVACY_STATE_KEY: &str = "veil.privacy_state";
/// Storage key for the digest / notification preference (durable).
pub const DIGEST_PREFERENCE_KEY: &str = "veil.digest_preference";

/// Minimal get/set/remove persistence interface.
pub trait KeyValueStore: Send + Sync {
    /// Reads a raw value.
    fn get(&self, key: &str) -> Result<Option<String>, StorageError>;
    /// Writes a raw value.
    fn set(&self, key: &str, value: &str) -> Result<(), StorageError>;
    /// Removes a value. Removing a missing key is not an error.
    fn remove(&self, key: &str) -> Result<(), StorageError>;
}

/// Reads and deserializes a JSON value, degrading to `None` on any failure.
pub fn load_json<T: DeserializeOwned>(store: &dyn KeyValueStore, key: &str) -> Option<T> {
    let raw = match store.get(key) {
        Ok(Some(raw)) => raw,
        Ok(None) => return None,
        Err(err) => {
            warn!(key, error = %err, "storage read failed, using in-memory default");
            return None;
        }
    };

    match serde_json::from_str(&raw) {
        Ok(value) => Some(value),
        Err(err) => {
            warn!(key, error = %err, "stored value is corrupted, ignoring it");
            None
        }
    }
}

/// Serializes and writes a JSON value. Failures are logged, never raised.
pub fn save_json<T: Serialize>(store: &dyn KeyValueStore, key: &str, value: &T) -> bool {
    let raw = match serde_json::to_string(value) {
        Ok(raw) => raw,
        Err(err) => {
            warn!(key, error = %err, "unable to serialize value for storage");
            return false;
        }
    };
    match store.set(key, &raw) {
        Ok(()) => true,
        Err(err) => {
            warn!(key, error = %err, "storage write failed, value kept in memory only");
            false
        }
    }
}

/// In-memory store.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<String, String>>,
}

impl MemoryStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Drops every entry, like a cleared browser storage.
    pub fn clear(&self) {
        self.entries.lock().clear();
    }

    /// Number of stored keys.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// `true` when nothing is stored.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

impl KeyValueStore for MemoryStore {
    fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        Ok(self.entries.lock().get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<(), StorageError> {
        self.entries.lock().insert(key.to_owned(), value.to_owned());
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), StorageError> {
        self.entries.lock().remove(key);
        Ok(())
    }
}

/// JSON-file store: the whole map is rewritten on every mutation.
///
/// Scrittura atomica via file temporaneo + rename.
#[derive(Debug)]
pub struct FileStore {
    path: PathBuf,
    entries: Mutex<HashMap<String, String>>,
}

impl FileStore {
    /// Opens (or lazily creates) a store backed by `path`.
    ///
    /// Un file assente equivale a uno store vuoto; un file corrotto è un errore.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, StorageError> {
        let path = path.into();
        let entries = if path.exists() {
            let raw = fs::read_to_string(&path)?;
            if raw.trim().is_empty() {
                HashMap::new()
            } else {
                serde_json::from_str(&raw)?
            }
        } else {
            HashMap::new()
        };

        Ok(Self {
            path,
            entries: Mutex::new(entries),
        })
    }

    /// Backing file path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn persist(&self, entries: &HashMap<String, String>) -> Result<(), StorageError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let tmp = self.path.with_extension("tmp");
        fs::write(&tmp, serde_json::to_vec_pretty(entries)?)?;
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

impl KeyValueStore for FileStore {
    fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        Ok(self.entries.lock().get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<(), StorageError> {
        let mut entries = self.entries.lock();
        entries.insert(key.to_owned(), value.to_owned());
        self.persist(&entries)
    }

    fn remove(&self, key: &str) -> Result<(), StorageError> {
        let mut entries = self.entries.lock();
        if entries.remove(key).is_some() {
            self.persist(&entries)?;
        }
        Ok(())
    }
}
