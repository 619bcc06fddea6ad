//! Digest / notification preference, persisted in durable storage.

use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::storage::{self, KeyValueStore, DIGEST_PREFERENCE_KEY};

/// How often the summary digest is delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DigestFrequency {
    /// Once a day.
    Daily,
    /// Once a week.
    Weekly,
}

/// User preference for analytics digests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DigestPreference {
    /// Whether digests are sent at all.
    pub enabled: bool,
    /// Delivery cadence.
    pub frequency: DigestFrequency,
}

impl Default for DigestPreference {
    fn default() -> Self {
        Self {
            enabled: false,
            frequency: DigestFrequency::Weekly,
        }
    }
}

/// Owner of the digest preference.
pub struct PreferenceStore {
    digest: Mutex<DigestPreference>,
    durable: Arc<dyn KeyValueStore>,
}

impl PreferenceStore {
    /// Loads the preference, falling back to the default.
    #[must_use]
    pub fn load(durable: Arc<dyn KeyValueStore>) -> Self {
        let digest = storage::load_json(durable.as_ref(), DIGEST_PREFERENCE_KEY).unwrap_or_default();
        Self {
            digest: Mutex::new(digest),
            durable,
        }
    }

    /// Current preference.
    #[must_use]
    pub fn digest(&self) -> DigestPreference {
        *self.digest.lock()
    }

    /// Replaces and persists the preference.
    pub fn set_digest(&self, preference: DigestPreference) {
        *self.digest.lock() = preference;
        info!(enabled = preference.enabled, frequency = ?preference.frequency, "digest preference updated");
        storage::save_json(self.durable.as_ref(), DIGEST_PREFERENCE_KEY, &preference);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStore;

    #[test]
    fn defaults_to_disabled_weekly() {
        let store = PreferenceStore::load(Arc::new(MemoryStore::new()));
        assert_eq!(store.digest(), DigestPreference::default());
    }

    #[test]
    fn preference_is_persisted() {
        let durable: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
        let pref = DigestPreference {
            enabled: true,
            frequency: DigestFrequency::Daily,
        };
        PreferenceStore::load(durable.clone()).set_digest(pref);

        let raw = durable
            .get(DIGEST_PREFERENCE_KEY)
            .expect("get")
            .expect("stored");
        assert!(raw.contains("\"daily\""));
        assert_eq!(PreferenceStore::load(durable).digest(), pref);
    }
}
