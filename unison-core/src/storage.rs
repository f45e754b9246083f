//! Persistent preferences boundary
//!
//! Volume, mute, and the auth token survive restarts through a small
//! key-value provider injected into the store at construction. Load happens
//! once at init, save on every change to a persisted field.

use std::path::PathBuf;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

/// Preferences that survive a restart
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredPrefs {
    pub volume: u8,
    pub is_muted: bool,
    pub previous_volume: u8,
    /// Bearer token for the library collaborator
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth_token: Option<String>,
}

impl Default for StoredPrefs {
    fn default() -> Self {
        Self {
            volume: 100,
            is_muted: false,
            previous_volume: 100,
            auth_token: None,
        }
    }
}

/// Injected persistence collaborator.
///
/// Implementations must tolerate concurrent calls; failures are logged and
/// swallowed, never surfaced to playback.
pub trait PreferencesProvider: Send + Sync {
    fn load(&self) -> StoredPrefs;
    fn save(&self, prefs: &StoredPrefs);

    /// Drop stored credentials (after an authorization failure)
    fn clear_credentials(&self) {
        let mut prefs = self.load();
        if prefs.auth_token.take().is_some() {
            self.save(&prefs);
        }
    }
}

/// In-memory provider for embedders without a persistence layer (and tests)
#[derive(Default)]
pub struct MemoryPreferences {
    prefs: RwLock<StoredPrefs>,
}

impl MemoryPreferences {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_prefs(prefs: StoredPrefs) -> Self {
        Self {
            prefs: RwLock::new(prefs),
        }
    }
}

impl PreferencesProvider for MemoryPreferences {
    fn load(&self) -> StoredPrefs {
        self.prefs.read().clone()
    }

    fn save(&self, prefs: &StoredPrefs) {
        *self.prefs.write() = prefs.clone();
    }
}

/// JSON-file-backed provider
pub struct JsonFilePreferences {
    path: PathBuf,
}

impl JsonFilePreferences {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl PreferencesProvider for JsonFilePreferences {
    fn load(&self) -> StoredPrefs {
        match std::fs::read_to_string(&self.path) {
            Ok(contents) => serde_json::from_str(&contents).unwrap_or_else(|e| {
                tracing::warn!("Malformed preferences file, using defaults: {}", e);
                StoredPrefs::default()
            }),
            Err(_) => StoredPrefs::default(),
        }
    }

    fn save(&self, prefs: &StoredPrefs) {
        let contents = match serde_json::to_string_pretty(prefs) {
            Ok(contents) => contents,
            Err(e) => {
                tracing::warn!("Failed to serialize preferences: {}", e);
                return;
            }
        };
        if let Err(e) = std::fs::write(&self.path, contents) {
            tracing::warn!("Failed to write preferences to {:?}: {}", self.path, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_round_trip() {
        let provider = MemoryPreferences::new();
        assert_eq!(provider.load(), StoredPrefs::default());

        let prefs = StoredPrefs {
            volume: 40,
            is_muted: true,
            previous_volume: 40,
            auth_token: Some("token".to_string()),
        };
        provider.save(&prefs);
        assert_eq!(provider.load(), prefs);
    }

    #[test]
    fn test_clear_credentials() {
        let provider = MemoryPreferences::with_prefs(StoredPrefs {
            auth_token: Some("expired".to_string()),
            ..StoredPrefs::default()
        });

        provider.clear_credentials();
        assert_eq!(provider.load().auth_token, None);
        // Other fields untouched
        assert_eq!(provider.load().volume, 100);
    }

    #[test]
    fn test_json_file_defaults_on_missing() {
        let dir = std::env::temp_dir().join("unison-prefs-test-missing");
        let provider = JsonFilePreferences::new(dir.join("nope.json"));
        assert_eq!(provider.load(), StoredPrefs::default());
    }

    #[test]
    fn test_json_file_round_trip() {
        let path = std::env::temp_dir().join("unison-prefs-test.json");
        let provider = JsonFilePreferences::new(&path);

        let prefs = StoredPrefs {
            volume: 73,
            ..StoredPrefs::default()
        };
        provider.save(&prefs);
        assert_eq!(provider.load(), prefs);

        let _ = std::fs::remove_file(&path);
    }
}
