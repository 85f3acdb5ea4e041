//! services/api/src/adapters/cache.rs
//!
//! The fast key/value cache used by the rate limiter: a single JSON object on disk,
//! mirrored in memory. Reads never touch the disk. Every write replaces the file via
//! a rename so a crash mid-write leaves the previous contents intact.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use bedtales_core::ports::{KeyValueCache, PortError, PortResult};
use tracing::warn;

pub struct JsonFileCache {
    path: PathBuf,
    entries: Mutex<BTreeMap<String, String>>,
}

impl JsonFileCache {
    /// Loads the cache file. A missing file is an empty cache; an unreadable one is
    /// discarded with a warning.
    pub fn open(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let entries = match std::fs::read_to_string(&path) {
            Ok(raw) => serde_json::from_str(&raw).unwrap_or_else(|e| {
                warn!("Discarding unreadable cache file {}: {}", path.display(), e);
                BTreeMap::new()
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(e) => {
                warn!("Could not read cache file {}: {}", path.display(), e);
                BTreeMap::new()
            }
        };
        Self {
            path,
            entries: Mutex::new(entries),
        }
    }

    fn persist(path: &Path, entries: &BTreeMap<String, String>) -> std::io::Result<()> {
        let body = serde_json::to_vec_pretty(entries)?;
        let staging = path.with_extension("json.tmp");
        std::fs::write(&staging, body)?;
        std::fs::rename(&staging, path)
    }
}

impl KeyValueCache for JsonFileCache {
    fn get(&self, key: &str) -> PortResult<Option<String>> {
        let entries = self
            .entries
            .lock()
            .map_err(|e| PortError::Unexpected(e.to_string()))?;
        Ok(entries.get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> PortResult<()> {
        let mut entries = self
            .entries
            .lock()
            .map_err(|e| PortError::Unexpected(e.to_string()))?;
        let mut next = entries.clone();
        next.insert(key.to_string(), value.to_string());
        Self::persist(&self.path, &next).map_err(|e| {
            PortError::TransactionFailed(format!("cache write to {}: {}", self.path.display(), e))
        })?;
        *entries = next;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_values_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cache.json");

        let cache = JsonFileCache::open(&path);
        assert_eq!(cache.get("apiRateLimits").unwrap(), None);
        cache.set("apiRateLimits", r#"{"createStory":{"count":1}}"#).unwrap();

        let reopened = JsonFileCache::open(&path);
        assert_eq!(
            reopened.get("apiRateLimits").unwrap().as_deref(),
            Some(r#"{"createStory":{"count":1}}"#)
        );
    }

    #[test]
    fn test_corrupted_file_starts_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cache.json");
        std::fs::write(&path, "{not json").unwrap();

        let cache = JsonFileCache::open(&path);
        assert_eq!(cache.get("anything").unwrap(), None);
        cache.set("k", "v").unwrap();
        assert_eq!(JsonFileCache::open(&path).get("k").unwrap().as_deref(), Some("v"));
    }

    #[test]
    fn test_failed_write_keeps_previous_value() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gone").join("cache.json");
        let cache = JsonFileCache::open(&path);

        assert!(cache.set("k", "v").is_err());
        assert_eq!(cache.get("k").unwrap(), None);
    }
}
