//! Fingerprints of records already seen, shared across jobs.

use std::collections::HashSet;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use tokio::sync::Mutex;

use crate::error::AppError;
use crate::models::DedupKey;

/// Process-wide set of seen [`DedupKey`]s, optionally backed by a JSON file.
///
/// Membership only grows until [`DedupStore::clear`] is called.
#[derive(Debug, Default)]
pub struct DedupStore {
    seen: RwLock<HashSet<DedupKey>>,
    path: Option<PathBuf>,
    persisting: Mutex<()>,
}

impl DedupStore {
    /// An in-memory store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Load a store from `path`; a missing file starts empty.
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self, AppError> {
        let path = path.into();
        let seen = match tokio::fs::read(&path).await {
            Ok(bytes) => {
                let keys: Vec<DedupKey> = serde_json::from_slice(&bytes)?;
                keys.into_iter().collect()
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => HashSet::new(),
            Err(e) => {
                return Err(AppError::ConfigError(format!(
                    "cannot read dedup file {}: {e}",
                    path.display()
                )));
            }
        };
        tracing::debug!(path = %path.display(), keys = seen.len(), "Loaded dedup store");
        Ok(Self {
            seen: RwLock::new(seen),
            path: Some(path),
            persisting: Mutex::new(()),
        })
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Record `key`; returns `true` if it had not been seen before.
    pub fn insert_if_new(&self, key: DedupKey) -> bool {
        self.write().insert(key)
    }

    pub fn contains(&self, key: &DedupKey) -> bool {
        self.read().contains(key)
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    /// Forget every fingerprint. Returns how many were dropped.
    pub fn clear(&self) -> usize {
        let mut seen = self.write();
        let dropped = seen.len();
        seen.clear();
        dropped
    }

    /// Write the current set to the backing file, if any.
    ///
    /// Writers are serialised, so a later call never loses keys to an
    /// earlier one finishing after it.
    pub async fn persist(&self) -> Result<(), AppError> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let _guard = self.persisting.lock().await;

        let mut keys: Vec<DedupKey> = self.read().iter().cloned().collect();
        keys.sort_by(|a, b| a.as_str().cmp(b.as_str()));
        let json = serde_json::to_vec(&keys)?;

        let target = path.clone();
        tokio::task::spawn_blocking(move || write_atomically(&target, &json))
            .await
            .map_err(|e| AppError::Generic(format!("dedup persist task failed: {e}")))??;

        tracing::debug!(path = %path.display(), keys = keys.len(), "Persisted dedup store");
        Ok(())
    }

    fn read(&self) -> RwLockReadGuard<'_, HashSet<DedupKey>> {
        self.seen.read().unwrap_or_else(|poisoned| {
            tracing::warn!("Dedup store lock was poisoned, recovering");
            poisoned.into_inner()
        })
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashSet<DedupKey>> {
        self.seen.write().unwrap_or_else(|poisoned| {
            tracing::warn!("Dedup store lock was poisoned, recovering");
            poisoned.into_inner()
        })
    }
}

/// Stage `bytes` in a uniquely named file next to `path`, then rename it
/// into place.
fn write_atomically(path: &Path, bytes: &[u8]) -> Result<(), AppError> {
    let io_err = |e: std::io::Error| {
        AppError::ConfigError(format!("cannot write dedup file {}: {e}", path.display()))
    };
    let dir = match path.parent().filter(|p| !p.as_os_str().is_empty()) {
        Some(parent) => {
            std::fs::create_dir_all(parent).map_err(io_err)?;
            parent
        }
        None => Path::new("."),
    };
    let mut staging = tempfile::NamedTempFile::new_in(dir).map_err(io_err)?;
    staging.write_all(bytes).map_err(io_err)?;
    staging.persist(path).map_err(|e| io_err(e.error))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::models::compute_hash;

    fn key(s: &str) -> DedupKey {
        DedupKey::from(compute_hash(s))
    }

    #[test]
    fn test_insert_if_new() {
        let store = DedupStore::new();
        assert!(store.insert_if_new(key("a")));
        assert!(!store.insert_if_new(key("a")));
        assert!(store.insert_if_new(key("b")));
        assert_eq!(store.len(), 2);
        assert!(store.contains(&key("a")));
    }

    #[test]
    fn test_clear_resets_membership() {
        let store = DedupStore::new();
        store.insert_if_new(key("a"));
        store.insert_if_new(key("b"));
        assert_eq!(store.clear(), 2);
        assert!(store.is_empty());
        assert!(store.insert_if_new(key("a")));
    }

    #[test]
    fn test_concurrent_inserts_count_each_key_once() {
        let store = Arc::new(DedupStore::new());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let store = Arc::clone(&store);
                std::thread::spawn(move || {
                    (0..100)
                        .filter(|i| store.insert_if_new(key(&i.to_string())))
                        .count()
                })
            })
            .collect();
        let fresh: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();
        assert_eq!(fresh, 100);
        assert_eq!(store.len(), 100);
    }

    #[tokio::test]
    async fn test_persist_and_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state").join("dedup.json");

        let store = DedupStore::open(&path).await.unwrap();
        assert!(store.is_empty());
        store.insert_if_new(key("a"));
        store.insert_if_new(key("b"));
        store.persist().await.unwrap();

        let reopened = DedupStore::open(&path).await.unwrap();
        assert_eq!(reopened.len(), 2);
        assert!(reopened.contains(&key("a")));
        assert_eq!(reopened.path(), Some(path.as_path()));

        reopened.clear();
        reopened.persist().await.unwrap();
        assert!(DedupStore::open(&path).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_concurrent_persists_keep_every_key() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dedup.json");
        let store = Arc::new(DedupStore::open(&path).await.unwrap());

        let tasks: Vec<_> = (0..8)
            .map(|i| {
                let store = Arc::clone(&store);
                tokio::spawn(async move {
                    store.insert_if_new(key(&i.to_string()));
                    store.persist().await
                })
            })
            .collect();
        for task in tasks {
            task.await.unwrap().unwrap();
        }

        assert_eq!(DedupStore::open(&path).await.unwrap().len(), 8);
        let files: Vec<_> = std::fs::read_dir(dir.path()).unwrap().collect();
        assert_eq!(files.len(), 1);
    }

    #[tokio::test]
    async fn test_open_rejects_corrupt_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dedup.json");
        std::fs::write(&path, b"not json").unwrap();

        assert!(matches!(
            DedupStore::open(&path).await,
            Err(AppError::SerializationError(_))
        ));
    }

    #[tokio::test]
    async fn test_in_memory_persist_is_noop() {
        let store = DedupStore::new();
        store.insert_if_new(key("a"));
        store.persist().await.unwrap();
        assert_eq!(store.path(), None);
    }
}
