use crate::core::{Result, TrialError};
use crate::interface::LedgerStore;
use async_trait::async_trait;
use log::warn;
use std::collections::HashMap;
use std::fmt::Write as _;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use tokio::fs;
use tokio::sync::RwLock;

/// Process-local ledger storage.
///
/// `set_available(false)` makes every operation fail with
/// `TrialError::StorageUnavailable`, which is how a blocked or full browser
/// store looks to the dispatcher.
#[derive(Debug)]
pub struct InMemoryLedgerStore {
    entries: RwLock<HashMap<String, String>>,
    available: AtomicBool,
    writes: AtomicUsize,
}

impl Default for InMemoryLedgerStore {
    fn default() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            available: AtomicBool::new(true),
            writes: AtomicUsize::new(0),
        }
    }
}

impl InMemoryLedgerStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Number of successful `set` calls so far.
    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    pub async fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.entries.read().await.keys().cloned().collect();
        keys.sort();
        keys
    }

    fn ensure_available(&self) -> Result<()> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(TrialError::StorageUnavailable(
                "in-memory ledger store is disabled".to_string(),
            ))
        }
    }
}

#[async_trait]
impl LedgerStore for InMemoryLedgerStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        self.ensure_available()?;
        Ok(self.entries.read().await.get(key).cloned())
    }

    async fn set(&self, key: &str, value: &str) -> Result<()> {
        self.ensure_available()?;
        self.entries
            .write()
            .await
            .insert(key.to_string(), value.to_string());
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<()> {
        self.ensure_available()?;
        self.entries.write().await.remove(key);
        Ok(())
    }
}

/// One JSON file per key under a root directory.
///
/// Writes go through a temp file and a rename so a crash never leaves a
/// half-written ledger behind.
#[derive(Debug, Clone)]
pub struct FileLedgerStore {
    root: PathBuf,
}

impl FileLedgerStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn path_for(&self, key: &str) -> PathBuf {
        self.root.join(format!("{}.json", encode_key(key)))
    }
}

#[async_trait]
impl LedgerStore for FileLedgerStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let path = self.path_for(key);
        match fs::read_to_string(&path).await {
            Ok(raw) => Ok(Some(raw)),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
            Err(err) => Err(TrialError::StorageUnavailable(format!(
                "Failed to read ledger '{}': {}",
                path.display(),
                err
            ))),
        }
    }

    async fn set(&self, key: &str, value: &str) -> Result<()> {
        atomic_write(&self.path_for(key), value.as_bytes()).await
    }

    async fn remove(&self, key: &str) -> Result<()> {
        let path = self.path_for(key);
        match fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
            Err(err) => {
                warn!("failed to remove ledger '{}': {}", path.display(), err);
                Err(TrialError::StorageUnavailable(format!(
                    "Failed to remove ledger '{}': {}",
                    path.display(),
                    err
                )))
            }
        }
    }
}

/// Percent-encodes everything outside `[A-Za-z0-9_-]` so any key maps to a
/// distinct, portable file name.
fn encode_key(key: &str) -> String {
    let mut encoded = String::with_capacity(key.len());
    for byte in key.bytes() {
        if byte.is_ascii_alphanumeric() || byte == b'_' || byte == b'-' {
            encoded.push(byte as char);
        } else {
            let _ = write!(encoded, "%{:02X}", byte);
        }
    }
    encoded
}

async fn atomic_write(path: &Path, bytes: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).await.map_err(|err| {
            TrialError::StorageUnavailable(format!(
                "Failed to create ledger directory '{}': {}",
                parent.display(),
                err
            ))
        })?;
    }

    let tmp = path.with_extension("tmp");
    fs::write(&tmp, bytes).await.map_err(|err| {
        TrialError::Persistence(format!(
            "Failed to write temp file '{}': {}",
            tmp.display(),
            err
        ))
    })?;

    fs::rename(&tmp, path).await.map_err(|err| {
        TrialError::Persistence(format!(
            "Failed to rename temp file '{}' -> '{}': {}",
            tmp.display(),
            path.display(),
            err
        ))
    })?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_key() {
        assert_eq!(encode_key("trial_events_abc-1"), "trial_events_abc-1");
        assert_eq!(encode_key("trial/../x y"), "trial%2F%2E%2E%2Fx%20y");
    }

    #[tokio::test]
    async fn test_in_memory_store_unavailable() {
        let store = InMemoryLedgerStore::new();
        store.set("k", "v").await.unwrap();
        store.set_available(false);

        assert!(matches!(
            store.get("k").await,
            Err(TrialError::StorageUnavailable(_))
        ));
        assert!(store.set("k", "w").await.is_err());

        store.set_available(true);
        assert_eq!(store.get("k").await.unwrap().as_deref(), Some("v"));
        assert_eq!(store.write_count(), 1);
    }
}
