//! File-backed key-value store for tabpulse.
//!
//! All keys live in one JSON object on disk. The file is read once on
//! [`JsonFileStore::open`]; every `set` rewrites it through a temp file and
//! a rename, so a crash leaves either the old or the new contents, never a
//! torn file.
//!
//! # Usage
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use tabpulse::{EventBuffer, StorePolicy};
//! use tabpulse_persistence::JsonFileStore;
//!
//! let store = Arc::new(JsonFileStore::open("/var/lib/tabpulse/state.json").await?);
//! let buffer = EventBuffer::new(store.clone());
//! let policy = StorePolicy::new(store);
//! ```

use std::io;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde_json::{Map, Value};
use tabpulse::{ChangeNotifier, KvStore};
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::sync::{broadcast, RwLock};
use tracing::{debug, info};

/// Errors opening or writing the store file.
#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("IO error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// The file holds valid JSON that isn't an object.
    #[error("{0} does not contain a JSON object")]
    NotAnObject(PathBuf),
}

pub type Result<T> = std::result::Result<T, PersistenceError>;

fn io_error(path: &Path) -> impl FnOnce(io::Error) -> PersistenceError + '_ {
    move |source| PersistenceError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// Durable [`KvStore`] over a single JSON file.
pub struct JsonFileStore {
    path: PathBuf,
    entries: RwLock<Map<String, Value>>,
    notifier: ChangeNotifier,
}

impl JsonFileStore {
    /// Load `path`, or start empty if it doesn't exist yet.
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let entries = match tokio::fs::read(&path).await {
            Ok(bytes) if bytes.iter().all(u8::is_ascii_whitespace) => Map::new(),
            Ok(bytes) => match serde_json::from_slice(&bytes)? {
                Value::Object(map) => map,
                _ => return Err(PersistenceError::NotAnObject(path)),
            },
            Err(e) if e.kind() == io::ErrorKind::NotFound => Map::new(),
            Err(e) => return Err(io_error(&path)(e)),
        };

        info!(path = %path.display(), keys = entries.len(), "opened store");
        Ok(Self {
            path,
            entries: RwLock::new(entries),
            notifier: ChangeNotifier::new(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_default();
        name.push(".tmp");
        self.path.with_file_name(name)
    }

    /// Write `entries` to disk, replacing the previous file atomically.
    async fn persist(&self, entries: &Map<String, Value>) -> Result<()> {
        let bytes = serde_json::to_vec(entries)?;
        let temp = self.temp_path();

        if let Some(dir) = self.path.parent().filter(|d| !d.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(dir).await.map_err(io_error(dir))?;
        }

        let mut file = tokio::fs::File::create(&temp)
            .await
            .map_err(io_error(&temp))?;
        file.write_all(&bytes).await.map_err(io_error(&temp))?;
        file.sync_all().await.map_err(io_error(&temp))?;
        drop(file);

        tokio::fs::rename(&temp, &self.path)
            .await
            .map_err(io_error(&self.path))?;
        sync_parent(&self.path).await;

        debug!(path = %self.path.display(), bytes = bytes.len(), "store persisted");
        Ok(())
    }
}

#[cfg(unix)]
async fn sync_parent(path: &Path) {
    let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) else {
        return;
    };
    // Best effort: the rename already happened
    if let Ok(handle) = tokio::fs::File::open(dir).await {
        let _ = handle.sync_all().await;
    }
}

#[cfg(not(unix))]
async fn sync_parent(_path: &Path) {}

#[async_trait]
impl KvStore for JsonFileStore {
    async fn get(&self, key: &str) -> anyhow::Result<Option<Value>> {
        Ok(self.entries.read().await.get(key).cloned())
    }

    async fn set(&self, key: &str, value: Value) -> anyhow::Result<()> {
        let mut entries = self.entries.write().await;
        let mut next = entries.clone();
        next.insert(key.to_string(), value.clone());

        // Memory only changes once the file has
        self.persist(&next).await?;
        *entries = next;
        drop(entries);

        self.notifier.notify(key, &value);
        Ok(())
    }

    fn subscribe(&self, key: &str) -> broadcast::Receiver<Value> {
        self.notifier.subscribe(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Arc;
    use tabpulse::{ActivityEvent, EventBuffer, Origin};
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_missing_file_opens_empty() {
        let dir = tempdir().unwrap();
        let store = JsonFileStore::open(dir.path().join("state.json")).await.unwrap();
        assert_eq!(store.get("events").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_values_survive_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("state.json");

        {
            let store = JsonFileStore::open(&path).await.unwrap();
            store.set("tenant_id", json!("acme")).await.unwrap();
            store.set("sync_enabled", json!(true)).await.unwrap();
        }

        let reopened = JsonFileStore::open(&path).await.unwrap();
        assert_eq!(reopened.get("tenant_id").await.unwrap(), Some(json!("acme")));
        assert_eq!(reopened.get("sync_enabled").await.unwrap(), Some(json!(true)));
        assert!(!reopened.temp_path().exists());
    }

    #[tokio::test]
    async fn test_buffer_round_trips_through_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("state.json");
        let event = ActivityEvent::new(
            chrono::DateTime::parse_from_rfc3339("2024-03-01T12:00:00.123456789Z")
                .unwrap()
                .with_timezone(&chrono::Utc),
            Origin::new("https://example.com/x", "X"),
        )
        .with_duration_ms(12_345)
        .with_actor("alice");

        {
            let buffer = EventBuffer::new(Arc::new(JsonFileStore::open(&path).await.unwrap()));
            buffer.append(event.clone()).await.unwrap();
        }

        let buffer = EventBuffer::new(Arc::new(JsonFileStore::open(&path).await.unwrap()));
        assert_eq!(buffer.read_all().await.unwrap(), vec![event]);
    }

    #[tokio::test]
    async fn test_non_object_file_is_rejected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("state.json");
        tokio::fs::write(&path, b"[1, 2, 3]").await.unwrap();

        let err = JsonFileStore::open(&path).await.err().unwrap();
        assert!(matches!(err, PersistenceError::NotAnObject(_)));
    }

    #[tokio::test]
    async fn test_corrupt_file_is_rejected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("state.json");
        tokio::fs::write(&path, b"{\"events\": [").await.unwrap();

        let err = JsonFileStore::open(&path).await.err().unwrap();
        assert!(matches!(err, PersistenceError::Json(_)));
    }

    #[tokio::test]
    async fn test_subscribers_notified_after_write() {
        let dir = tempdir().unwrap();
        let store = JsonFileStore::open(dir.path().join("state.json")).await.unwrap();
        let mut rx = store.subscribe("events");

        store.set("events", json!([])).await.unwrap();
        assert_eq!(rx.recv().await.unwrap(), json!([]));
    }

    #[tokio::test]
    async fn test_failed_write_leaves_memory_unchanged() {
        let dir = tempdir().unwrap();
        // A directory where the file should be makes the rename fail
        let path = dir.path().join("state.json");
        let store = JsonFileStore::open(&path).await.unwrap();
        tokio::fs::create_dir(&path).await.unwrap();
        tokio::fs::write(path.join("occupied"), b"x").await.unwrap();

        assert!(store.set("k", json!(1)).await.is_err());
        assert_eq!(store.get("k").await.unwrap(), None);
    }
}
