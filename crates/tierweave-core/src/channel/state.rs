//! Persisted per-channel state.
//!
//! Stateful channels get a [`StateBinder`] keyed by their `uniqueId`.
//! The record is lazily loaded on open (`{}` if absent) and written
//! back with a debounce window: writes within one window coalesce into
//! a single flush carrying the last value per key. Closing the binder
//! cancels the pending flush timer deterministically and performs a
//! final flush before returning.

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::{Map, Value};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::error::CoreError;

/// Default write-coalescing window.
pub const DEFAULT_DEBOUNCE: Duration = Duration::from_millis(500);

// ── KvStore ──────────────────────────────────────────────────────────

/// The small keyed store channel state is persisted to. The preference
/// store used by the wider system satisfies this; so does anything
/// else with get/insert semantics.
#[async_trait]
pub trait KvStore: Send + Sync {
    async fn get_one(&self, id: &str) -> Result<Option<Value>, CoreError>;
    async fn insert_one(&self, id: &str, value: Value) -> Result<(), CoreError>;
}

// ── JsonFileStore ────────────────────────────────────────────────────

/// One JSON file per record under a directory.
pub struct JsonFileStore {
    dir: PathBuf,
}

impl JsonFileStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn path_for(&self, id: &str) -> PathBuf {
        // Channel ids may contain characters the filesystem dislikes.
        let safe: String = id
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                    c
                } else {
                    '_'
                }
            })
            .collect();
        self.dir.join(format!("{safe}.json"))
    }
}

#[async_trait]
impl KvStore for JsonFileStore {
    async fn get_one(&self, id: &str) -> Result<Option<Value>, CoreError> {
        match tokio::fs::read_to_string(self.path_for(id)).await {
            Ok(text) => serde_json::from_str(&text)
                .map(Some)
                .map_err(|e| CoreError::StateLoad {
                    id: id.into(),
                    reason: e.to_string(),
                }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(CoreError::StateLoad {
                id: id.into(),
                reason: e.to_string(),
            }),
        }
    }

    async fn insert_one(&self, id: &str, value: Value) -> Result<(), CoreError> {
        tokio::fs::create_dir_all(&self.dir)
            .await
            .map_err(|e| CoreError::StateFlush {
                id: id.into(),
                reason: e.to_string(),
            })?;
        tokio::fs::write(self.path_for(id), value.to_string())
            .await
            .map_err(|e| CoreError::StateFlush {
                id: id.into(),
                reason: e.to_string(),
            })
    }
}

// ── MemoryKvStore ────────────────────────────────────────────────────

/// In-memory store. Counts writes, which makes the debounce guarantees
/// observable in tests.
#[derive(Default)]
pub struct MemoryKvStore {
    records: DashMap<String, Value>,
    writes: AtomicUsize,
}

impl MemoryKvStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Total `insert_one` calls so far.
    pub fn writes(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl KvStore for MemoryKvStore {
    async fn get_one(&self, id: &str) -> Result<Option<Value>, CoreError> {
        Ok(self.records.get(id).map(|r| r.value().clone()))
    }

    async fn insert_one(&self, id: &str, value: Value) -> Result<(), CoreError> {
        self.writes.fetch_add(1, Ordering::SeqCst);
        self.records.insert(id.into(), value);
        Ok(())
    }
}

// ── StateBinder ──────────────────────────────────────────────────────

struct BinderCell {
    /// `None` until first load.
    record: Option<Map<String, Value>>,
    dirty: bool,
    /// Pending debounced flush. An explicit handle, cancelled
    /// deterministically on close — never a dangling timer.
    flush_task: Option<JoinHandle<()>>,
}

struct BinderInner {
    id: String,
    store: Arc<dyn KvStore>,
    debounce: Duration,
    cell: Mutex<BinderCell>,
}

/// Handle to one channel's persisted key/value record.
///
/// Cloneable: the factory keeps one clone for lifecycle management and
/// passes another to the channel constructor.
#[derive(Clone)]
pub struct StateBinder {
    inner: Arc<BinderInner>,
}

impl StateBinder {
    pub fn new(id: impl Into<String>, store: Arc<dyn KvStore>, debounce: Duration) -> Self {
        Self {
            inner: Arc::new(BinderInner {
                id: id.into(),
                store,
                debounce,
                cell: Mutex::new(BinderCell {
                    record: None,
                    dirty: false,
                    flush_task: None,
                }),
            }),
        }
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    /// Load the record if it is not resident yet. `{}` when absent.
    pub async fn load(&self) -> Result<(), CoreError> {
        let mut cell = self.inner.cell.lock().await;
        Self::ensure_loaded(&self.inner, &mut cell).await
    }

    async fn ensure_loaded(
        inner: &BinderInner,
        cell: &mut BinderCell,
    ) -> Result<(), CoreError> {
        if cell.record.is_some() {
            return Ok(());
        }
        let record = match inner.store.get_one(&inner.id).await? {
            Some(Value::Object(map)) => map,
            Some(other) => {
                warn!(id = %inner.id, kind = ?other, "persisted record is not an object; resetting");
                Map::new()
            }
            None => Map::new(),
        };
        debug!(id = %inner.id, keys = record.len(), "channel state loaded");
        cell.record = Some(record);
        Ok(())
    }

    pub async fn get(&self, key: &str) -> Result<Option<Value>, CoreError> {
        let mut cell = self.inner.cell.lock().await;
        Self::ensure_loaded(&self.inner, &mut cell).await?;
        Ok(cell.record.as_ref().and_then(|r| r.get(key).cloned()))
    }

    /// Set a key and schedule a debounced flush. At most one write per
    /// debounce window; the last value per key wins.
    pub async fn set(&self, key: &str, value: Value) -> Result<(), CoreError> {
        let mut cell = self.inner.cell.lock().await;
        Self::ensure_loaded(&self.inner, &mut cell).await?;
        if let Some(record) = cell.record.as_mut() {
            record.insert(key.into(), value);
        }
        cell.dirty = true;
        self.schedule_flush(&mut cell);
        Ok(())
    }

    pub async fn delete(&self, key: &str) -> Result<(), CoreError> {
        let mut cell = self.inner.cell.lock().await;
        Self::ensure_loaded(&self.inner, &mut cell).await?;
        if let Some(record) = cell.record.as_mut() {
            if record.remove(key).is_none() {
                return Ok(());
            }
        }
        cell.dirty = true;
        self.schedule_flush(&mut cell);
        Ok(())
    }

    fn schedule_flush(&self, cell: &mut BinderCell) {
        if cell.flush_task.is_some() {
            return;
        }
        let inner = Arc::clone(&self.inner);
        cell.flush_task = Some(tokio::spawn(async move {
            tokio::time::sleep(inner.debounce).await;
            let mut cell = inner.cell.lock().await;
            cell.flush_task = None;
            if !cell.dirty {
                return;
            }
            let snapshot = cell.record.clone().unwrap_or_default();
            // `dirty` is cleared only after a successful write, so an
            // interrupted flush is retried by the close-time flush.
            match inner.store.insert_one(&inner.id, Value::Object(snapshot)).await {
                Ok(()) => cell.dirty = false,
                Err(e) => warn!(id = %inner.id, error = %e, "debounced state flush failed"),
            }
        }));
    }

    /// Cancel any pending flush timer and flush synchronously. Called
    /// when the channel finally closes.
    pub async fn close(&self) -> Result<(), CoreError> {
        let mut cell = self.inner.cell.lock().await;
        if let Some(task) = cell.flush_task.take() {
            task.abort();
        }
        if !cell.dirty {
            return Ok(());
        }
        let snapshot = cell.record.clone().unwrap_or_default();
        self.inner
            .store
            .insert_one(&self.inner.id, Value::Object(snapshot))
            .await?;
        cell.dirty = false;
        Ok(())
    }
}

// ── Tests ────────────────────────────────────────────────────────────

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use serde_json::json;

    fn binder(store: &Arc<MemoryKvStore>, debounce_ms: u64) -> StateBinder {
        let store: Arc<dyn KvStore> = Arc::clone(store) as Arc<dyn KvStore>;
        StateBinder::new("dev-kind", store, Duration::from_millis(debounce_ms))
    }

    #[tokio::test]
    async fn absent_record_loads_as_empty() {
        let store = Arc::new(MemoryKvStore::new());
        let b = binder(&store, 20);
        b.load().await.unwrap();
        assert_eq!(b.get("missing").await.unwrap(), None);
    }

    #[tokio::test]
    async fn writes_within_one_window_coalesce() {
        let store = Arc::new(MemoryKvStore::new());
        let b = binder(&store, 50);

        for i in 0..5 {
            b.set("count", json!(i)).await.unwrap();
        }
        assert_eq!(store.writes(), 0, "nothing flushes inside the window");

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(store.writes(), 1, "exactly one flush per window");
        assert_eq!(store.get_one("dev-kind").await.unwrap().unwrap()["count"], 4);
    }

    #[tokio::test]
    async fn close_cancels_timer_and_flushes_immediately() {
        let store = Arc::new(MemoryKvStore::new());
        let b = binder(&store, 10_000);

        b.set("mode", json!("eco")).await.unwrap();
        b.close().await.unwrap();
        assert_eq!(store.writes(), 1);
        assert_eq!(store.get_one("dev-kind").await.unwrap().unwrap()["mode"], "eco");

        // The cancelled timer never fires a second write.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(store.writes(), 1);
    }

    #[tokio::test]
    async fn close_without_changes_writes_nothing() {
        let store = Arc::new(MemoryKvStore::new());
        let b = binder(&store, 20);
        b.load().await.unwrap();
        b.close().await.unwrap();
        assert_eq!(store.writes(), 0);
    }

    #[tokio::test]
    async fn existing_record_is_visible_after_load() {
        let store = Arc::new(MemoryKvStore::new());
        store
            .insert_one("dev-kind", json!({"last_seen": 42}))
            .await
            .unwrap();

        let b = binder(&store, 20);
        assert_eq!(b.get("last_seen").await.unwrap(), Some(json!(42)));
    }

    #[tokio::test]
    async fn delete_removes_and_flushes() {
        let store = Arc::new(MemoryKvStore::new());
        store
            .insert_one("dev-kind", json!({"a": 1, "b": 2}))
            .await
            .unwrap();

        let b = binder(&store, 10);
        b.delete("a").await.unwrap();
        b.close().await.unwrap();

        let record = store.get_one("dev-kind").await.unwrap().unwrap();
        assert!(record.get("a").is_none());
        assert_eq!(record["b"], 2);
    }

    #[tokio::test]
    async fn json_file_store_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileStore::new(dir.path());

        assert_eq!(store.get_one("dev-kind").await.unwrap(), None);

        store
            .insert_one("dev-kind", json!({"x": true}))
            .await
            .unwrap();
        assert_eq!(
            store.get_one("dev-kind").await.unwrap(),
            Some(json!({"x": true}))
        );
    }

    #[tokio::test]
    async fn json_file_store_sanitizes_ids() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileStore::new(dir.path());

        store
            .insert_one("dev/with:odd chars-poll", json!({"ok": 1}))
            .await
            .unwrap();
        assert_eq!(
            store.get_one("dev/with:odd chars-poll").await.unwrap(),
            Some(json!({"ok": 1}))
        );
    }
}
