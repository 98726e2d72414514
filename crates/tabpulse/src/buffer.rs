//! Durable event buffer.
//!
//! The whole ordered sequence is stored as one JSON array under a single
//! store key. Every operation takes the buffer lock, so a read-merge-write in
//! [`EventBuffer::add_one`] can never interleave with another `add_one` or a
//! `clear`. Longer units of work (a sync cycle) hold a [`BufferGuard`] for
//! their whole duration.

use std::sync::Arc;

use serde_json::Value;
use tokio::sync::{broadcast, Mutex, MutexGuard};
use tracing::trace;

use crate::error::{PulseError, Result};
use crate::event::ActivityEvent;
use crate::merge::{merge, MergeResult};
use crate::store::KvStore;

/// Store key used when none is configured.
pub const DEFAULT_BUFFER_KEY: &str = "events";

pub struct EventBuffer<S: KvStore + ?Sized> {
    store: Arc<S>,
    key: String,
    lock: Mutex<()>,
}

impl<S: KvStore + ?Sized> EventBuffer<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self::with_key(store, DEFAULT_BUFFER_KEY)
    }

    pub fn with_key(store: Arc<S>, key: impl Into<String>) -> Self {
        Self {
            store,
            key: key.into(),
            lock: Mutex::new(()),
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    /// Exclusive access until the guard is dropped.
    pub async fn lock(&self) -> BufferGuard<'_, S> {
        BufferGuard {
            buffer: self,
            _permit: self.lock.lock().await,
        }
    }

    pub async fn read_all(&self) -> Result<Vec<ActivityEvent>> {
        self.lock().await.read_all().await
    }

    pub async fn append(&self, event: ActivityEvent) -> Result<()> {
        self.lock().await.append(event).await
    }

    pub async fn replace_tail(&self, event: ActivityEvent) -> Result<()> {
        self.lock().await.replace_tail(event).await
    }

    pub async fn clear(&self) -> Result<()> {
        self.lock().await.clear().await
    }

    /// Merge `candidate` into the tail or append it, as one atomic unit.
    pub async fn add_one(
        &self,
        candidate: ActivityEvent,
        pulse_window_secs: f64,
    ) -> Result<MergeResult> {
        self.lock().await.add_one(candidate, pulse_window_secs).await
    }

    /// Watch the number of buffered events after every write.
    pub fn subscribe(&self) -> BufferWatcher {
        BufferWatcher {
            rx: self.store.subscribe(&self.key),
        }
    }

    async fn load(&self) -> Result<Vec<ActivityEvent>> {
        let value = self
            .store
            .get(&self.key)
            .await
            .map_err(PulseError::Storage)?;

        match value {
            None | Some(Value::Null) => Ok(Vec::new()),
            Some(value) => Ok(serde_json::from_value(value)?),
        }
    }

    async fn save(&self, events: &[ActivityEvent]) -> Result<()> {
        let value = serde_json::to_value(events)?;
        self.store
            .set(&self.key, value)
            .await
            .map_err(PulseError::Storage)
    }
}

/// Held lock on an [`EventBuffer`].
pub struct BufferGuard<'a, S: KvStore + ?Sized> {
    buffer: &'a EventBuffer<S>,
    _permit: MutexGuard<'a, ()>,
}

impl<S: KvStore + ?Sized> BufferGuard<'_, S> {
    /// Everything buffered, oldest first. Empty if nothing was ever written.
    pub async fn read_all(&self) -> Result<Vec<ActivityEvent>> {
        self.buffer.load().await
    }

    pub async fn append(&self, event: ActivityEvent) -> Result<()> {
        let mut events = self.buffer.load().await?;
        events.push(event);
        self.buffer.save(&events).await
    }

    /// Overwrite the last element. Fails on an empty buffer.
    pub async fn replace_tail(&self, event: ActivityEvent) -> Result<()> {
        let mut events = self.buffer.load().await?;
        let Some(tail) = events.last_mut() else {
            return Err(PulseError::Precondition("replace_tail on an empty buffer"));
        };
        *tail = event;
        self.buffer.save(&events).await
    }

    pub async fn clear(&self) -> Result<()> {
        self.buffer.save(&[]).await
    }

    pub async fn add_one(
        &self,
        candidate: ActivityEvent,
        pulse_window_secs: f64,
    ) -> Result<MergeResult> {
        let mut events = self.buffer.load().await?;
        let result = merge(events.last(), candidate, pulse_window_secs);

        match &result {
            MergeResult::Extend(updated) => {
                if let Some(tail) = events.last_mut() {
                    *tail = updated.clone();
                }
                trace!(url = %updated.origin.url, duration_ms = updated.duration_ms, "extended tail");
            }
            MergeResult::Append(event) => {
                events.push(event.clone());
                trace!(url = %event.origin.url, len = events.len(), "appended event");
            }
        }

        self.buffer.save(&events).await?;
        Ok(result)
    }
}

/// Pending-count notifications for one buffer.
pub struct BufferWatcher {
    rx: broadcast::Receiver<Value>,
}

impl BufferWatcher {
    /// Wait for the next write and return the buffer length it left behind.
    ///
    /// Returns `None` once the store is gone. Missed notifications are
    /// skipped; the next one still carries the full sequence.
    pub async fn changed(&mut self) -> Option<usize> {
        loop {
            match self.rx.recv().await {
                Ok(value) => return Some(value.as_array().map_or(0, Vec::len)),
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::Origin;
    use crate::store::MemoryStore;
    use chrono::{TimeZone, Utc};
    use serde_json::json;

    fn event_at(ms: i64, url: &str) -> ActivityEvent {
        ActivityEvent::new(
            Utc.timestamp_millis_opt(ms).unwrap(),
            Origin::new(url, "title"),
        )
    }

    fn buffer() -> EventBuffer<MemoryStore> {
        EventBuffer::new(Arc::new(MemoryStore::new()))
    }

    #[tokio::test]
    async fn test_fresh_buffer_reads_empty() {
        assert!(buffer().read_all().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_null_value_reads_empty() {
        let store = Arc::new(MemoryStore::with_entries([(DEFAULT_BUFFER_KEY, Value::Null)]));
        let buffer = EventBuffer::new(store);
        assert!(buffer.read_all().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_append_then_read_returns_event_through_store() {
        let store = Arc::new(MemoryStore::new());
        let buffer = EventBuffer::new(store.clone());
        let event = event_at(1_000, "https://a.test")
            .with_duration_ms(250)
            .with_actor("alice");

        buffer.append(event_at(0, "https://z.test")).await.unwrap();
        buffer.append(event.clone()).await.unwrap();

        // A second buffer over the same store decodes the persisted JSON
        let reopened = EventBuffer::new(store);
        let events = reopened.read_all().await.unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events.last(), Some(&event));
    }

    #[tokio::test]
    async fn test_replace_tail_on_empty_is_precondition_error() {
        let err = buffer()
            .replace_tail(event_at(0, "https://a.test"))
            .await
            .unwrap_err();
        assert!(matches!(err, PulseError::Precondition(_)));
    }

    #[tokio::test]
    async fn test_replace_tail_only_touches_last() {
        let buffer = buffer();
        buffer.append(event_at(0, "https://a.test")).await.unwrap();
        buffer.append(event_at(1, "https://b.test")).await.unwrap();

        buffer
            .replace_tail(event_at(2, "https://c.test"))
            .await
            .unwrap();

        let urls: Vec<_> = buffer
            .read_all()
            .await
            .unwrap()
            .into_iter()
            .map(|e| e.origin.url)
            .collect();
        assert_eq!(urls, vec!["https://a.test", "https://c.test"]);
    }

    #[tokio::test]
    async fn test_clear_is_idempotent() {
        let buffer = buffer();
        buffer.append(event_at(0, "https://a.test")).await.unwrap();

        buffer.clear().await.unwrap();
        buffer.clear().await.unwrap();

        assert!(buffer.read_all().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_add_one_extends_then_appends() {
        let buffer = buffer();

        let first = buffer.add_one(event_at(0, "https://a.test"), 30.0).await.unwrap();
        assert!(!first.is_extend());

        let second = buffer
            .add_one(event_at(20_000, "https://a.test"), 30.0)
            .await
            .unwrap();
        assert!(second.is_extend());

        buffer
            .add_one(event_at(25_000, "https://b.test"), 30.0)
            .await
            .unwrap();

        let events = buffer.read_all().await.unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].duration_ms, 20_000);
        assert_eq!(events[1].origin.url, "https://b.test");
    }

    #[tokio::test]
    async fn test_corrupt_contents_surface_codec_error() {
        let store = Arc::new(MemoryStore::with_entries([(
            DEFAULT_BUFFER_KEY,
            json!({ "not": "a list" }),
        )]));
        let err = EventBuffer::new(store).read_all().await.unwrap_err();
        assert!(matches!(err, PulseError::Codec(_)));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_add_one_loses_nothing() {
        let buffer = Arc::new(buffer());

        let tasks: Vec<_> = (0..32)
            .map(|i| {
                let buffer = buffer.clone();
                tokio::spawn(async move {
                    // Distinct urls: every call must append
                    buffer
                        .add_one(event_at(i, &format!("https://{i}.test")), 30.0)
                        .await
                        .unwrap();
                })
            })
            .collect();
        for task in tasks {
            task.await.unwrap();
        }

        assert_eq!(buffer.read_all().await.unwrap().len(), 32);
    }

    #[tokio::test]
    async fn test_watcher_reports_pending_count() {
        let buffer = buffer();
        let mut watcher = buffer.subscribe();

        buffer.add_one(event_at(0, "https://a.test"), 30.0).await.unwrap();
        assert_eq!(watcher.changed().await, Some(1));

        buffer.add_one(event_at(1, "https://b.test"), 30.0).await.unwrap();
        assert_eq!(watcher.changed().await, Some(2));

        buffer.clear().await.unwrap();
        assert_eq!(watcher.changed().await, Some(0));
    }
}
