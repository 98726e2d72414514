//! Key-value persistence capability.
//!
//! The pipeline keeps its event buffer, policy flags and collector status in
//! a store exposing `get`, `set` and per-key change subscriptions. Durable
//! backends live outside this crate; [`MemoryStore`] is the in-process one.

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::Value;
use tokio::sync::broadcast;

/// Buffered notifications per key before slow subscribers start lagging.
pub const CHANGE_CHANNEL_CAPACITY: usize = 64;

/// Persistence collaborator.
#[async_trait]
pub trait KvStore: Send + Sync + 'static {
    /// Current value of `key`, or `None` if it was never set.
    async fn get(&self, key: &str) -> Result<Option<Value>>;

    /// Replace the value of `key`. Subscribers of `key` see the new value
    /// once this returns `Ok`.
    async fn set(&self, key: &str, value: Value) -> Result<()>;

    /// Receive every value subsequently written to `key`.
    fn subscribe(&self, key: &str) -> broadcast::Receiver<Value>;
}

#[async_trait]
impl<S: KvStore + ?Sized> KvStore for Arc<S> {
    async fn get(&self, key: &str) -> Result<Option<Value>> {
        (**self).get(key).await
    }

    async fn set(&self, key: &str, value: Value) -> Result<()> {
        (**self).set(key, value).await
    }

    fn subscribe(&self, key: &str) -> broadcast::Receiver<Value> {
        (**self).subscribe(key)
    }
}

/// Per-key broadcast fan-out shared by store implementations.
#[derive(Debug, Default)]
pub struct ChangeNotifier {
    channels: DashMap<String, broadcast::Sender<Value>>,
}

impl ChangeNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, key: &str) -> broadcast::Receiver<Value> {
        self.channels
            .entry(key.to_string())
            .or_insert_with(|| broadcast::channel(CHANGE_CHANNEL_CAPACITY).0)
            .subscribe()
    }

    /// Publish `value` to subscribers of `key`. No-op without subscribers.
    pub fn notify(&self, key: &str, value: &Value) {
        if let Some(sender) = self.channels.get(key) {
            // Err only means every receiver is gone
            let _ = sender.send(value.clone());
        }
    }
}

/// In-memory store. Contents live as long as the value does.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: DashMap<String, Value>,
    notifier: ChangeNotifier,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a store with fixed entries, without notifying anyone.
    pub fn with_entries<K, I>(entries: I) -> Self
    where
        K: Into<String>,
        I: IntoIterator<Item = (K, Value)>,
    {
        let store = Self::new();
        for (key, value) in entries {
            store.entries.insert(key.into(), value);
        }
        store
    }
}

#[async_trait]
impl KvStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<Value>> {
        Ok(self.entries.get(key).map(|entry| entry.value().clone()))
    }

    async fn set(&self, key: &str, value: Value) -> Result<()> {
        self.entries.insert(key.to_string(), value.clone());
        self.notifier.notify(key, &value);
        Ok(())
    }

    fn subscribe(&self, key: &str) -> broadcast::Receiver<Value> {
        self.notifier.subscribe(key)
    }
}
