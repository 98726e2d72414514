//! Testing utilities for tabpulse.
//!
//! - [`ScriptedTransport`] answers batch sends from a script and records
//!   every request it saw.
//! - [`UnavailableStore`] fails every read and write, for storage-fault paths.
//! - [`event_at`] and friends build buffered events on a millisecond clock.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use serde_json::Value;
use tabpulse::{
    ActivityEvent, CollectorHeaders, KvStore, Origin, Transport, TransportRecord,
    TransportResponse,
};
use tokio::sync::broadcast;

/// Scripted reply to one request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reply {
    Status(u16),
    /// The request never got a response.
    NetworkError,
}

impl Reply {
    fn into_result(self) -> Result<TransportResponse> {
        match self {
            Reply::Status(status) => Ok(TransportResponse::new(status)),
            Reply::NetworkError => Err(anyhow!("connection reset by peer")),
        }
    }
}

/// One request seen by [`ScriptedTransport`].
#[derive(Debug, Clone, PartialEq)]
pub struct SentBatch {
    pub url: String,
    pub headers: CollectorHeaders,
    pub records: Vec<TransportRecord>,
}

#[derive(Default)]
struct Script {
    sends: VecDeque<Reply>,
    probes: VecDeque<Reply>,
}

/// Transport stub. Unscripted requests succeed with 200.
#[derive(Clone, Default)]
pub struct ScriptedTransport {
    script: Arc<Mutex<Script>>,
    sent: Arc<Mutex<Vec<SentBatch>>>,
    probes: Arc<Mutex<Vec<String>>>,
}

impl ScriptedTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every send succeeds.
    pub fn always_ok() -> Self {
        Self::new()
    }

    /// Replies for successive sends, in order.
    pub fn with_sends(self, replies: impl IntoIterator<Item = Reply>) -> Self {
        self.script.lock().unwrap().sends.extend(replies);
        self
    }

    /// Succeed on every send except the `n`-th (1-based).
    pub fn failing_nth(n: usize) -> Self {
        let replies = (1..=n).map(|i| {
            if i == n {
                Reply::Status(503)
            } else {
                Reply::Status(200)
            }
        });
        Self::new().with_sends(replies)
    }

    pub fn with_probes(self, replies: impl IntoIterator<Item = Reply>) -> Self {
        self.script.lock().unwrap().probes.extend(replies);
        self
    }

    pub fn sent(&self) -> Vec<SentBatch> {
        self.sent.lock().unwrap().clone()
    }

    pub fn probed(&self) -> Vec<String> {
        self.probes.lock().unwrap().clone()
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn send(
        &self,
        url: &str,
        headers: &CollectorHeaders,
        body: &[TransportRecord],
    ) -> Result<TransportResponse> {
        self.sent.lock().unwrap().push(SentBatch {
            url: url.to_string(),
            headers: headers.clone(),
            records: body.to_vec(),
        });
        let reply = self.script.lock().unwrap().sends.pop_front();
        reply.unwrap_or(Reply::Status(200)).into_result()
    }

    async fn probe(&self, url: &str, _headers: &CollectorHeaders) -> Result<TransportResponse> {
        self.probes.lock().unwrap().push(url.to_string());
        let reply = self.script.lock().unwrap().probes.pop_front();
        reply.unwrap_or(Reply::Status(200)).into_result()
    }
}

/// A store whose backing medium is gone.
#[derive(Debug, Default)]
pub struct UnavailableStore;

#[async_trait]
impl KvStore for UnavailableStore {
    async fn get(&self, key: &str) -> Result<Option<Value>> {
        Err(anyhow!("storage unavailable reading {key}"))
    }

    async fn set(&self, key: &str, _value: Value) -> Result<()> {
        Err(anyhow!("storage unavailable writing {key}"))
    }

    fn subscribe(&self, _key: &str) -> broadcast::Receiver<Value> {
        broadcast::channel(1).1
    }
}

/// Instant `ms` milliseconds after the epoch.
pub fn at_ms(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms)
        .single()
        .unwrap_or(DateTime::<Utc>::UNIX_EPOCH)
}

/// Zero-length event for `url` starting at `ms`.
pub fn event_at(ms: i64, url: &str) -> ActivityEvent {
    ActivityEvent::new(at_ms(ms), Origin::new(url, format!("title of {url}")))
}

/// `count` distinct deliverable events, one second apart.
pub fn web_events(count: usize) -> Vec<ActivityEvent> {
    (0..count)
        .map(|i| event_at(i as i64 * 1_000, &format!("https://site{i}.test/page")))
        .collect()
}
