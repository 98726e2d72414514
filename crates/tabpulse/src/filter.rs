//! Validity filter: buffered events to wire records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;
use url::Url;

use crate::event::ActivityEvent;

/// Schemes the collector accepts.
pub const ALLOWED_SCHEMES: &[&str] = &["http", "https"];

/// Buffer durations are milliseconds, the wire wants seconds.
const MILLIS_PER_SECOND: f64 = 1000.0;

/// One activity record as posted to the collector.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransportRecord {
    pub timestamp: DateTime<Utc>,
    /// Seconds.
    pub duration: f64,
    pub url: String,
    pub title: String,
    pub scheme: String,
    pub host: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub actor: Option<String>,
}

impl TransportRecord {
    /// Decompose an event's locator. Unparseable locators yield empty
    /// scheme and host rather than an error.
    pub fn from_event(event: &ActivityEvent) -> Self {
        let (scheme, host) = match Url::parse(&event.origin.url) {
            Ok(url) => (
                url.scheme().to_string(),
                url.host_str().unwrap_or_default().to_string(),
            ),
            Err(_) => (String::new(), String::new()),
        };

        Self {
            timestamp: event.timestamp,
            duration: event.duration_ms as f64 / MILLIS_PER_SECOND,
            url: event.origin.url.clone(),
            title: event.origin.title.clone(),
            scheme,
            host,
            actor: event.actor.clone(),
        }
    }

    pub fn is_deliverable(&self) -> bool {
        ALLOWED_SCHEMES.contains(&self.scheme.as_str()) && !self.host.is_empty()
    }
}

/// Map events to wire records, dropping any that can't be attributed to a
/// web origin. Order is preserved.
pub fn to_transport_records(events: &[ActivityEvent]) -> Vec<TransportRecord> {
    events
        .iter()
        .map(TransportRecord::from_event)
        .filter(|record| {
            let keep = record.is_deliverable();
            if !keep {
                debug!(url = %record.url, scheme = %record.scheme, "dropping undeliverable event");
            }
            keep
        })
        .collect()
}
