//! Activity events as they live in the buffer.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// What was active: the page locator and its display label.
///
/// Only `url` participates in merge equality.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Origin {
    pub url: String,
    pub title: String,
}

impl Origin {
    pub fn new(url: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            title: title.into(),
        }
    }
}

/// A buffered activity session.
///
/// `timestamp` is the session start and never changes after creation.
/// `duration_ms` only grows while the event is the buffer tail.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActivityEvent {
    pub timestamp: DateTime<Utc>,
    pub duration_ms: u64,
    pub origin: Origin,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub actor: Option<String>,
}

impl ActivityEvent {
    /// A zero-length event starting at `timestamp`.
    pub fn new(timestamp: DateTime<Utc>, origin: Origin) -> Self {
        Self {
            timestamp,
            duration_ms: 0,
            origin,
            actor: None,
        }
    }

    pub fn with_actor(mut self, actor: impl Into<String>) -> Self {
        self.actor = Some(actor.into());
        self
    }

    pub fn with_duration_ms(mut self, duration_ms: u64) -> Self {
        self.duration_ms = duration_ms;
        self
    }

    /// Instant at which the session currently ends, or `None` if the
    /// duration runs past what a timestamp can represent.
    pub fn end(&self) -> Option<DateTime<Utc>> {
        let millis = i64::try_from(self.duration_ms).ok()?;
        self.timestamp
            .checked_add_signed(chrono::TimeDelta::try_milliseconds(millis)?)
    }
}

/// A single observation handed in by the presence source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Presence {
    pub url: String,
    pub title: String,
    pub actor: Option<String>,
}

impl Presence {
    pub fn new(url: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            title: title.into(),
            actor: None,
        }
    }

    pub fn with_actor(mut self, actor: impl Into<String>) -> Self {
        self.actor = Some(actor.into());
        self
    }

    /// Turn the observation into a merge candidate anchored at `at`.
    pub fn into_candidate(self, at: DateTime<Utc>) -> ActivityEvent {
        ActivityEvent {
            timestamp: at,
            duration_ms: 0,
            origin: Origin::new(self.url, self.title),
            actor: self.actor.filter(|actor| !actor.trim().is_empty()),
        }
    }
}
