//! Pipeline configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use url::Url;

use crate::buffer::DEFAULT_BUFFER_KEY;
use crate::error::{PulseError, Result};
use crate::retry::RetryPolicy;

/// Placeholder in [`PipelineConfig::endpoint_template`] replaced by the
/// routing identifier.
pub const ROUTING_PLACEHOLDER: &str = "{routing}";

/// Longest DNS label.
const MAX_LABEL_LEN: usize = 63;

/// Whether `routing` is a single DNS label (`[A-Za-z0-9-]`, no leading or
/// trailing hyphen). Only such identifiers are substituted into the
/// endpoint, so a routing value can never change the collector's host.
pub fn is_routing_label(routing: &str) -> bool {
    !routing.is_empty()
        && routing.len() <= MAX_LABEL_LEN
        && !routing.starts_with('-')
        && !routing.ends_with('-')
        && routing.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'-')
}

pub const DEFAULT_BATCH_SIZE: usize = 100;
pub const DEFAULT_PULSE_WINDOW_SECS: f64 = 30.0;

/// Tunables for merging, batching and scheduling.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Largest gap between a session's end and a candidate that still
    /// continues the session. Zero and negative values are allowed.
    pub pulse_window_secs: f64,
    pub batch_size: usize,
    #[serde(rename = "sync_interval_secs", with = "duration_secs")]
    pub sync_interval: Duration,
    /// Collector URL, e.g. `https://{routing}.collector.example/api/v1/activity`.
    pub endpoint_template: String,
    /// Path of the status endpoint on the collector's origin.
    pub status_path: String,
    pub buffer_key: String,
    pub probe_retry: RetryPolicy,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            pulse_window_secs: DEFAULT_PULSE_WINDOW_SECS,
            batch_size: DEFAULT_BATCH_SIZE,
            sync_interval: Duration::from_secs(60),
            endpoint_template: "https://{routing}.collector.example/api/v1/activity".to_string(),
            status_path: "/api/v1/status".to_string(),
            buffer_key: DEFAULT_BUFFER_KEY.to_string(),
            probe_retry: RetryPolicy::default(),
        }
    }
}

impl PipelineConfig {
    pub fn with_pulse_window_secs(mut self, secs: f64) -> Self {
        self.pulse_window_secs = secs;
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn with_sync_interval(mut self, interval: Duration) -> Self {
        self.sync_interval = interval;
        self
    }

    pub fn with_endpoint_template(mut self, template: impl Into<String>) -> Self {
        self.endpoint_template = template.into();
        self
    }

    pub fn with_status_path(mut self, path: impl Into<String>) -> Self {
        self.status_path = path.into();
        self
    }

    pub fn with_buffer_key(mut self, key: impl Into<String>) -> Self {
        self.buffer_key = key.into();
        self
    }

    pub fn with_probe_retry(mut self, policy: RetryPolicy) -> Self {
        self.probe_retry = policy;
        self
    }

    /// Reject settings the pipeline cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.batch_size == 0 {
            return Err(PulseError::Config("batch_size must be at least 1".into()));
        }
        if self.pulse_window_secs.is_nan() {
            return Err(PulseError::Config("pulse_window_secs is NaN".into()));
        }
        if self.sync_interval.is_zero() {
            return Err(PulseError::Config("sync_interval must be positive".into()));
        }
        if self.buffer_key.is_empty() {
            return Err(PulseError::Config("buffer_key is empty".into()));
        }
        self.collector_url("validate")?;
        Ok(())
    }

    /// Collector URL for a routing identifier.
    ///
    /// Fails with [`PulseError::Precondition`] unless `routing` passes
    /// [`is_routing_label`].
    pub fn collector_url(&self, routing: &str) -> Result<Url> {
        if !is_routing_label(routing) {
            return Err(PulseError::Precondition(
                "routing identifier must be a single DNS label",
            ));
        }
        let raw = self.endpoint_template.replace(ROUTING_PLACEHOLDER, routing);
        Url::parse(&raw).map_err(|e| {
            PulseError::Config(format!("endpoint {raw:?} is not a valid URL: {e}"))
        })
    }

    /// Status endpoint on the same origin as the collector.
    pub fn status_url(&self, routing: &str) -> Result<Url> {
        let collector = self.collector_url(routing)?;
        collector.join(&self.status_path).map_err(|e| {
            PulseError::Config(format!("status path {:?}: {e}", self.status_path))
        })
    }
}

/// `Duration` as whole milliseconds.
pub(crate) mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(deserializer)?))
    }
}

/// `Duration` as whole seconds.
pub(crate) mod duration_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_secs(u64::deserialize(deserializer)?))
    }
}
