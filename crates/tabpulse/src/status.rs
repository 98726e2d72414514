//! Collector reachability probe.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

use crate::config::{is_routing_label, PipelineConfig};
use crate::error::{PulseError, Result};
use crate::policy::SyncPolicy;
use crate::retry::with_retry;
use crate::store::KvStore;
use crate::transport::Transport;

/// Store key the last probe result is written to.
pub const STATUS_KEY: &str = "collector_status";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollectorStatus {
    pub reachable: bool,
    /// Last HTTP status seen, if any response arrived.
    pub status: Option<u16>,
    pub checked_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Error)]
enum ProbeError {
    #[error("collector answered {0}")]
    Rejected(u16),
    #[error(transparent)]
    Transport(anyhow::Error),
}

/// Probe the collector's status endpoint, retrying per the configured
/// policy, and record the result under [`STATUS_KEY`].
///
/// Unsatisfied policy yields an unreachable status without any request.
pub async fn probe_status<S, T>(
    store: &S,
    policy: &SyncPolicy,
    transport: &T,
    config: &PipelineConfig,
) -> Result<CollectorStatus>
where
    S: KvStore + ?Sized,
    T: Transport + ?Sized,
{
    let status = match policy.headers().filter(|_| policy.enabled) {
        None => {
            debug!("sync policy unsatisfied, not probing");
            unreachable_status("sync not configured")
        }
        Some(headers) if !is_routing_label(&headers.token) => {
            debug!(routing = %headers.token, "routing identifier is not a DNS label, not probing");
            unreachable_status("invalid routing identifier")
        }
        Some(headers) => {
            let url = config.status_url(&headers.token)?;
            let (url, headers) = (url.as_str(), &headers);
            let result = with_retry(&config.probe_retry, || async move {
                match transport.probe(url, headers).await {
                    Ok(response) if response.is_success() => Ok(response.status),
                    Ok(response) => Err(ProbeError::Rejected(response.status)),
                    Err(e) => Err(ProbeError::Transport(e)),
                }
            })
            .await;

            match result {
                Ok(code) => CollectorStatus {
                    reachable: true,
                    status: Some(code),
                    checked_at: Utc::now(),
                    error: None,
                },
                Err(error) => CollectorStatus {
                    reachable: false,
                    status: match error {
                        ProbeError::Rejected(code) => Some(code),
                        ProbeError::Transport(_) => None,
                    },
                    checked_at: Utc::now(),
                    error: Some(error.to_string()),
                },
            }
        }
    };

    info!(reachable = status.reachable, status = ?status.status, "collector probed");
    let value = serde_json::to_value(&status)?;
    store
        .set(STATUS_KEY, value)
        .await
        .map_err(PulseError::Storage)?;
    Ok(status)
}

fn unreachable_status(reason: &str) -> CollectorStatus {
    CollectorStatus {
        reachable: false,
        status: None,
        checked_at: Utc::now(),
        error: Some(reason.to_string()),
    }
}
