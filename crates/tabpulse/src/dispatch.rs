//! Batched sync dispatcher.
//!
//! One cycle reads the whole buffer, filters it, sends it in fixed-size
//! batches and empties the buffer only if every batch was accepted. The
//! buffer lock is held for the entire cycle, so events recorded meanwhile
//! wait for the cycle to finish instead of being cleared unsent.

use tracing::{debug, info, warn, Instrument};
use uuid::Uuid;

use crate::buffer::EventBuffer;
use crate::config::{is_routing_label, PipelineConfig};
use crate::error::{Result, SkipReason, SyncOutcome};
use crate::filter::{to_transport_records, TransportRecord};
use crate::policy::SyncPolicy;
use crate::store::KvStore;
use crate::transport::Transport;

/// Split records into order-preserving batches; the last may be short.
///
/// A `batch_size` of zero is treated as one. [`run_sync_cycle`] rejects it
/// through [`PipelineConfig::validate`] before getting here.
pub fn batches(records: &[TransportRecord], batch_size: usize) -> impl Iterator<Item = &[TransportRecord]> {
    records.chunks(batch_size.max(1))
}

/// Run one sync cycle.
///
/// Failed batches are not retried here; the buffer keeps everything and the
/// next cycle resends it. Apart from an invalid `config`, only storage
/// faults are returned as errors.
pub async fn run_sync_cycle<S, T>(
    buffer: &EventBuffer<S>,
    policy: &SyncPolicy,
    transport: &T,
    config: &PipelineConfig,
) -> Result<SyncOutcome>
where
    S: KvStore + ?Sized,
    T: Transport + ?Sized,
{
    let cycle_id = Uuid::new_v4();
    let span = tracing::info_span!("sync_cycle", %cycle_id);
    sync_cycle(buffer, policy, transport, config)
        .instrument(span)
        .await
}

async fn sync_cycle<S, T>(
    buffer: &EventBuffer<S>,
    policy: &SyncPolicy,
    transport: &T,
    config: &PipelineConfig,
) -> Result<SyncOutcome>
where
    S: KvStore + ?Sized,
    T: Transport + ?Sized,
{
    config.validate()?;
    if !policy.enabled {
        debug!("sync disabled by policy");
        return Ok(SyncOutcome::Skipped(SkipReason::Disabled));
    }
    let Some(headers) = policy.headers() else {
        debug!("tenant or routing identifier missing");
        return Ok(SyncOutcome::Skipped(SkipReason::MissingCredentials));
    };
    if !is_routing_label(&headers.token) {
        warn!(routing = %headers.token, "routing identifier is not a DNS label");
        return Ok(SyncOutcome::Skipped(SkipReason::InvalidRouting));
    }
    let url = config.collector_url(&headers.token)?;

    let guard = buffer.lock().await;
    let events = guard.read_all().await?;
    if events.is_empty() {
        debug!("buffer empty");
        return Ok(SyncOutcome::Skipped(SkipReason::EmptyBuffer));
    }

    let records = to_transport_records(&events);
    if records.is_empty() {
        // Undeliverable events stay buffered; dropping them is not this
        // cycle's call.
        debug!(buffered = events.len(), "no deliverable events");
        return Ok(SyncOutcome::Skipped(SkipReason::NothingValid));
    }

    let mut any_attempted = false;
    let mut all_succeeded = true;
    let mut attempted = 0usize;
    let mut failed = 0usize;

    for (index, batch) in batches(&records, config.batch_size).enumerate() {
        any_attempted = true;
        attempted += 1;

        match transport.send(url.as_str(), &headers, batch).await {
            Ok(response) if response.is_success() => {
                debug!(batch = index, size = batch.len(), status = response.status, "batch accepted");
            }
            Ok(response) => {
                all_succeeded = false;
                failed += 1;
                warn!(batch = index, size = batch.len(), status = response.status, "batch rejected");
            }
            Err(error) => {
                all_succeeded = false;
                failed += 1;
                warn!(batch = index, size = batch.len(), error = %error, "batch send failed");
            }
        }
    }

    match (any_attempted, all_succeeded) {
        (true, true) => {
            guard.clear().await?;
            info!(batches = attempted, records = records.len(), "sync complete, buffer cleared");
            Ok(SyncOutcome::Cleared {
                batches: attempted,
                records: records.len(),
            })
        }
        (true, false) => {
            warn!(attempted, failed, buffered = events.len(), "sync incomplete, buffer retained");
            Ok(SyncOutcome::PartialFailure { attempted, failed })
        }
        (false, _) => Ok(SyncOutcome::Skipped(SkipReason::NothingValid)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{ActivityEvent, Origin};
    use crate::store::MemoryStore;
    use crate::transport::{CollectorHeaders, TransportResponse};
    use async_trait::async_trait;
    use chrono::{TimeZone, Utc};
    use std::sync::{Arc, Mutex};

    // Answers each send with the next scripted status; `None` is a network error.
    struct ScriptTransport {
        script: Mutex<Vec<Option<u16>>>,
        sent: Mutex<Vec<(String, CollectorHeaders, usize)>>,
    }

    impl ScriptTransport {
        fn new(script: Vec<Option<u16>>) -> Self {
            Self {
                script: Mutex::new(script),
                sent: Mutex::new(Vec::new()),
            }
        }

        fn sent(&self) -> Vec<(String, CollectorHeaders, usize)> {
            self.sent.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Transport for ScriptTransport {
        async fn send(
            &self,
            url: &str,
            headers: &CollectorHeaders,
            body: &[TransportRecord],
        ) -> anyhow::Result<TransportResponse> {
            self.sent
                .lock()
                .unwrap()
                .push((url.to_string(), headers.clone(), body.len()));
            let mut script = self.script.lock().unwrap();
            let next = if script.is_empty() { Some(200) } else { script.remove(0) };
            match next {
                Some(status) => Ok(TransportResponse::new(status)),
                None => Err(anyhow::anyhow!("connection reset")),
            }
        }

        async fn probe(&self, _url: &str, _headers: &CollectorHeaders) -> anyhow::Result<TransportResponse> {
            Ok(TransportResponse::new(200))
        }
    }

    fn event(i: i64, url: &str) -> ActivityEvent {
        ActivityEvent::new(Utc.timestamp_millis_opt(i * 1_000).unwrap(), Origin::new(url, "t"))
    }

    async fn filled(events: Vec<ActivityEvent>) -> EventBuffer<MemoryStore> {
        let buffer = EventBuffer::new(Arc::new(MemoryStore::new()));
        for event in events {
            buffer.append(event).await.unwrap();
        }
        buffer
    }

    fn policy() -> SyncPolicy {
        SyncPolicy::enabled("acme", "eu1")
    }

    fn config() -> PipelineConfig {
        PipelineConfig::default().with_endpoint_template("https://{routing}.pulse.test/ingest")
    }

    #[test]
    fn test_batches_preserve_order_and_leave_short_tail() {
        let records: Vec<_> = (0..7)
            .map(|i| TransportRecord::from_event(&event(i, "https://a.test")))
            .collect();
        let sizes: Vec<_> = batches(&records, 3).map(<[_]>::len).collect();
        assert_eq!(sizes, vec![3, 3, 1]);
    }

    #[tokio::test]
    async fn test_disabled_policy_skips_without_reading() {
        let buffer = filled(vec![event(0, "https://a.test")]).await;
        let transport = ScriptTransport::new(vec![]);
        let disabled = SyncPolicy {
            enabled: false,
            ..policy()
        };

        let outcome = run_sync_cycle(&buffer, &disabled, &transport, &config()).await.unwrap();

        assert_eq!(outcome, SyncOutcome::Skipped(SkipReason::Disabled));
        assert!(transport.sent().is_empty());
        assert_eq!(buffer.read_all().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_blank_routing_skips() {
        let buffer = filled(vec![event(0, "https://a.test")]).await;
        let transport = ScriptTransport::new(vec![]);

        let outcome = run_sync_cycle(&buffer, &SyncPolicy::enabled("acme", " "), &transport, &config())
            .await
            .unwrap();

        assert_eq!(outcome, SyncOutcome::Skipped(SkipReason::MissingCredentials));
        assert!(transport.sent().is_empty());
    }

    #[tokio::test]
    async fn test_empty_buffer_skips() {
        let buffer = filled(vec![]).await;
        let transport = ScriptTransport::new(vec![]);

        let outcome = run_sync_cycle(&buffer, &policy(), &transport, &config()).await.unwrap();
        assert_eq!(outcome, SyncOutcome::Skipped(SkipReason::EmptyBuffer));
    }

    #[tokio::test]
    async fn test_all_invalid_skips_and_retains() {
        let buffer = filled(vec![event(0, "chrome://newtab"), event(1, "about:blank")]).await;
        let transport = ScriptTransport::new(vec![]);

        let outcome = run_sync_cycle(&buffer, &policy(), &transport, &config()).await.unwrap();

        assert_eq!(outcome, SyncOutcome::Skipped(SkipReason::NothingValid));
        assert!(transport.sent().is_empty());
        assert_eq!(buffer.read_all().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_success_sends_headers_and_clears() {
        let buffer = filled(vec![
            event(0, "https://a.test"),
            event(1, "chrome://settings"),
            event(2, "https://b.test"),
        ])
        .await;
        let transport = ScriptTransport::new(vec![Some(201)]);

        let outcome = run_sync_cycle(&buffer, &policy(), &transport, &config()).await.unwrap();

        assert_eq!(outcome, SyncOutcome::Cleared { batches: 1, records: 2 });
        let sent = transport.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, "https://eu1.pulse.test/ingest");
        assert_eq!(sent[0].1.tenant, "acme");
        assert_eq!(sent[0].1.token, "eu1");
        assert_eq!(sent[0].2, 2);
        assert!(buffer.read_all().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_failure_does_not_stop_later_batches() {
        let events: Vec<_> = (0..5).map(|i| event(i, "https://a.test")).collect();
        let buffer = filled(events.clone()).await;
        let transport = ScriptTransport::new(vec![None, Some(500), Some(200)]);

        let outcome = run_sync_cycle(
            &buffer,
            &policy(),
            &transport,
            &config().with_batch_size(2),
        )
        .await
        .unwrap();

        assert_eq!(outcome, SyncOutcome::PartialFailure { attempted: 3, failed: 2 });
        assert_eq!(transport.sent().len(), 3);
        assert_eq!(buffer.read_all().await.unwrap(), events);
    }

    #[tokio::test]
    async fn test_routing_that_would_change_host_skips() {
        let buffer = filled(vec![event(0, "https://a.test")]).await;
        let transport = ScriptTransport::new(vec![]);

        let outcome = run_sync_cycle(
            &buffer,
            &SyncPolicy::enabled("acme", "evil.example/x?"),
            &transport,
            &config(),
        )
        .await
        .unwrap();

        assert_eq!(outcome, SyncOutcome::Skipped(SkipReason::InvalidRouting));
        assert!(transport.sent().is_empty());
        assert_eq!(buffer.read_all().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_routing_that_is_not_a_host_skips_without_error() {
        let buffer = filled(vec![event(0, "https://a.test")]).await;
        let transport = ScriptTransport::new(vec![]);

        let outcome = run_sync_cycle(&buffer, &SyncPolicy::enabled("acme", "eu 1"), &transport, &config())
            .await
            .unwrap();

        assert_eq!(outcome, SyncOutcome::Skipped(SkipReason::InvalidRouting));
        assert!(transport.sent().is_empty());
    }

    #[tokio::test]
    async fn test_zero_batch_size_is_a_config_error() {
        let buffer = filled(vec![event(0, "https://a.test")]).await;
        let transport = ScriptTransport::new(vec![]);

        let err = run_sync_cycle(&buffer, &policy(), &transport, &config().with_batch_size(0))
            .await
            .unwrap_err();

        assert!(matches!(err, crate::error::PulseError::Config(_)));
        assert!(transport.sent().is_empty());
        assert_eq!(buffer.read_all().await.unwrap().len(), 1);
    }
}
