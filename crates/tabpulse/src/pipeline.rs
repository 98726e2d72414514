//! Wiring and the periodic sync trigger.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info};

use crate::buffer::EventBuffer;
use crate::config::PipelineConfig;
use crate::dispatch::run_sync_cycle;
use crate::error::{PulseError, Result, SyncOutcome};
use crate::event::Presence;
use crate::merge::MergeResult;
use crate::policy::{PolicySource, SyncPolicy};
use crate::status::{probe_status, CollectorStatus};
use crate::store::KvStore;
use crate::transport::Transport;

/// Name of the periodic trigger.
pub const SYNC_TRIGGER: &str = "sync";
/// Name used for [`PipelineHandle::trigger_now`].
pub const MANUAL_TRIGGER: &str = "manual";

/// Builder for [`Pipeline`].
pub struct PipelineBuilder<S: ?Sized, T: ?Sized, P: ?Sized> {
    store: Arc<S>,
    transport: Arc<T>,
    policy: Arc<P>,
    config: PipelineConfig,
}

impl<S, T, P> PipelineBuilder<S, T, P>
where
    S: KvStore + ?Sized,
    T: Transport + ?Sized,
    P: PolicySource + ?Sized,
{
    pub fn new(store: Arc<S>, transport: Arc<T>, policy: Arc<P>) -> Self {
        Self {
            store,
            transport,
            policy,
            config: PipelineConfig::default(),
        }
    }

    pub fn with_config(mut self, config: PipelineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn build(self) -> Result<Pipeline<S, T, P>> {
        self.config.validate()?;
        Ok(Pipeline {
            buffer: EventBuffer::with_key(self.store, self.config.buffer_key.clone()),
            transport: self.transport,
            policy: self.policy,
            config: self.config,
        })
    }
}

/// The recording and sync entry points over one buffer.
pub struct Pipeline<S: KvStore + ?Sized, T: ?Sized, P: ?Sized> {
    buffer: EventBuffer<S>,
    transport: Arc<T>,
    policy: Arc<P>,
    config: PipelineConfig,
}

impl<S, T, P> Pipeline<S, T, P>
where
    S: KvStore + ?Sized,
    T: Transport + ?Sized,
    P: PolicySource + ?Sized,
{
    pub fn buffer(&self) -> &EventBuffer<S> {
        &self.buffer
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Record a presence observed at `at`.
    pub async fn record(&self, presence: Presence, at: DateTime<Utc>) -> Result<MergeResult> {
        self.buffer
            .add_one(presence.into_candidate(at), self.config.pulse_window_secs)
            .await
    }

    pub async fn record_now(&self, presence: Presence) -> Result<MergeResult> {
        self.record(presence, Utc::now()).await
    }

    /// Run one sync cycle against freshly resolved policy.
    pub async fn sync(&self) -> Result<SyncOutcome> {
        let policy = self.resolve_policy().await?;
        run_sync_cycle(&self.buffer, &policy, self.transport.as_ref(), &self.config).await
    }

    /// Probe the collector and store the result.
    pub async fn probe_status(&self) -> Result<CollectorStatus> {
        let policy = self.resolve_policy().await?;
        probe_status(
            self.buffer.store().as_ref(),
            &policy,
            self.transport.as_ref(),
            &self.config,
        )
        .await
    }

    async fn resolve_policy(&self) -> Result<SyncPolicy> {
        self.policy.resolve().await.map_err(PulseError::Storage)
    }

    async fn fire(&self, trigger: &str) {
        match self.sync().await {
            Ok(outcome) => debug!(trigger, ?outcome, "sync cycle finished"),
            Err(e) => error!(trigger, error = %e, "sync cycle failed"),
        }
    }

    /// Spawn the periodic trigger.
    ///
    /// One cycle runs at a time; interval ticks that elapse during a cycle
    /// are skipped rather than queued. Dropping the handle also stops it.
    pub fn start(self: Arc<Self>) -> PipelineHandle {
        let (trigger_tx, mut trigger_rx) = mpsc::channel::<&'static str>(1);
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let period = self.config.sync_interval;

        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            info!(period_secs = period.as_secs(), "sync trigger started");

            loop {
                let trigger = tokio::select! {
                    biased;
                    _ = shutdown_rx.changed() => break,
                    Some(name) = trigger_rx.recv() => name,
                    _ = ticker.tick() => SYNC_TRIGGER,
                };
                self.fire(trigger).await;
            }

            info!("sync trigger stopped");
        });

        PipelineHandle {
            trigger_tx,
            shutdown_tx,
            task,
        }
    }
}

/// Control over a started pipeline.
pub struct PipelineHandle {
    trigger_tx: mpsc::Sender<&'static str>,
    shutdown_tx: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl PipelineHandle {
    /// Ask for a cycle now. Returns `false` if one is already pending.
    pub fn trigger_now(&self) -> bool {
        self.trigger_tx.try_send(MANUAL_TRIGGER).is_ok()
    }

    /// Stop the trigger, letting an in-flight cycle finish first.
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(true);
        if let Err(e) = self.task.await {
            error!(error = %e, "sync trigger task panicked");
        }
    }
}
