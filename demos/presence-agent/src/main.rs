//! # Presence Agent
//!
//! Reads presence observations from stdin (`url<TAB>title`, one per line),
//! records them into a file-backed buffer and syncs to the collector on a
//! timer.
//!
//! ```text
//! TABPULSE_TENANT=acme TABPULSE_ROUTING=eu1 TABPULSE_SYNC_ENABLED=true \
//!     cargo run -p presence-agent < visits.tsv
//! ```

use std::env;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use serde_json::json;
use tabpulse::{
    KvStore, PipelineBuilder, PipelineConfig, Presence, StorePolicy, ROUTING_KEY,
    SYNC_ENABLED_KEY, TENANT_KEY,
};
use tabpulse_http::HttpTransport;
use tabpulse_persistence::JsonFileStore;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

// ============================================================================
// Configuration
// ============================================================================

async fn load_config() -> Result<PipelineConfig> {
    let Ok(path) = env::var("TABPULSE_CONFIG") else {
        return Ok(PipelineConfig::default());
    };
    let raw = tokio::fs::read(&path)
        .await
        .with_context(|| format!("reading config {path}"))?;
    serde_json::from_slice(&raw).with_context(|| format!("parsing config {path}"))
}

/// Mirror policy from the environment into the store, the way managed
/// settings would land there.
async fn seed_policy(store: &JsonFileStore) -> Result<()> {
    if let Ok(enabled) = env::var("TABPULSE_SYNC_ENABLED") {
        store
            .set(SYNC_ENABLED_KEY, json!(enabled.eq_ignore_ascii_case("true")))
            .await?;
    }
    if let Ok(tenant) = env::var("TABPULSE_TENANT") {
        store.set(TENANT_KEY, json!(tenant)).await?;
    }
    if let Ok(routing) = env::var("TABPULSE_ROUTING") {
        store.set(ROUTING_KEY, json!(routing)).await?;
    }
    Ok(())
}

fn parse_line(line: &str) -> Option<Presence> {
    let line = line.trim_end();
    if line.is_empty() {
        return None;
    }
    let (url, title) = line.split_once('\t').unwrap_or((line, ""));
    let mut presence = Presence::new(url, title);
    if let Ok(actor) = env::var("TABPULSE_ACTOR") {
        presence = presence.with_actor(actor);
    }
    Some(presence)
}

// ============================================================================
// Main
// ============================================================================

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "tabpulse=debug,presence_agent=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = load_config().await?;
    let state_path = env::var("TABPULSE_STATE")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("tabpulse-state.json"));

    let store = Arc::new(JsonFileStore::open(&state_path).await?);
    seed_policy(&store).await?;

    let transport = Arc::new(HttpTransport::with_timeout(Duration::from_secs(10))?);
    let pipeline = Arc::new(
        PipelineBuilder::new(store.clone(), transport, Arc::new(StorePolicy::new(store)))
            .with_config(config)
            .build()?,
    );

    let status = pipeline.probe_status().await?;
    tracing::info!(reachable = status.reachable, "collector status");

    let mut watcher = pipeline.buffer().subscribe();
    tokio::spawn(async move {
        while let Some(pending) = watcher.changed().await {
            tracing::info!(pending, "buffer changed");
        }
    });

    let handle = pipeline.clone().start();

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        if let Some(presence) = parse_line(&line) {
            pipeline.record_now(presence).await?;
        }
    }

    // Stdin closed: one last flush before exiting
    handle.shutdown().await;
    let outcome = pipeline.sync().await?;
    println!("final sync: {outcome:?}");

    Ok(())
}
