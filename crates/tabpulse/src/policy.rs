//! Sync policy resolution.
//!
//! Policy is looked up fresh on every cycle and never cached here.

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;

use crate::store::KvStore;
use crate::transport::CollectorHeaders;

pub const SYNC_ENABLED_KEY: &str = "sync_enabled";
pub const TENANT_KEY: &str = "tenant_id";
pub const ROUTING_KEY: &str = "routing_id";

/// Whether and where to sync.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncPolicy {
    pub enabled: bool,
    pub tenant: Option<String>,
    pub routing: Option<String>,
}

impl SyncPolicy {
    pub fn enabled(tenant: impl Into<String>, routing: impl Into<String>) -> Self {
        Self {
            enabled: true,
            tenant: Some(tenant.into()),
            routing: Some(routing.into()),
        }
    }

    /// Both identifiers, if present and non-blank.
    pub fn headers(&self) -> Option<CollectorHeaders> {
        let tenant = non_blank(self.tenant.as_deref())?;
        let token = non_blank(self.routing.as_deref())?;
        Some(CollectorHeaders {
            tenant: tenant.to_string(),
            token: token.to_string(),
        })
    }
}

fn non_blank(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|v| !v.is_empty())
}

/// Policy collaborator.
#[async_trait]
pub trait PolicySource: Send + Sync + 'static {
    async fn resolve(&self) -> Result<SyncPolicy>;
}

/// A policy fixed at construction.
#[derive(Debug, Clone, Default)]
pub struct StaticPolicy(pub SyncPolicy);

#[async_trait]
impl PolicySource for StaticPolicy {
    async fn resolve(&self) -> Result<SyncPolicy> {
        Ok(self.0.clone())
    }
}

/// Policy read from well-known keys of a store (e.g. managed configuration
/// mirrored into local storage). An absent or non-boolean enable flag means
/// disabled.
pub struct StorePolicy<S: KvStore + ?Sized> {
    store: Arc<S>,
}

impl<S: KvStore + ?Sized> StorePolicy<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl<S: KvStore + ?Sized> PolicySource for StorePolicy<S> {
    async fn resolve(&self) -> Result<SyncPolicy> {
        let enabled = self
            .store
            .get(SYNC_ENABLED_KEY)
            .await?
            .and_then(|v| v.as_bool())
            .unwrap_or(false);
        let tenant = string_value(self.store.get(TENANT_KEY).await?);
        let routing = string_value(self.store.get(ROUTING_KEY).await?);

        Ok(SyncPolicy {
            enabled,
            tenant,
            routing,
        })
    }
}

fn string_value(value: Option<Value>) -> Option<String> {
    match value? {
        Value::String(s) => Some(s),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use serde_json::json;

    #[test]
    fn test_headers_require_both_identifiers() {
        assert!(SyncPolicy::enabled("acme", "eu1").headers().is_some());
        assert!(SyncPolicy::enabled("acme", "  ").headers().is_none());
        assert!(SyncPolicy::enabled("", "eu1").headers().is_none());
        assert!(SyncPolicy::default().headers().is_none());
    }

    #[test]
    fn test_headers_are_trimmed() {
        let headers = SyncPolicy::enabled(" acme ", "eu1\n").headers().unwrap();
        assert_eq!(headers.tenant, "acme");
        assert_eq!(headers.token, "eu1");
    }

    #[tokio::test]
    async fn test_store_policy_defaults_to_disabled() {
        let policy = StorePolicy::new(Arc::new(MemoryStore::new()))
            .resolve()
            .await
            .unwrap();
        assert_eq!(policy, SyncPolicy::default());
    }

    #[tokio::test]
    async fn test_store_policy_reads_keys_each_time() {
        let store = Arc::new(MemoryStore::with_entries([
            (SYNC_ENABLED_KEY, json!(true)),
            (TENANT_KEY, json!("acme")),
            (ROUTING_KEY, json!(42)),
        ]));
        let source = StorePolicy::new(store.clone());

        let first = source.resolve().await.unwrap();
        assert!(first.enabled);
        assert_eq!(first.routing, None);

        store.set(ROUTING_KEY, json!("eu1")).await.unwrap();
        let second = source.resolve().await.unwrap();
        assert_eq!(second, SyncPolicy::enabled("acme", "eu1"));
    }
}
