//! Instance registry
//!
//! Per-host trust (the blocked flag) and liveness telemetry. The blocked
//! flag is read from the store on every call; nothing here is cached.

use super::host::normalize_host;
use crate::data::{Database, Instance, InstanceUpdate};
use crate::error::FederationError;
use crate::metrics::INSTANCE_REQUESTS_RECEIVED;
use async_trait::async_trait;
use chrono::Utc;
use std::sync::Arc;
use tokio::task::JoinHandle;

/// Persistence for instance records
#[async_trait]
pub trait InstanceStore: Send + Sync {
    async fn find(&self, host: &str) -> Result<Option<Instance>, FederationError>;

    /// Create the record if needed, then apply the set fields
    async fn upsert(&self, host: &str, update: InstanceUpdate) -> Result<Instance, FederationError>;
}

#[async_trait]
impl InstanceStore for Database {
    async fn find(&self, host: &str) -> Result<Option<Instance>, FederationError> {
        Ok(self.get_instance(host).await?)
    }

    async fn upsert(&self, host: &str, update: InstanceUpdate) -> Result<Instance, FederationError> {
        Ok(self.upsert_instance(host, &update).await?)
    }
}

/// Host-level trust and telemetry
#[derive(Clone)]
pub struct InstanceRegistry {
    store: Arc<dyn InstanceStore>,
}

impl InstanceRegistry {
    pub fn new(store: Arc<dyn InstanceStore>) -> Self {
        Self { store }
    }

    /// Whether deliveries from `host` must be dropped
    pub async fn is_blocked(&self, host: &str) -> Result<bool, FederationError> {
        let host = normalize(host);
        Ok(self
            .store
            .find(&host)
            .await?
            .is_some_and(|instance| instance.is_blocked))
    }

    pub async fn block(&self, host: &str) -> Result<Instance, FederationError> {
        self.set_blocked(host, true).await
    }

    pub async fn unblock(&self, host: &str) -> Result<Instance, FederationError> {
        self.set_blocked(host, false).await
    }

    async fn set_blocked(&self, host: &str, blocked: bool) -> Result<Instance, FederationError> {
        let host = normalize(host);
        let instance = self
            .store
            .upsert(
                &host,
                InstanceUpdate {
                    is_blocked: Some(blocked),
                    ..Default::default()
                },
            )
            .await?;
        tracing::info!(host = %host, blocked, "Instance block state changed");
        Ok(instance)
    }

    /// Record a verified delivery from `host`
    pub async fn record_received(
        &self,
        host: &str,
        system: Option<&str>,
    ) -> Result<Instance, FederationError> {
        let host = normalize(host);
        let now = Utc::now();
        let instance = self
            .store
            .upsert(
                &host,
                InstanceUpdate {
                    latest_request_received_at: Some(now),
                    last_communicated_at: Some(now),
                    is_not_responding: Some(false),
                    system: system.map(str::to_string),
                    is_blocked: None,
                },
            )
            .await?;

        INSTANCE_REQUESTS_RECEIVED
            .with_label_values(&[host.as_str()])
            .inc();
        Ok(instance)
    }

    /// Record a delivery in the background
    ///
    /// Failures are logged and never reach the caller.
    pub fn spawn_record_received(&self, host: String, system: Option<&'static str>) -> JoinHandle<()> {
        let registry = self.clone();
        tokio::spawn(async move {
            if let Err(e) = registry.record_received(&host, system).await {
                tracing::warn!(host = %host, error = %e, "Failed to update instance telemetry");
            }
        })
    }
}

fn normalize(host: &str) -> String {
    normalize_host(host).unwrap_or_else(|| host.to_ascii_lowercase())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    async fn registry() -> (InstanceRegistry, Arc<Database>, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let db = Arc::new(Database::connect(&temp_dir.path().join("test.db")).await.unwrap());
        (InstanceRegistry::new(db.clone()), db, temp_dir)
    }

    #[tokio::test]
    async fn unknown_hosts_are_not_blocked() {
        let (registry, _db, _dir) = registry().await;
        assert!(!registry.is_blocked("remote.example").await.unwrap());
    }

    #[tokio::test]
    async fn block_and_unblock_take_effect_immediately() {
        let (registry, _db, _dir) = registry().await;

        registry.block("Remote.Example").await.unwrap();
        assert!(registry.is_blocked("remote.example").await.unwrap());

        registry.unblock("remote.example").await.unwrap();
        assert!(!registry.is_blocked("remote.example").await.unwrap());
    }

    #[tokio::test]
    async fn record_received_creates_and_touches_the_instance() {
        let (registry, db, _dir) = registry().await;

        let first = registry.record_received("remote.example", None).await.unwrap();
        assert!(first.latest_request_received_at.is_some());
        assert!(!first.is_not_responding);
        assert!(first.system.is_none());

        let second = registry
            .record_received("remote.example", Some("mastodon"))
            .await
            .unwrap();
        assert_eq!(second.caught_at, first.caught_at);
        assert_eq!(second.system.as_deref(), Some("mastodon"));

        let stored = db.get_instance("remote.example").await.unwrap().unwrap();
        assert!(stored.last_communicated_at.is_some());
    }

    #[tokio::test]
    async fn telemetry_does_not_unblock() {
        let (registry, _db, _dir) = registry().await;
        registry.block("remote.example").await.unwrap();
        registry.record_received("remote.example", None).await.unwrap();
        assert!(registry.is_blocked("remote.example").await.unwrap());
    }

    struct FailingStore;

    #[async_trait]
    impl InstanceStore for FailingStore {
        async fn find(&self, _host: &str) -> Result<Option<Instance>, FederationError> {
            Err(FederationError::Store("down".to_string()))
        }

        async fn upsert(&self, _host: &str, _update: InstanceUpdate) -> Result<Instance, FederationError> {
            Err(FederationError::Store("down".to_string()))
        }
    }

    #[tokio::test]
    async fn spawned_telemetry_swallows_failures() {
        let registry = InstanceRegistry::new(Arc::new(FailingStore));
        registry
            .spawn_record_received("remote.example".to_string(), None)
            .await
            .unwrap();
    }
}
