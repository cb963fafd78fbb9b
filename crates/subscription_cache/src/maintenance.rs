//! Connection maintenance: the periodic reconciliation sweep.
//!
//! Disconnect handling is best-effort; a socket can vanish without its
//! disconnect path ever running, and a crash between the connection write and
//! the index writes of `add_subscription` can orphan index references. This
//! task is the backstop: a one-shot idempotent sweep that is safe to run
//! concurrently with live traffic and safe to re-run on any schedule.

use crate::error::Result;
use crate::service::{DeadConnectionFilter, SubscriptionCacheService};
use async_trait::async_trait;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Liveness oracle supplied by the gateway: whether a socket is still open
/// for the given connection id.
#[async_trait]
pub trait ConnectionLivenessOracle: Send + Sync {
    /// Returns true if the gateway still tracks an open socket for the id.
    async fn is_connected(&self, connection_id: &str) -> bool;
}

/// [`DeadConnectionFilter`] over a liveness oracle.
struct OracleBackedFilter<'a> {
    oracle: &'a dyn ConnectionLivenessOracle,
}

#[async_trait]
impl DeadConnectionFilter for OracleBackedFilter<'_> {
    async fn dead_connections(&self, connection_ids: HashSet<String>) -> HashSet<String> {
        let mut dead = HashSet::new();
        for connection_id in connection_ids {
            if !self.oracle.is_connected(&connection_id).await {
                dead.insert(connection_id);
            }
        }
        dead
    }
}

/// Result of one maintenance sweep.
#[derive(Debug, Default, Serialize)]
pub struct ConnectionMaintenanceReport {
    /// Connection ids whose sockets were still open.
    pub preserved_connections: BTreeSet<String>,
    /// Connection ids that were gone and got cleaned up.
    pub cleaned_up_connections: BTreeSet<String>,
    /// Full cache snapshot before cleanup, when dumping was requested.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pre_cleanup_dump: Option<BTreeMap<String, serde_json::Value>>,
    /// Full cache snapshot after cleanup, when dumping was requested.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub post_cleanup_dump: Option<BTreeMap<String, serde_json::Value>>,
}

/// One-shot reconciliation sweep over the subscription cache.
///
/// Failure to clean up one connection logs and continues; the sweep never
/// aborts mid-run. The only fatal error is losing the backing store itself.
pub struct ConnectionMaintenanceTask {
    cache: Arc<dyn SubscriptionCacheService>,
    oracle: Arc<dyn ConnectionLivenessOracle>,
    dump_cache: bool,
}

impl ConnectionMaintenanceTask {
    /// Create a new maintenance task. When `dump_cache` is set, the report
    /// carries full cache snapshots from before and after cleanup.
    pub fn new(
        cache: Arc<dyn SubscriptionCacheService>,
        oracle: Arc<dyn ConnectionLivenessOracle>,
        dump_cache: bool,
    ) -> Self {
        Self {
            cache,
            oracle,
            dump_cache,
        }
    }

    /// Run one sweep and return what was preserved and what was cleaned up.
    pub async fn run(&self) -> Result<ConnectionMaintenanceReport> {
        let mut report = ConnectionMaintenanceReport::default();

        if self.dump_cache {
            report.pre_cleanup_dump = self.snapshot().await;
        }

        let connection_ids = self.cache.get_all_connection_ids().await?;
        debug!("cache recorded open connections: {:?}", connection_ids);

        for connection_id in connection_ids {
            if self.oracle.is_connected(&connection_id).await {
                debug!("connection '{}' is still open", connection_id);
                report.preserved_connections.insert(connection_id);
            } else {
                debug!("connection '{}' is gone, closing it", connection_id);
                match self.cache.close_connection(&connection_id).await {
                    Ok(()) => {}
                    Err(e) if e.is_not_found() => {
                        // a stale open-set id with no record; closing it has
                        // already purged the registration
                        debug!("connection '{}' had no record", connection_id);
                    }
                    Err(e) => {
                        error!("error cleaning up connection '{}': {}", connection_id, e);
                    }
                }
                report.cleaned_up_connections.insert(connection_id);
            }
        }

        // catch index references to connections the open set never knew about
        let filter = OracleBackedFilter {
            oracle: self.oracle.as_ref(),
        };
        if let Err(e) = self.cache.clean_cache(&filter).await {
            warn!("error cleaning the resource index: {}", e);
        }

        if self.dump_cache {
            report.post_cleanup_dump = self.snapshot().await;
        }

        info!(
            "{} connections preserved, {} cleaned up",
            report.preserved_connections.len(),
            report.cleaned_up_connections.len()
        );
        Ok(report)
    }

    async fn snapshot(&self) -> Option<BTreeMap<String, serde_json::Value>> {
        match self.cache.dump_cache().await {
            Ok(dump) => Some(dump),
            Err(e) => {
                warn!("failed to dump cache for the maintenance report: {}", e);
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::Connection;
    use crate::error::SubscriptionError;
    use crate::index_entry::ResourceIndexEntry;
    use crate::memory::InMemorySubscriptionCacheService;
    use crate::subscription::Subscription;
    use std::collections::{BTreeSet, HashMap};
    use std::sync::Mutex;

    /// Oracle that reports a fixed set of ids as open.
    struct FixedOracle {
        alive: HashSet<String>,
    }

    impl FixedOracle {
        fn alive(ids: &[&str]) -> Arc<Self> {
            Arc::new(Self {
                alive: ids.iter().map(|s| s.to_string()).collect(),
            })
        }
    }

    #[async_trait]
    impl ConnectionLivenessOracle for FixedOracle {
        async fn is_connected(&self, connection_id: &str) -> bool {
            self.alive.contains(connection_id)
        }
    }

    fn resources(keys: &[&str]) -> BTreeSet<String> {
        keys.iter().map(|k| k.to_string()).collect()
    }

    async fn seeded_cache() -> Arc<InMemorySubscriptionCacheService> {
        let cache = Arc::new(InMemorySubscriptionCacheService::new());
        cache.create_connection("c1", "u1").await.unwrap();
        cache.create_connection("c2", "u2").await.unwrap();
        cache
            .add_subscription(Subscription::with_id(
                "s1",
                "c1",
                resources(&["ts:device:u1:d1", "ts:athlete:u1:a1"]),
                None,
            ))
            .await
            .unwrap();
        cache
            .add_subscription(Subscription::with_id(
                "s2",
                "c2",
                resources(&["ts:device:u1:d1"]),
                Some(2),
            ))
            .await
            .unwrap();
        cache
    }

    #[tokio::test]
    async fn sweep_reaps_dead_connections_and_preserves_live_ones() {
        let cache = seeded_cache().await;
        let task = ConnectionMaintenanceTask::new(
            cache.clone(),
            FixedOracle::alive(&["c2"]),
            false,
        );

        let report = task.run().await.unwrap();
        assert_eq!(report.cleaned_up_connections, ["c1".to_string()].into());
        assert_eq!(report.preserved_connections, ["c2".to_string()].into());

        assert!(cache.get_connection("c1").await.unwrap_err().is_not_found());
        cache.get_connection("c2").await.unwrap();

        let keys = resources(&["ts:device:u1:d1", "ts:athlete:u1:a1"]);
        let entries = cache
            .get_denormalized_connections_for_resource_ids(&keys)
            .await
            .unwrap();
        assert_eq!(
            entries["ts:device:u1:d1"].connection_ids(),
            ["c2".to_string()].into()
        );
        assert!(entries["ts:athlete:u1:a1"].is_empty());
    }

    #[tokio::test]
    async fn sweep_is_idempotent() {
        let cache = seeded_cache().await;
        let oracle = FixedOracle::alive(&["c2"]);
        let task = ConnectionMaintenanceTask::new(cache.clone(), oracle, false);

        task.run().await.unwrap();
        let report = task.run().await.unwrap();

        assert!(report.cleaned_up_connections.is_empty());
        assert_eq!(report.preserved_connections, ["c2".to_string()].into());
    }

    #[tokio::test]
    async fn sweep_prunes_orphaned_index_references() {
        let cache = seeded_cache().await;

        // orphan c1's index references by dropping only its record, as if a
        // crash had interrupted a close half-way
        cache.connections.remove("c1");

        let task = ConnectionMaintenanceTask::new(
            cache.clone(),
            FixedOracle::alive(&["c2"]),
            false,
        );
        task.run().await.unwrap();

        let keys = resources(&["ts:device:u1:d1", "ts:athlete:u1:a1"]);
        let entries = cache
            .get_denormalized_connections_for_resource_ids(&keys)
            .await
            .unwrap();
        assert_eq!(
            entries["ts:device:u1:d1"].connection_ids(),
            ["c2".to_string()].into()
        );
        assert!(entries["ts:athlete:u1:a1"].is_empty());
    }

    /// Cache double modeling an open-connections set that holds ids with no
    /// backing record, as a crash between the registration writes leaves
    /// behind. Closing such an id drops it from the set and reports not-found.
    struct StaleOpenSetCache {
        open: Mutex<HashSet<String>>,
    }

    impl StaleOpenSetCache {
        fn with_ids(ids: &[&str]) -> Arc<Self> {
            Arc::new(Self {
                open: Mutex::new(ids.iter().map(|s| s.to_string()).collect()),
            })
        }
    }

    #[async_trait]
    impl SubscriptionCacheService for StaleOpenSetCache {
        async fn create_connection(&self, _: &str, _: &str) -> Result<()> {
            Ok(())
        }

        async fn get_connection(&self, connection_id: &str) -> Result<Connection> {
            Err(SubscriptionError::ConnectionNotFound(
                connection_id.to_string(),
            ))
        }

        async fn get_all_connection_ids(&self) -> Result<HashSet<String>> {
            Ok(self.open.lock().unwrap().clone())
        }

        async fn close_connection(&self, connection_id: &str) -> Result<()> {
            self.open.lock().unwrap().remove(connection_id);
            Err(SubscriptionError::ConnectionNotFound(
                connection_id.to_string(),
            ))
        }

        async fn add_subscription(&self, subscription: Subscription) -> Result<()> {
            Err(SubscriptionError::ConnectionNotFound(
                subscription.connection_id,
            ))
        }

        async fn cancel_subscription(&self, _: &str, _: &str) -> Result<()> {
            Ok(())
        }

        async fn get_denormalized_connections_for_resource_ids(
            &self,
            resource_ids: &BTreeSet<String>,
        ) -> Result<HashMap<String, ResourceIndexEntry>> {
            Ok(resource_ids
                .iter()
                .map(|key| (key.clone(), ResourceIndexEntry::empty(key.clone())))
                .collect())
        }

        async fn dump_cache(&self) -> Result<BTreeMap<String, serde_json::Value>> {
            Ok(BTreeMap::new())
        }

        async fn clean_cache(&self, _: &dyn DeadConnectionFilter) -> Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn sweep_purges_record_less_open_set_ids() {
        let cache = StaleOpenSetCache::with_ids(&["c1", "c2"]);
        let task =
            ConnectionMaintenanceTask::new(cache.clone(), FixedOracle::alive(&[]), false);

        let report = task.run().await.unwrap();
        assert_eq!(
            report.cleaned_up_connections,
            ["c1".to_string(), "c2".to_string()].into()
        );
        assert!(cache.open.lock().unwrap().is_empty());

        // the next sweep sees a clean set instead of erroring on the same ids
        let report = task.run().await.unwrap();
        assert!(report.cleaned_up_connections.is_empty());
        assert!(report.preserved_connections.is_empty());
    }

    #[tokio::test]
    async fn report_carries_dumps_when_requested() {
        let cache = seeded_cache().await;
        let task = ConnectionMaintenanceTask::new(
            cache.clone(),
            FixedOracle::alive(&["c1", "c2"]),
            true,
        );

        let report = task.run().await.unwrap();
        let pre = report.pre_cleanup_dump.as_ref().unwrap();
        let post = report.post_cleanup_dump.as_ref().unwrap();
        assert!(pre.contains_key("connection:c1"));
        assert_eq!(pre, post);

        // the report itself serializes for logging/diagnostics endpoints
        serde_json::to_string(&report).unwrap();
    }
}
