//! Subscription cache service contract.

use crate::connection::Connection;
use crate::error::Result;
use crate::index_entry::ResourceIndexEntry;
use crate::subscription::Subscription;
use async_trait::async_trait;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

/// Filter used by cache cleanup to decide which connections are dead.
///
/// Given a set of connection ids observed in the reverse index, returns the
/// subset that no longer corresponds to an open socket.
#[async_trait]
pub trait DeadConnectionFilter: Send + Sync {
    /// Returns the subset of the given connection ids that are dead.
    async fn dead_connections(&self, connection_ids: HashSet<String>) -> HashSet<String>;
}

/// Storage protocol for the dual-index subscription cache.
///
/// Implementations keep two indices: the normalized connection registry
/// (connection id to its owned subscriptions) and the denormalized reverse
/// index (resource key to interested connections). Multi-key updates are not
/// atomic as a unit; the maintenance sweep is the correctness backstop for
/// drift left behind by partial failures.
#[async_trait]
pub trait SubscriptionCacheService: Send + Sync {
    /// Register a new, empty connection and record its id in the set of open
    /// connections. Fails with `ConnectionAlreadyExists` if the id is already
    /// tracked; the registration is an atomic set-add so concurrent duplicate
    /// creates cannot both succeed.
    async fn create_connection(&self, connection_id: &str, subscriber_id: &str) -> Result<()>;

    /// Returns the connection record for the given id, or
    /// `ConnectionNotFound` if it is not tracked.
    async fn get_connection(&self, connection_id: &str) -> Result<Connection>;

    /// Returns the set of connection ids currently tracked as open. Used by
    /// reconciliation; not guaranteed consistent with gateway truth.
    async fn get_all_connection_ids(&self) -> Result<HashSet<String>>;

    /// Remove the connection record, the reverse-index references of every
    /// subscription it owns, and its id from the open-connections set.
    ///
    /// Failures cleaning up individual subscriptions are logged and skipped so
    /// one bad entry does not abort the rest of the cleanup. Fails with
    /// `ConnectionNotFound` if the connection record is missing up front; in
    /// that case the id is still dropped from the open-connections set, so a
    /// registration stranded by a half-completed create or close cannot
    /// outlive the next reconciliation sweep.
    async fn close_connection(&self, connection_id: &str) -> Result<()>;

    /// Attach the subscription to its owning connection and add a reference to
    /// it in the index entry of every resource key it covers.
    ///
    /// Fails with `ConnectionNotFound` if the owning connection is untracked,
    /// and `SubscriptionAlreadyExists` if the subscription id is already
    /// present on that connection. The connection write and the index writes
    /// are not one atomic unit; a crash in between leaves drift that the
    /// maintenance sweep repairs.
    async fn add_subscription(&self, subscription: Subscription) -> Result<()>;

    /// Remove the subscription from its owning connection and drop its
    /// references from the reverse index, deleting index entries that become
    /// empty. A no-op if the connection or subscription cannot be found, so
    /// retried unsubscribe/disconnect requests are safe.
    async fn cancel_subscription(&self, connection_id: &str, subscription_id: &str) -> Result<()>;

    /// Returns the resource index entry for every requested key. Keys with no
    /// stored entry map to an explicitly empty entry; the result always has
    /// the same size as the input.
    async fn get_denormalized_connections_for_resource_ids(
        &self,
        resource_ids: &BTreeSet<String>,
    ) -> Result<HashMap<String, ResourceIndexEntry>>;

    /// Enumerate the entire backing store for diagnostics. Maintenance-only;
    /// not latency-guaranteed.
    async fn dump_cache(&self) -> Result<BTreeMap<String, serde_json::Value>>;

    /// For every resource index entry, remove references to connections the
    /// given filter reports dead, deleting entries that become empty. This is
    /// how reverse-index drift from partial failures is repaired.
    async fn clean_cache(&self, filter: &dyn DeadConnectionFilter) -> Result<()>;
}
