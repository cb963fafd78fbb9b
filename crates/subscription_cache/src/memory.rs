//! In-memory subscription cache.
//!
//! DashMap-backed implementation of the same dual-index protocol as the Redis
//! cache, used in tests and local runs where no Redis instance is available.

use crate::connection::Connection;
use crate::error::{Result, SubscriptionError};
use crate::index_entry::ResourceIndexEntry;
use crate::service::{DeadConnectionFilter, SubscriptionCacheService};
use crate::subscription::Subscription;
use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use tracing::{debug, warn};

/// Lock-free in-memory subscription cache.
#[derive(Default)]
pub struct InMemorySubscriptionCacheService {
    /// Normalized registry: connection id -> connection record.
    pub(crate) connections: DashMap<String, Connection>,
    /// Denormalized reverse index: resource key -> index entry.
    pub(crate) entries: DashMap<String, ResourceIndexEntry>,
}

impl InMemorySubscriptionCacheService {
    /// Create a new empty cache.
    pub fn new() -> Self {
        Self::default()
    }

    /// Remove the subscription's references from every resource key it
    /// covers, deleting entries that become empty.
    fn remove_subscription_references(&self, subscription: &Subscription) {
        for resource_id in &subscription.resources {
            if let Some(mut entry) = self.entries.get_mut(resource_id) {
                entry.remove_subscription(&subscription.connection_id, &subscription.id);
            }
            // re-checks emptiness under the shard lock; a subscribe landing
            // in between keeps its entry
            self.entries
                .remove_if(resource_id, |_, entry| entry.is_empty());
        }
    }
}

#[async_trait]
impl SubscriptionCacheService for InMemorySubscriptionCacheService {
    async fn create_connection(&self, connection_id: &str, subscriber_id: &str) -> Result<()> {
        match self.connections.entry(connection_id.to_string()) {
            Entry::Occupied(_) => Err(SubscriptionError::ConnectionAlreadyExists(
                connection_id.to_string(),
            )),
            Entry::Vacant(vacant) => {
                vacant.insert(Connection::new(connection_id, subscriber_id));
                Ok(())
            }
        }
    }

    async fn get_connection(&self, connection_id: &str) -> Result<Connection> {
        self.connections
            .get(connection_id)
            .map(|c| c.clone())
            .ok_or_else(|| SubscriptionError::ConnectionNotFound(connection_id.to_string()))
    }

    async fn get_all_connection_ids(&self) -> Result<HashSet<String>> {
        Ok(self.connections.iter().map(|c| c.key().clone()).collect())
    }

    async fn close_connection(&self, connection_id: &str) -> Result<()> {
        let Some((_, connection)) = self.connections.remove(connection_id) else {
            return Err(SubscriptionError::ConnectionNotFound(
                connection_id.to_string(),
            ));
        };

        for subscription in &connection.subscriptions {
            self.remove_subscription_references(subscription);
        }
        Ok(())
    }

    async fn add_subscription(&self, subscription: Subscription) -> Result<()> {
        {
            let mut connection = self
                .connections
                .get_mut(&subscription.connection_id)
                .ok_or_else(|| {
                    SubscriptionError::ConnectionNotFound(subscription.connection_id.clone())
                })?;

            if connection.find_subscription(&subscription.id).is_some() {
                return Err(SubscriptionError::SubscriptionAlreadyExists(
                    subscription.connection_id.clone(),
                    subscription.id.clone(),
                ));
            }
            connection.add_subscription(subscription.clone());
        }

        for resource_id in &subscription.resources {
            self.entries
                .entry(resource_id.clone())
                .or_insert_with(|| ResourceIndexEntry::empty(resource_id.clone()))
                .add_subscription(&subscription);
        }
        Ok(())
    }

    async fn cancel_subscription(&self, connection_id: &str, subscription_id: &str) -> Result<()> {
        let removed = match self.connections.get_mut(connection_id) {
            Some(mut connection) => connection.remove_subscription(subscription_id),
            None => {
                debug!(
                    "connection '{}' not found, cancel is a no-op",
                    connection_id
                );
                return Ok(());
            }
        };

        match removed {
            Some(subscription) => self.remove_subscription_references(&subscription),
            None => debug!(
                "subscription '{}' not found on connection '{}', cancel is a no-op",
                subscription_id, connection_id
            ),
        }
        Ok(())
    }

    async fn get_denormalized_connections_for_resource_ids(
        &self,
        resource_ids: &BTreeSet<String>,
    ) -> Result<HashMap<String, ResourceIndexEntry>> {
        Ok(resource_ids
            .iter()
            .map(|key| {
                let entry = self
                    .entries
                    .get(key)
                    .map(|e| e.clone())
                    .unwrap_or_else(|| ResourceIndexEntry::empty(key.clone()));
                (key.clone(), entry)
            })
            .collect())
    }

    async fn dump_cache(&self) -> Result<BTreeMap<String, serde_json::Value>> {
        let mut dump = BTreeMap::new();
        for connection in self.connections.iter() {
            dump.insert(
                format!("connection:{}", connection.key()),
                serde_json::to_value(connection.value())?,
            );
        }
        for entry in self.entries.iter() {
            dump.insert(
                entry.key().clone(),
                serde_json::from_str(&entry.to_json()?)?,
            );
        }
        Ok(dump)
    }

    async fn clean_cache(&self, filter: &dyn DeadConnectionFilter) -> Result<()> {
        let referenced: HashSet<String> = self
            .entries
            .iter()
            .flat_map(|e| e.connection_ids())
            .collect();

        let dead = filter.dead_connections(referenced).await;
        if dead.is_empty() {
            return Ok(());
        }
        warn!("pruning {} dead connections from the resource index", dead.len());

        let keys: Vec<String> = self.entries.iter().map(|e| e.key().clone()).collect();
        for key in keys {
            if let Some(mut entry) = self.entries.get_mut(&key) {
                for id in &dead {
                    entry.remove_connection(id);
                }
            }
            self.entries.remove_if(&key, |_, entry| entry.is_empty());
        }
        Ok(())
    }
}
