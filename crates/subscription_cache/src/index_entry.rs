//! Resource index entry: the denormalized reverse mapping for one resource key.

use crate::error::Result;
use crate::subscription::Subscription;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use tracing::debug;

/// A (subscription id, sample rate) reference inside a resource index entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexedSubscription {
    /// The subscription id.
    pub id: String,
    /// The subscription's throttle hint, duplicated here for fan-out reads.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sample_rate: Option<u32>,
}

/// The subscription references one connection holds on a resource key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexedConnection {
    /// The connection id.
    pub id: String,
    /// The subset of this connection's subscription ids that reference the key.
    pub subscriptions: Vec<IndexedSubscription>,
}

/// Reverse mapping from one resource key to the connections interested in it.
///
/// The entry is persisted as a JSON array of [`IndexedConnection`] under the
/// resource key itself; the key is not part of the blob. A connection entry
/// never has an empty subscription set (it is pruned immediately), and an
/// entry with no connections is logically absent from the cache.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceIndexEntry {
    /// The resource key this entry is stored under.
    pub key: String,
    connections: Vec<IndexedConnection>,
}

impl ResourceIndexEntry {
    /// Create an empty entry for the given key.
    pub fn empty(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            connections: Vec::new(),
        }
    }

    /// Deserialize an entry stored under the given key.
    pub fn from_json(key: impl Into<String>, json: &str) -> Result<Self> {
        Ok(Self {
            key: key.into(),
            connections: serde_json::from_str(json)?,
        })
    }

    /// Serialize this entry to its persisted JSON form.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(&self.connections)?)
    }

    /// Add a reference to the given subscription under its owning connection.
    pub fn add_subscription(&mut self, subscription: &Subscription) {
        let reference = IndexedSubscription {
            id: subscription.id.clone(),
            sample_rate: subscription.sample_rate,
        };

        match self
            .connections
            .iter_mut()
            .find(|c| c.id == subscription.connection_id)
        {
            Some(connection) => {
                if !connection.subscriptions.iter().any(|s| s.id == reference.id) {
                    connection.subscriptions.push(reference);
                }
            }
            None => self.connections.push(IndexedConnection {
                id: subscription.connection_id.clone(),
                subscriptions: vec![reference],
            }),
        }
    }

    /// Remove the reference to the given subscription, pruning the connection
    /// entry if its subscription set becomes empty. A no-op if the connection
    /// or subscription is not referenced.
    pub fn remove_subscription(&mut self, connection_id: &str, subscription_id: &str) {
        let Some(connection) = self.connections.iter_mut().find(|c| c.id == connection_id) else {
            debug!(
                key = %self.key,
                connection_id,
                "could not remove subscription: connection not referenced"
            );
            return;
        };

        let before = connection.subscriptions.len();
        connection.subscriptions.retain(|s| s.id != subscription_id);
        if connection.subscriptions.len() == before {
            debug!(
                key = %self.key,
                connection_id,
                subscription_id,
                "could not remove subscription: subscription not referenced"
            );
        }

        self.connections.retain(|c| !c.subscriptions.is_empty());
    }

    /// Remove every reference held by the given connection. Used by
    /// reconciliation to drop dead connections in bulk.
    pub fn remove_connection(&mut self, connection_id: &str) {
        let before = self.connections.len();
        self.connections.retain(|c| c.id != connection_id);
        if self.connections.len() == before {
            debug!(
                key = %self.key,
                connection_id,
                "could not remove connection: not referenced"
            );
        }
    }

    /// Returns true if no connections reference this resource key.
    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    /// Returns the ids of all connections referencing this resource key.
    pub fn connection_ids(&self) -> BTreeSet<String> {
        self.connections.iter().map(|c| c.id.clone()).collect()
    }

    /// Returns the subscription ids the given connection holds on this key.
    pub fn subscription_ids(&self, connection_id: &str) -> BTreeSet<String> {
        self.connections
            .iter()
            .find(|c| c.id == connection_id)
            .map(|c| c.subscriptions.iter().map(|s| s.id.clone()).collect())
            .unwrap_or_default()
    }

    /// Returns all subscription ids on this key, grouped by connection id.
    pub fn subscription_ids_by_connection_id(&self) -> HashMap<String, BTreeSet<String>> {
        self.connections
            .iter()
            .map(|c| {
                (
                    c.id.clone(),
                    c.subscriptions.iter().map(|s| s.id.clone()).collect(),
                )
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;

    fn subscription(id: &str, connection_id: &str, sample_rate: Option<u32>) -> Subscription {
        let resources: BTreeSet<String> = ["ts:device:u1:d1".to_string()].into();
        Subscription::with_id(id, connection_id, resources, sample_rate)
    }

    #[test]
    fn add_groups_references_by_connection() {
        let mut entry = ResourceIndexEntry::empty("ts:device:u1:d1");
        entry.add_subscription(&subscription("s1", "c1", None));
        entry.add_subscription(&subscription("s2", "c1", Some(2)));
        entry.add_subscription(&subscription("s3", "c2", None));

        assert_eq!(entry.connection_ids().len(), 2);
        assert_eq!(entry.subscription_ids("c1").len(), 2);
        assert_eq!(entry.subscription_ids("c2").len(), 1);

        let by_connection = entry.subscription_ids_by_connection_id();
        assert_eq!(by_connection["c1"].len(), 2);
        assert!(by_connection["c2"].contains("s3"));
    }

    #[test]
    fn add_is_idempotent_per_subscription_id() {
        let mut entry = ResourceIndexEntry::empty("ts:device:u1:d1");
        entry.add_subscription(&subscription("s1", "c1", None));
        entry.add_subscription(&subscription("s1", "c1", None));
        assert_eq!(entry.subscription_ids("c1").len(), 1);
    }

    #[test]
    fn remove_last_subscription_prunes_connection() {
        let mut entry = ResourceIndexEntry::empty("ts:device:u1:d1");
        entry.add_subscription(&subscription("s1", "c1", None));
        entry.add_subscription(&subscription("s2", "c1", None));

        entry.remove_subscription("c1", "s1");
        assert_eq!(entry.subscription_ids("c1").len(), 1);
        assert!(!entry.is_empty());

        entry.remove_subscription("c1", "s2");
        assert!(entry.subscription_ids("c1").is_empty());
        assert!(entry.is_empty());
    }

    #[test]
    fn remove_unknown_references_is_a_no_op() {
        let mut entry = ResourceIndexEntry::empty("ts:device:u1:d1");
        entry.add_subscription(&subscription("s1", "c1", None));

        entry.remove_subscription("c9", "s1");
        entry.remove_subscription("c1", "s9");
        entry.remove_connection("c9");
        assert_eq!(entry.subscription_ids("c1").len(), 1);
    }

    #[test]
    fn remove_connection_drops_all_references() {
        let mut entry = ResourceIndexEntry::empty("ts:device:u1:d1");
        entry.add_subscription(&subscription("s1", "c1", None));
        entry.add_subscription(&subscription("s2", "c1", Some(10)));
        entry.add_subscription(&subscription("s3", "c2", None));

        entry.remove_connection("c1");
        assert_eq!(entry.connection_ids(), ["c2".to_string()].into());
    }

    #[test]
    fn json_round_trip() {
        let mut entry = ResourceIndexEntry::empty("ts:device:u1:d1");
        entry.add_subscription(&subscription("s1", "c1", Some(5)));
        entry.add_subscription(&subscription("s2", "c2", None));

        let json = entry.to_json().unwrap();
        let parsed = ResourceIndexEntry::from_json("ts:device:u1:d1", &json).unwrap();
        assert_eq!(entry, parsed);
    }
}
