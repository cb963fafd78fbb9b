//! Connection record: one open WebSocket session and the subscriptions it owns.

use crate::error::Result;
use crate::subscription::Subscription;
use chrono::Utc;
use serde::{Deserialize, Serialize};

/// A tracked WebSocket session.
///
/// The connection record is the normalized side of the cache: it owns the full
/// `Subscription` objects, while each resource index entry holds only the
/// (connection id, subscription id) references needed for fan-out.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Connection {
    /// Opaque connection id assigned by the gateway.
    pub id: String,
    /// Timestamp this connection was created at, in epoch milliseconds.
    pub created_at: i64,
    /// Identity of the principal that opened the connection.
    pub subscriber_id: String,
    /// Subscriptions owned by this connection.
    #[serde(default)]
    pub subscriptions: Vec<Subscription>,
}

impl Connection {
    /// Create a new connection record with no subscriptions.
    pub fn new(id: impl Into<String>, subscriber_id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            created_at: Utc::now().timestamp_millis(),
            subscriber_id: subscriber_id.into(),
            subscriptions: Vec::new(),
        }
    }

    /// Associate the given subscription with this connection.
    pub fn add_subscription(&mut self, subscription: Subscription) {
        self.subscriptions.push(subscription);
    }

    /// Returns the subscription with the given id, if present.
    ///
    /// Linear scan: connection subscription counts are expected to be small.
    pub fn find_subscription(&self, subscription_id: &str) -> Option<&Subscription> {
        self.subscriptions.iter().find(|s| s.id == subscription_id)
    }

    /// Removes and returns the subscription with the given id, if present.
    pub fn remove_subscription(&mut self, subscription_id: &str) -> Option<Subscription> {
        let index = self
            .subscriptions
            .iter()
            .position(|s| s.id == subscription_id)?;
        Some(self.subscriptions.remove(index))
    }

    /// Serialize this connection to its persisted JSON form.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Deserialize a connection from its persisted JSON form.
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;

    fn resources(keys: &[&str]) -> BTreeSet<String> {
        keys.iter().map(|k| k.to_string()).collect()
    }

    #[test]
    fn add_find_remove_subscription() {
        let mut connection = Connection::new("c1", "u1");
        assert!(connection.find_subscription("s1").is_none());

        connection.add_subscription(Subscription::with_id(
            "s1",
            "c1",
            resources(&["ts:device:u1:d1"]),
            None,
        ));
        assert!(connection.find_subscription("s1").is_some());

        let removed = connection.remove_subscription("s1").unwrap();
        assert_eq!(removed.id, "s1");
        assert!(connection.find_subscription("s1").is_none());

        // removing again is a no-op
        assert!(connection.remove_subscription("s1").is_none());
    }

    #[test]
    fn json_round_trip() {
        let mut connection = Connection::new("c1", "u1");
        connection.add_subscription(Subscription::with_id(
            "s1",
            "c1",
            resources(&["ts:device:u1:d1", "ts:athlete:u1:a1"]),
            Some(5),
        ));
        connection.add_subscription(Subscription::with_id(
            "s2",
            "c1",
            resources(&["ad:user:u1"]),
            None,
        ));

        let json = connection.to_json().unwrap();
        let parsed = Connection::from_json(&json).unwrap();
        assert_eq!(connection, parsed);
    }
}
