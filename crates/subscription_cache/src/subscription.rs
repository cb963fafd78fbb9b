//! A client's registered interest in a set of resource keys.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use uuid::Uuid;

/// A subscription registered by a client over a WebSocket connection.
///
/// A subscription is owned by exactly one connection and covers a non-empty
/// set of resource keys. The `sample_rate` is a passthrough throttle hint;
/// the cache never interprets it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subscription {
    /// Unique subscription id, generated at creation time.
    pub id: String,
    /// Id of the connection that owns this subscription.
    pub connection_id: String,
    /// Timestamp this subscription was created at, in epoch milliseconds.
    pub created_at: i64,
    /// Resource keys this subscription covers.
    pub resources: BTreeSet<String>,
    /// Optional throttle hint, passed through to the reverse index unchanged.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sample_rate: Option<u32>,
}

impl Subscription {
    /// Create a new subscription with a generated id.
    pub fn new(
        connection_id: impl Into<String>,
        resources: BTreeSet<String>,
        sample_rate: Option<u32>,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            connection_id: connection_id.into(),
            created_at: Utc::now().timestamp_millis(),
            resources,
            sample_rate,
        }
    }

    /// Create a subscription with an explicit id.
    pub fn with_id(
        id: impl Into<String>,
        connection_id: impl Into<String>,
        resources: BTreeSet<String>,
        sample_rate: Option<u32>,
    ) -> Self {
        Self {
            id: id.into(),
            connection_id: connection_id.into(),
            created_at: Utc::now().timestamp_millis(),
            resources,
            sample_rate,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_ids_are_unique() {
        let resources: BTreeSet<String> = ["ts:device:u1:d1".to_string()].into();
        let a = Subscription::new("c1", resources.clone(), None);
        let b = Subscription::new("c1", resources, None);
        assert_ne!(a.id, b.id);
    }

    #[test]
    fn sample_rate_is_omitted_when_absent() {
        let resources: BTreeSet<String> = ["ts:device:u1:d1".to_string()].into();
        let sub = Subscription::with_id("s1", "c1", resources, None);
        let json = serde_json::to_string(&sub).unwrap();
        assert!(!json.contains("sample_rate"));
    }
}
