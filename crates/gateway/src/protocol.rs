//! WebSocket protocol message types.
//!
//! Defines the JSON message format for client-server communication. This is
//! deliberately thin: subscribe/unsubscribe frames plus acknowledgements and
//! error frames; data delivery is not part of this service.

use crate::resource::{
    namespaced_resource, ResourceNamespace, ALLOWED_SAMPLE_RATES, DATA_CLASSES,
    DATA_CLASS_TIME_SERIES,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

// ============================================================================
// Client → Server Messages
// ============================================================================

/// Message sent from client to server.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Register a new subscription on this connection.
    Subscribe(SubscriptionRequest),
    /// Cancel a subscription on this connection.
    Unsubscribe(UnsubscribeRequest),
    /// Ping message for keepalive.
    Ping,
}

/// A request to subscribe to live data for a set of resources.
#[derive(Debug, Clone, Deserialize)]
pub struct SubscriptionRequest {
    /// Client-chosen id echoed back in the response.
    pub request_id: Option<String>,
    /// Data class of the requested streams (`ts` or `ad`).
    pub data_class: Option<String>,
    /// Owner of the requested resources.
    pub user_id: Option<String>,
    /// Optional throttle hint; only valid for time-series data.
    pub sample_rate: Option<u32>,
    /// Specific resources to subscribe to. When absent, the subscription
    /// covers the user's own stream.
    pub resources: Option<SubscriptionRequestResources>,
}

/// The specific resources named in a [`SubscriptionRequest`].
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SubscriptionRequestResources {
    /// Device ids to subscribe to, keyed under the request's user id.
    #[serde(default)]
    pub device_ids: Vec<String>,
    /// Athlete ids to subscribe to, keyed under the request's user id.
    #[serde(default)]
    pub athlete_ids: Vec<String>,
}

impl SubscriptionRequest {
    /// Validate this request, returning every violation found.
    pub fn validation_violations(&self) -> Vec<String> {
        let mut violations = Vec::new();

        if self.request_id.is_none() {
            violations.push("Missing request id".to_string());
        }
        match self.data_class.as_deref() {
            None => violations.push("Missing data class".to_string()),
            Some(dc) if !DATA_CLASSES.contains(&dc) => {
                violations.push("Invalid data class".to_string())
            }
            Some(_) => {}
        }
        if self.user_id.is_none() {
            violations.push("Missing user id".to_string());
        }
        if self.sample_rate.is_some() && self.data_class.as_deref() != Some(DATA_CLASS_TIME_SERIES)
        {
            violations.push("Sample rate may only be defined for timeseries data".to_string());
        }
        if let Some(rate) = self.sample_rate {
            if !ALLOWED_SAMPLE_RATES.contains(&rate) {
                violations.push(
                    "If sample rate is defined, it may only have the value 1, 2, 5, or 10"
                        .to_string(),
                );
            }
        }
        if self.namespaced_resources().is_empty() {
            violations.push("Could not generate resource keys".to_string());
        }

        violations
    }

    /// Returns the set of namespaced resource keys for this request.
    ///
    /// A request with no explicit resources subscribes to the user's own
    /// stream; otherwise each named device/athlete id becomes one key.
    pub fn namespaced_resources(&self) -> BTreeSet<String> {
        let data_class = self.data_class.as_deref().unwrap_or_default();
        let user_id = self.user_id.as_deref().unwrap_or_default();

        let Some(resources) = &self.resources else {
            return [namespaced_resource(
                data_class,
                ResourceNamespace::User,
                user_id,
                None,
            )]
            .into();
        };

        let mut keys = BTreeSet::new();
        for device_id in &resources.device_ids {
            keys.insert(namespaced_resource(
                data_class,
                ResourceNamespace::Device,
                user_id,
                Some(device_id),
            ));
        }
        for athlete_id in &resources.athlete_ids {
            keys.insert(namespaced_resource(
                data_class,
                ResourceNamespace::Athlete,
                user_id,
                Some(athlete_id),
            ));
        }
        keys
    }
}

/// A request to cancel a subscription.
#[derive(Debug, Clone, Deserialize)]
pub struct UnsubscribeRequest {
    /// Client-chosen id echoed back in the response.
    pub request_id: Option<String>,
    /// Id of the subscription to cancel.
    pub subscription_id: String,
}

// ============================================================================
// Server → Client Messages
// ============================================================================

/// Message sent from server to client.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Sent once after the socket is accepted and the connection registered.
    Connected {
        /// The id assigned to this connection.
        connection_id: String,
    },
    /// Confirmation of a subscribe request.
    Subscribed {
        /// Request id echoed from the subscribe request.
        request_id: Option<String>,
        /// Id of the newly created subscription.
        subscription_id: String,
    },
    /// Confirmation of an unsubscribe request.
    Unsubscribed {
        /// Request id echoed from the unsubscribe request.
        request_id: Option<String>,
        /// Id of the cancelled subscription.
        subscription_id: String,
    },
    /// Pong response to ping.
    Pong,
    /// Error frame.
    Error {
        /// Request id of the failed request, when known.
        request_id: Option<String>,
        /// Stable error code.
        code: String,
        /// Human-readable message.
        message: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    fn subscribe_json(body: &str) -> ClientMessage {
        serde_json::from_str(body).unwrap()
    }

    #[test]
    fn parse_subscribe_with_devices() {
        let msg = subscribe_json(
            r#"{"action":"subscribe","request_id":"r1","data_class":"ts",
                "user_id":"u1","sample_rate":5,
                "resources":{"device_ids":["d1","d2"]}}"#,
        );
        let ClientMessage::Subscribe(request) = msg else {
            panic!("expected subscribe");
        };
        assert!(request.validation_violations().is_empty());
        assert_eq!(
            request.namespaced_resources(),
            ["ts:device:u1:d1".to_string(), "ts:device:u1:d2".to_string()].into()
        );
    }

    #[test]
    fn subscribe_without_resources_targets_the_user_stream() {
        let msg = subscribe_json(
            r#"{"action":"subscribe","request_id":"r1","data_class":"ad","user_id":"u1"}"#,
        );
        let ClientMessage::Subscribe(request) = msg else {
            panic!("expected subscribe");
        };
        assert!(request.validation_violations().is_empty());
        assert_eq!(
            request.namespaced_resources(),
            ["ad:user:u1".to_string()].into()
        );
    }

    #[test]
    fn validation_rejects_bad_requests() {
        let msg = subscribe_json(
            r#"{"action":"subscribe","data_class":"xx","user_id":"u1","sample_rate":3,
                "resources":{}}"#,
        );
        let ClientMessage::Subscribe(request) = msg else {
            panic!("expected subscribe");
        };
        let violations = request.validation_violations();
        assert!(violations.iter().any(|v| v.contains("request id")));
        assert!(violations.iter().any(|v| v.contains("Invalid data class")));
        assert!(violations.iter().any(|v| v.contains("1, 2, 5, or 10")));
        assert!(violations.iter().any(|v| v.contains("resource keys")));
    }

    #[test]
    fn sample_rate_requires_time_series() {
        let msg = subscribe_json(
            r#"{"action":"subscribe","request_id":"r1","data_class":"ad",
                "user_id":"u1","sample_rate":5}"#,
        );
        let ClientMessage::Subscribe(request) = msg else {
            panic!("expected subscribe");
        };
        assert!(request
            .validation_violations()
            .iter()
            .any(|v| v.contains("timeseries")));
    }

    #[test]
    fn server_messages_are_tagged() {
        let json = serde_json::to_string(&ServerMessage::Subscribed {
            request_id: Some("r1".to_string()),
            subscription_id: "s1".to_string(),
        })
        .unwrap();
        assert!(json.contains(r#""type":"subscribed""#));
    }
}
