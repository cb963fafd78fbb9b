//! Client state and registry management.
//!
//! Uses lock-free DashMap for high-throughput concurrent access. The registry
//! only tracks which sockets are currently open on this process; subscription
//! state lives in the shared cache so that every gateway instance sees it.

use crate::error::{GatewayError, Result};
use crate::protocol::ServerMessage;
use async_trait::async_trait;
use axum::extract::ws::Message;
use chrono::Utc;
use dashmap::DashMap;
use std::sync::Arc;
use subscription_cache::ConnectionLivenessOracle;
use tokio::sync::mpsc;
use tracing::info;

/// State for a single connected client.
pub struct ClientState {
    /// Connection id, shared with the subscription cache.
    pub id: String,
    /// Subscriber (user) id extracted from the client's credentials.
    pub subscriber_id: String,
    /// Channel to send messages to the client's WebSocket.
    pub tx: mpsc::UnboundedSender<Message>,
    /// Timestamp when client connected.
    pub connected_at: i64,
}

impl ClientState {
    /// Create a new client state.
    pub fn new(id: String, subscriber_id: String, tx: mpsc::UnboundedSender<Message>) -> Self {
        Self {
            id,
            subscriber_id,
            tx,
            connected_at: Utc::now().timestamp_millis(),
        }
    }

    /// Send a message to this client.
    pub fn send(&self, msg: ServerMessage) -> Result<()> {
        let json = serde_json::to_string(&msg)?;
        self.tx
            .send(Message::Text(json.into()))
            .map_err(|_| GatewayError::ChannelSend)
    }
}

/// Lock-free registry of clients connected to this process.
pub struct ClientRegistry {
    /// Connection ID → Client State.
    clients: DashMap<String, Arc<ClientState>>,
}

impl ClientRegistry {
    /// Create a new empty registry.
    pub fn new() -> Self {
        Self {
            clients: DashMap::new(),
        }
    }

    /// Register a new client.
    pub fn register(&self, client: Arc<ClientState>) {
        let id = client.id.clone();
        self.clients.insert(id.clone(), client);
        info!("Client {} registered", id);
    }

    /// Unregister a client.
    pub fn unregister(&self, client_id: &str) {
        if self.clients.remove(client_id).is_some() {
            info!("Client {} unregistered", client_id);
        }
    }

    /// Check whether a connection id has an open socket on this process.
    pub fn contains(&self, client_id: &str) -> bool {
        self.clients.contains_key(client_id)
    }

    /// Get the total number of connected clients.
    pub fn client_count(&self) -> usize {
        self.clients.len()
    }
}

impl Default for ClientRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ConnectionLivenessOracle for ClientRegistry {
    async fn is_connected(&self, connection_id: &str) -> bool {
        self.contains(connection_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_client(id: &str) -> Arc<ClientState> {
        let (tx, _rx) = mpsc::unbounded_channel();
        Arc::new(ClientState::new(id.to_string(), "u1".to_string(), tx))
    }

    #[test]
    fn register_and_unregister() {
        let registry = ClientRegistry::new();
        registry.register(test_client("c1"));
        assert!(registry.contains("c1"));
        assert_eq!(registry.client_count(), 1);

        registry.unregister("c1");
        assert!(!registry.contains("c1"));
        assert_eq!(registry.client_count(), 0);
    }

    #[tokio::test]
    async fn registry_answers_liveness_queries() {
        let registry = ClientRegistry::new();
        registry.register(test_client("c1"));
        assert!(registry.is_connected("c1").await);
        assert!(!registry.is_connected("c2").await);
    }
}
