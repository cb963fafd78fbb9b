//! WebSocket server handler using Axum.

use crate::auth::{AuthContext, SubscriptionAuthorizationService};
use crate::client::{ClientRegistry, ClientState};
use crate::error::{GatewayError, Result};
use crate::protocol::{ClientMessage, ServerMessage, SubscriptionRequest, UnsubscribeRequest};
use axum::{
    extract::{
        ws::{Message, WebSocket},
        Query, State, WebSocketUpgrade,
    },
    http::{header, HeaderMap, StatusCode},
    response::IntoResponse,
    routing::get,
    Router,
};
use futures::{SinkExt, StreamExt};
use metrics::{counter, gauge};
use serde::Deserialize;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use subscription_cache::{Subscription, SubscriptionCacheService};
use tokio::sync::mpsc;
use tokio::time::interval;
use tower_http::cors::CorsLayer;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Shared application state.
pub struct AppState {
    pub registry: Arc<ClientRegistry>,
    pub cache: Arc<dyn SubscriptionCacheService>,
    pub auth: Arc<dyn SubscriptionAuthorizationService>,
}

/// Create the WebSocket router.
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .route("/health", get(health_handler))
        .with_state(state)
        .layer(CorsLayer::permissive())
}

/// Health check handler.
async fn health_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let clients = state.registry.client_count();
    format!(r#"{{"status":"ok","clients":{}}}"#, clients)
}

#[derive(Deserialize)]
struct WsQuery {
    token: Option<String>,
}

/// WebSocket upgrade handler.
///
/// The bearer token comes from the `Authorization` header or, for browser
/// clients that cannot set headers on WebSocket upgrades, a `token` query
/// parameter.
async fn ws_handler(
    ws: WebSocketUpgrade,
    headers: HeaderMap,
    Query(query): Query<WsQuery>,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    let token = bearer_token(&headers).or(query.token);
    let Some(token) = token else {
        return (StatusCode::UNAUTHORIZED, "missing bearer token").into_response();
    };

    let auth = AuthContext::from_bearer_token(&token);
    let Some(subscriber_id) = auth.subject.clone() else {
        return (StatusCode::UNAUTHORIZED, "token has no subject").into_response();
    };

    ws.on_upgrade(move |socket| handle_socket(socket, state, auth, subscriber_id))
}

fn bearer_token(headers: &HeaderMap) -> Option<String> {
    headers
        .get(header::AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
        .map(|t| t.to_string())
}

/// Handle a WebSocket connection.
async fn handle_socket(
    socket: WebSocket,
    state: Arc<AppState>,
    auth: AuthContext,
    subscriber_id: String,
) {
    // Split the socket into sender and receiver
    let (mut ws_tx, mut ws_rx) = socket.split();

    // Create unbounded channel for outgoing messages
    let (tx, mut rx) = mpsc::unbounded_channel::<Message>();

    let connection_id = Uuid::new_v4().to_string();
    if let Err(e) = state
        .cache
        .create_connection(&connection_id, &subscriber_id)
        .await
    {
        warn!("Could not register connection {}: {:?}", connection_id, e);
        let frame = connect_failure_frame(e);
        if let Ok(json) = serde_json::to_string(&frame) {
            let _ = ws_tx.send(Message::Text(json.into())).await;
        }
        return;
    }

    let client = Arc::new(ClientState::new(
        connection_id.clone(),
        subscriber_id,
        tx,
    ));
    state.registry.register(client.clone());

    counter!("gateway_connections_total").increment(1);
    gauge!("gateway_active_connections").set(state.registry.client_count() as f64);

    info!("Client {} connected", connection_id);

    let _ = client.send(ServerMessage::Connected {
        connection_id: connection_id.clone(),
    });

    // Spawn task to forward messages from channel to WebSocket
    let send_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            if ws_tx.send(msg).await.is_err() {
                break;
            }
        }
    });

    // Ping interval for keepalive
    let mut ping_interval = interval(Duration::from_secs(30));
    ping_interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    // Handle incoming messages
    loop {
        tokio::select! {
            biased;

            // Handle incoming WebSocket messages
            msg = ws_rx.next() => {
                match msg {
                    Some(Ok(msg)) => {
                        if let Err(e) = handle_message(&state, &client, &auth, msg).await {
                            warn!("Error handling message from {}: {:?}", connection_id, e);
                            let _ = client.send(ServerMessage::Error {
                                request_id: None,
                                code: e.code().to_string(),
                                message: e.to_string(),
                            });
                        }
                    }
                    Some(Err(e)) => {
                        warn!("WebSocket error for {}: {:?}", connection_id, e);
                        break;
                    }
                    None => {
                        // Connection closed
                        break;
                    }
                }
            }

            // Send ping periodically
            _ = ping_interval.tick() => {
                if client.tx.send(Message::Ping(vec![].into())).is_err() {
                    break;
                }
            }
        }
    }

    // Cleanup
    state.registry.unregister(&connection_id);
    send_task.abort();

    match state.cache.close_connection(&connection_id).await {
        Ok(_) => {}
        Err(e) if e.is_not_found() => {
            // Already reaped by the maintenance sweep.
            debug!("Connection {} was already closed", connection_id);
        }
        Err(e) => warn!("Could not close connection {}: {:?}", connection_id, e),
    }

    counter!("gateway_disconnections_total").increment(1);
    gauge!("gateway_active_connections").set(state.registry.client_count() as f64);

    info!("Client {} disconnected", connection_id);
}

/// Error frame sent before closing a socket whose connection could not be
/// registered in the cache.
fn connect_failure_frame(e: subscription_cache::SubscriptionError) -> ServerMessage {
    let e = GatewayError::from(e);
    ServerMessage::Error {
        request_id: None,
        code: e.code().to_string(),
        message: e.to_string(),
    }
}

/// Handle a single WebSocket message.
async fn handle_message(
    state: &Arc<AppState>,
    client: &Arc<ClientState>,
    auth: &AuthContext,
    msg: Message,
) -> Result<()> {
    match msg {
        Message::Text(text) => {
            let client_msg: ClientMessage = serde_json::from_str(&text)?;
            handle_client_message(state, client, auth, client_msg).await
        }
        Message::Binary(data) => {
            // Try to parse as JSON
            let client_msg: ClientMessage = serde_json::from_slice(&data)?;
            handle_client_message(state, client, auth, client_msg).await
        }
        Message::Ping(data) => {
            client
                .tx
                .send(Message::Pong(data))
                .map_err(|_| GatewayError::ChannelSend)?;
            Ok(())
        }
        Message::Pong(_) => Ok(()),
        Message::Close(_) => {
            // Will be handled by the connection loop
            Ok(())
        }
    }
}

/// Handle a parsed client message.
async fn handle_client_message(
    state: &Arc<AppState>,
    client: &Arc<ClientState>,
    auth: &AuthContext,
    msg: ClientMessage,
) -> Result<()> {
    match msg {
        ClientMessage::Subscribe(request) => {
            if let Err(e) = handle_subscribe(state, client, auth, &request).await {
                client.send(ServerMessage::Error {
                    request_id: request.request_id.clone(),
                    code: e.code().to_string(),
                    message: e.to_string(),
                })?;
            }
            Ok(())
        }
        ClientMessage::Unsubscribe(request) => {
            if let Err(e) = handle_unsubscribe(state, client, &request).await {
                client.send(ServerMessage::Error {
                    request_id: request.request_id.clone(),
                    code: e.code().to_string(),
                    message: e.to_string(),
                })?;
            }
            Ok(())
        }
        ClientMessage::Ping => {
            client.send(ServerMessage::Pong)?;
            Ok(())
        }
    }
}

/// Validate, authorize, and register a subscription.
async fn handle_subscribe(
    state: &Arc<AppState>,
    client: &Arc<ClientState>,
    auth: &AuthContext,
    request: &SubscriptionRequest,
) -> Result<()> {
    let violations = request.validation_violations();
    if !violations.is_empty() {
        return Err(GatewayError::InvalidRequest(violations));
    }

    // Validation guarantees the user id is present.
    let user_id = request.user_id.as_deref().unwrap_or_default();
    state
        .auth
        .check_authorization_for_user_resource(user_id, auth)
        .await?;

    let resources: BTreeSet<String> = request.namespaced_resources();
    debug!("Client {} subscribing to {:?}", client.id, resources);

    let subscription = Subscription::new(&client.id, resources.clone(), request.sample_rate);
    let subscription_id = subscription.id.clone();

    state.cache.add_subscription(subscription).await?;

    client.send(ServerMessage::Subscribed {
        request_id: request.request_id.clone(),
        subscription_id,
    })?;

    counter!("gateway_subscriptions_total").increment(resources.len() as u64);
    Ok(())
}

/// Cancel a subscription. Cancelling an unknown subscription succeeds.
async fn handle_unsubscribe(
    state: &Arc<AppState>,
    client: &Arc<ClientState>,
    request: &UnsubscribeRequest,
) -> Result<()> {
    debug!(
        "Client {} unsubscribing {}",
        client.id, request.subscription_id
    );

    state
        .cache
        .cancel_subscription(&client.id, &request.subscription_id)
        .await?;

    client.send(ServerMessage::Unsubscribed {
        request_id: request.request_id.clone(),
        subscription_id: request.subscription_id.clone(),
    })?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use subscription_cache::SubscriptionError;

    #[test]
    fn connect_conflict_maps_to_already_exists_frame() {
        let frame =
            connect_failure_frame(SubscriptionError::ConnectionAlreadyExists("c1".to_string()));
        let json = serde_json::to_string(&frame).unwrap();
        assert!(json.contains(r#""type":"error""#));
        assert!(json.contains(r#""code":"ALREADY_EXISTS""#));
    }
}
