//! Gateway service for live-data subscription management over WebSockets.
//!
//! This service:
//! - Accepts WebSocket connections from clients with a bearer token
//! - Validates and authorizes subscribe requests
//! - Records connections and subscriptions in the shared subscription cache
//! - Periodically reconciles the cache against the set of open sockets
//!
//! ## Architecture
//!
//! ```text
//! WebSocket clients
//!         ↓
//! ws_server (axum) ── auth (resource-check endpoint)
//!         ↓
//! ClientRegistry (DashMap, liveness oracle)
//!         ↓
//! SubscriptionCacheService (Redis-backed)
//!         ↑
//! ConnectionMaintenanceTask (periodic sweep)
//! ```

pub mod auth;
pub mod client;
pub mod error;
pub mod protocol;
pub mod resource;
pub mod ws_server;

pub use auth::{
    AllowAllAuthorizationService, AuthContext, HttpSubscriptionAuthorizationService,
    SubscriptionAuthorizationService,
};
pub use client::{ClientRegistry, ClientState};
pub use error::{GatewayError, Result};
pub use protocol::{ClientMessage, ServerMessage, SubscriptionRequest, UnsubscribeRequest};
pub use ws_server::{create_router, AppState};
