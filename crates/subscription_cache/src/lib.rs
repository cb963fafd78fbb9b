//! Subscription cache for live-data WebSocket fan-out.
//!
//! Tracks which connections are subscribed to which resource keys so that a
//! publisher can find the interested connections for a resource without
//! scanning every connection.
//!
//! ## Architecture
//!
//! ```text
//! gateway (connect / subscribe / unsubscribe / disconnect)
//!         ↓
//! SubscriptionCacheService
//!    ├── connection registry      connection:{id} -> Connection
//!    └── reverse resource index   {resource key}  -> ResourceIndexEntry
//!         ↑
//! ConnectionMaintenanceTask (periodic reconciliation)
//! ```
//!
//! The two indices are updated without cross-key transactions; duplicate
//! retries are absorbed by idempotent cancel semantics and leftover drift is
//! repaired by the maintenance sweep.

pub mod connection;
pub mod error;
pub mod index_entry;
pub mod maintenance;
pub mod memory;
pub mod redis_cache;
pub mod service;
pub mod subscription;

pub use connection::Connection;
pub use error::{Result, SubscriptionError};
pub use index_entry::{IndexedConnection, IndexedSubscription, ResourceIndexEntry};
pub use maintenance::{
    ConnectionLivenessOracle, ConnectionMaintenanceReport, ConnectionMaintenanceTask,
};
pub use memory::InMemorySubscriptionCacheService;
pub use redis_cache::RedisSubscriptionCacheService;
pub use service::{DeadConnectionFilter, SubscriptionCacheService};
pub use subscription::Subscription;
