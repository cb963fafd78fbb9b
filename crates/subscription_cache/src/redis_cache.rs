//! Redis-backed subscription cache.
//!
//! Key layout:
//! - `connection:{id}` -> Connection JSON blob (normalized registry)
//! - `connections:open` -> Redis set of open connection ids
//! - resource keys stored verbatim (e.g. `ts:device:u1:d1`) -> index entry JSON blob
//!
//! No multi-key transactions are used. Connection creation relies on the
//! atomicity of SADD for duplicate detection; everything else is single-key
//! read-modify-write, with the maintenance sweep repairing drift left behind
//! by crashes between the connection write and the index writes.

use crate::connection::Connection;
use crate::error::{Result, SubscriptionError};
use crate::index_entry::ResourceIndexEntry;
use crate::service::{DeadConnectionFilter, SubscriptionCacheService};
use crate::subscription::Subscription;
use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use redis::AsyncCommands;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Redis key prefix for connection records.
pub const CONNECTION_KEY_PREFIX: &str = "connection:";

/// Redis key holding the set of open connection ids.
pub const OPEN_CONNECTIONS_KEY: &str = "connections:open";

/// Subscription cache backed by a Redis instance.
#[derive(Clone)]
pub struct RedisSubscriptionCacheService {
    client: Arc<redis::Client>,
}

impl RedisSubscriptionCacheService {
    /// Create a new cache service for the given Redis URL.
    pub fn new(redis_url: &str) -> Result<Self> {
        let client = redis::Client::open(redis_url)?;
        Ok(Self {
            client: Arc::new(client),
        })
    }

    /// Get an async connection to Redis.
    async fn conn(&self) -> Result<MultiplexedConnection> {
        Ok(self.client.get_multiplexed_async_connection().await?)
    }

    /// Returns true if the backing Redis instance answers a PING.
    pub async fn is_connected(&self) -> bool {
        match self.conn().await {
            Ok(mut conn) => redis::cmd("PING")
                .query_async::<String>(&mut conn)
                .await
                .is_ok(),
            Err(_) => false,
        }
    }

    fn connection_key(connection_id: &str) -> String {
        format!("{}{}", CONNECTION_KEY_PREFIX, connection_id)
    }

    /// Load and deserialize the connection record for the given id.
    async fn load_connection(
        conn: &mut MultiplexedConnection,
        connection_id: &str,
    ) -> Result<Connection> {
        let json: Option<String> = conn.get(Self::connection_key(connection_id)).await?;
        match json {
            Some(json) => Connection::from_json(&json),
            None => Err(SubscriptionError::ConnectionNotFound(
                connection_id.to_string(),
            )),
        }
    }

    /// Fetch the index entries for the given resource keys, materializing an
    /// empty entry for every key with no stored value.
    async fn fetch_entries(
        conn: &mut MultiplexedConnection,
        resource_ids: &BTreeSet<String>,
    ) -> Result<HashMap<String, ResourceIndexEntry>> {
        if resource_ids.is_empty() {
            return Ok(HashMap::new());
        }

        let keys: Vec<&String> = resource_ids.iter().collect();
        let values: Vec<Option<String>> = conn.mget(&keys).await?;

        let mut entries = HashMap::with_capacity(resource_ids.len());
        for (key, value) in resource_ids.iter().zip(values) {
            let entry = match value {
                Some(json) => ResourceIndexEntry::from_json(key.clone(), &json)?,
                None => ResourceIndexEntry::empty(key.clone()),
            };
            entries.insert(key.clone(), entry);
        }
        Ok(entries)
    }

    /// Remove the given subscription's references from the index entry of
    /// every resource key it covers, deleting entries that become empty.
    async fn remove_subscription_references(
        conn: &mut MultiplexedConnection,
        subscription: &Subscription,
    ) -> Result<()> {
        for resource_id in &subscription.resources {
            let json: Option<String> = conn.get(resource_id).await?;
            let Some(json) = json else {
                debug!(
                    "resource '{}' has no index entry, nothing to remove",
                    resource_id
                );
                continue;
            };

            let mut entry = ResourceIndexEntry::from_json(resource_id.clone(), &json)?;
            entry.remove_subscription(&subscription.connection_id, &subscription.id);

            if entry.is_empty() {
                conn.del::<_, ()>(resource_id).await?;
            } else {
                conn.set::<_, _, ()>(resource_id, entry.to_json()?).await?;
            }
        }
        Ok(())
    }

    /// Enumerate every key with an incremental SCAN cursor loop. KEYS would
    /// block the Redis instance on large datasets.
    async fn scan_keys(conn: &mut MultiplexedConnection) -> Result<Vec<String>> {
        let mut keys = Vec::new();
        let mut cursor: u64 = 0;
        loop {
            let (next, batch): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("COUNT")
                .arg(100)
                .query_async(conn)
                .await?;
            keys.extend(batch);
            cursor = next;
            if cursor == 0 {
                break;
            }
        }
        Ok(keys)
    }

    /// Returns all resource keys in the store (everything that is not a
    /// connection record or the open-connections set).
    async fn resource_keys(conn: &mut MultiplexedConnection) -> Result<Vec<String>> {
        let keys = Self::scan_keys(conn).await?;
        Ok(keys
            .into_iter()
            .filter(|k| !k.starts_with(CONNECTION_KEY_PREFIX) && k != OPEN_CONNECTIONS_KEY)
            .collect())
    }
}

#[async_trait]
impl SubscriptionCacheService for RedisSubscriptionCacheService {
    async fn create_connection(&self, connection_id: &str, subscriber_id: &str) -> Result<()> {
        info!("creating connection '{}'", connection_id);

        let mut conn = self.conn().await?;

        // SADD is the atomic dedup point: of two concurrent creates for the
        // same id, only one observes the member as newly added.
        let added: i64 = conn.sadd(OPEN_CONNECTIONS_KEY, connection_id).await?;
        if added == 0 {
            return Err(SubscriptionError::ConnectionAlreadyExists(
                connection_id.to_string(),
            ));
        }

        let record = Connection::new(connection_id, subscriber_id);
        conn.set::<_, _, ()>(Self::connection_key(connection_id), record.to_json()?)
            .await?;
        Ok(())
    }

    async fn get_connection(&self, connection_id: &str) -> Result<Connection> {
        let mut conn = self.conn().await?;
        Self::load_connection(&mut conn, connection_id).await
    }

    async fn get_all_connection_ids(&self) -> Result<HashSet<String>> {
        let mut conn = self.conn().await?;
        Ok(conn.smembers(OPEN_CONNECTIONS_KEY).await?)
    }

    async fn close_connection(&self, connection_id: &str) -> Result<()> {
        info!("closing connection '{}'", connection_id);

        let mut conn = self.conn().await?;
        let connection = match Self::load_connection(&mut conn, connection_id).await {
            Ok(connection) => connection,
            Err(e) if e.is_not_found() => {
                // a crash between the set-add and the record write (or
                // between the record delete and the set-remove) strands the
                // id in the open set; purge it so the sweep converges
                conn.srem::<_, _, ()>(OPEN_CONNECTIONS_KEY, connection_id)
                    .await?;
                return Err(e);
            }
            Err(e) => return Err(e),
        };

        for subscription in &connection.subscriptions {
            // one bad entry must not abort cleanup of the rest
            if let Err(e) = Self::remove_subscription_references(&mut conn, subscription).await {
                warn!(
                    "failed to remove index references for subscription '{}' on connection '{}': {}",
                    subscription.id, connection_id, e
                );
            }
        }

        conn.del::<_, ()>(Self::connection_key(connection_id))
            .await?;
        conn.srem::<_, _, ()>(OPEN_CONNECTIONS_KEY, connection_id)
            .await?;
        Ok(())
    }

    async fn add_subscription(&self, subscription: Subscription) -> Result<()> {
        info!(
            "creating subscription '{}' for connection '{}'",
            subscription.id, subscription.connection_id
        );

        let mut conn = self.conn().await?;
        let mut connection = Self::load_connection(&mut conn, &subscription.connection_id).await?;

        if connection.find_subscription(&subscription.id).is_some() {
            return Err(SubscriptionError::SubscriptionAlreadyExists(
                subscription.connection_id.clone(),
                subscription.id.clone(),
            ));
        }

        // normalized side first; a crash before the index writes leaves drift
        // that the maintenance sweep repairs
        connection.add_subscription(subscription.clone());
        conn.set::<_, _, ()>(
            Self::connection_key(&subscription.connection_id),
            connection.to_json()?,
        )
        .await?;

        let mut entries = Self::fetch_entries(&mut conn, &subscription.resources).await?;
        for entry in entries.values_mut() {
            entry.add_subscription(&subscription);
        }

        let items: Vec<(String, String)> = entries
            .values()
            .map(|entry| Ok((entry.key.clone(), entry.to_json()?)))
            .collect::<Result<_>>()?;
        if !items.is_empty() {
            conn.mset::<_, _, ()>(&items).await?;
        }
        Ok(())
    }

    async fn cancel_subscription(&self, connection_id: &str, subscription_id: &str) -> Result<()> {
        info!(
            "cancelling subscription '{}' for connection '{}'",
            subscription_id, connection_id
        );

        let mut conn = self.conn().await?;

        // idempotent: callers may retry unsubscribe and disconnect requests
        let mut connection = match Self::load_connection(&mut conn, connection_id).await {
            Ok(connection) => connection,
            Err(e) if e.is_not_found() => {
                debug!(
                    "connection '{}' not found, cancel is a no-op",
                    connection_id
                );
                return Ok(());
            }
            Err(e) => return Err(e),
        };

        let Some(subscription) = connection.remove_subscription(subscription_id) else {
            debug!(
                "subscription '{}' not found on connection '{}', cancel is a no-op",
                subscription_id, connection_id
            );
            return Ok(());
        };

        conn.set::<_, _, ()>(Self::connection_key(connection_id), connection.to_json()?)
            .await?;
        Self::remove_subscription_references(&mut conn, &subscription).await?;
        Ok(())
    }

    async fn get_denormalized_connections_for_resource_ids(
        &self,
        resource_ids: &BTreeSet<String>,
    ) -> Result<HashMap<String, ResourceIndexEntry>> {
        let mut conn = self.conn().await?;
        Self::fetch_entries(&mut conn, resource_ids).await
    }

    async fn dump_cache(&self) -> Result<BTreeMap<String, serde_json::Value>> {
        let mut conn = self.conn().await?;
        let keys = Self::scan_keys(&mut conn).await?;

        let mut dump = BTreeMap::new();
        for key in keys {
            let value = if key == OPEN_CONNECTIONS_KEY {
                let members: Vec<String> = conn.smembers(&key).await?;
                serde_json::to_value(members)?
            } else {
                let raw: Option<String> = conn.get(&key).await?;
                match raw {
                    Some(raw) => serde_json::from_str(&raw)
                        .unwrap_or_else(|_| serde_json::Value::String(raw)),
                    None => serde_json::Value::Null,
                }
            };
            dump.insert(key, value);
        }
        Ok(dump)
    }

    async fn clean_cache(&self, filter: &dyn DeadConnectionFilter) -> Result<()> {
        let mut conn = self.conn().await?;
        let keys = Self::resource_keys(&mut conn).await?;
        if keys.is_empty() {
            return Ok(());
        }

        let values: Vec<Option<String>> = conn.mget(&keys).await?;
        let mut entries = Vec::new();
        let mut referenced = HashSet::new();
        for (key, value) in keys.into_iter().zip(values) {
            // keys can disappear between KEYS and MGET; skip them
            let Some(json) = value else { continue };
            let entry = ResourceIndexEntry::from_json(key, &json)?;
            referenced.extend(entry.connection_ids());
            entries.push(entry);
        }

        let dead = filter.dead_connections(referenced).await;
        if dead.is_empty() {
            debug!("no dead connections referenced by the resource index");
            return Ok(());
        }
        info!("pruning {} dead connections from the resource index", dead.len());

        for mut entry in entries {
            let before = entry.connection_ids();
            if before.iter().all(|id| !dead.contains(id)) {
                continue;
            }
            for id in before.iter().filter(|id| dead.contains(*id)) {
                entry.remove_connection(id);
            }

            if entry.is_empty() {
                conn.del::<_, ()>(&entry.key).await?;
            } else {
                conn.set::<_, _, ()>(&entry.key, entry.to_json()?).await?;
            }
        }
        Ok(())
    }
}
