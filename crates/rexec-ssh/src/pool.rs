//! Connection pool keyed by server identity

use crate::{ConnectOptions, RemoteConnection, ServerIdentity};
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

/// Keyed cache of [`RemoteConnection`]s.
///
/// At most one connection exists per key; the first registration of a key
/// wins and later identities with the same key get the existing connection.
pub struct ConnectionPool {
    /// Options given to every connection the pool creates
    options: ConnectOptions,
    /// Connections by identity key
    connections: RwLock<HashMap<String, Arc<RemoteConnection>>>,
}

impl ConnectionPool {
    /// Create an empty pool with default dial options
    pub fn new() -> Self {
        Self::with_options(ConnectOptions::default())
    }

    /// Create an empty pool whose connections use `options`
    pub fn with_options(options: ConnectOptions) -> Self {
        Self {
            options,
            connections: RwLock::new(HashMap::new()),
        }
    }

    /// Return the connection registered under `identity.key`, registering a
    /// new one if there is none. Does not dial.
    pub async fn get_or_create(&self, identity: ServerIdentity) -> Arc<RemoteConnection> {
        if let Some(connection) = self.connections.read().await.get(&identity.key) {
            debug!("Reusing pooled connection {}", identity.key);
            return Arc::clone(connection);
        }

        let mut connections = self.connections.write().await;
        match connections.entry(identity.key.clone()) {
            Entry::Occupied(entry) => {
                let existing = entry.get();
                if existing.identity() != &identity {
                    warn!(
                        "Connection {} already registered with different parameters, keeping the first",
                        identity.key
                    );
                }
                Arc::clone(existing)
            }
            Entry::Vacant(entry) => {
                info!("Registered connection {} ({})", identity.key, identity.address());
                let connection = Arc::new(RemoteConnection::with_options(
                    identity,
                    self.options.clone(),
                ));
                Arc::clone(entry.insert(connection))
            }
        }
    }

    /// Look up a connection without creating one
    pub async fn get(&self, key: &str) -> Option<Arc<RemoteConnection>> {
        self.connections.read().await.get(key).cloned()
    }

    /// Number of registered connections
    pub async fn len(&self) -> usize {
        self.connections.read().await.len()
    }

    /// Whether no connection is registered
    pub async fn is_empty(&self) -> bool {
        self.connections.read().await.is_empty()
    }

    /// Registered keys, sorted
    pub async fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.connections.read().await.keys().cloned().collect();
        keys.sort();
        keys
    }

    /// Close every connection and empty the pool. Best-effort.
    pub async fn close_all(&self) {
        let drained: Vec<(String, Arc<RemoteConnection>)> =
            self.connections.write().await.drain().collect();

        info!("Closing {} pooled connections", drained.len());
        for (key, connection) in drained {
            connection.close().await;
            debug!("Closed pooled connection {}", key);
        }
    }
}

impl Default for ConnectionPool {
    fn default() -> Self {
        Self::new()
    }
}
