//! Owns every host's [`Pool`], keyed by address, and the session-wide
//! keyspace that new and existing connections are kept in sync with.

use std::{
    collections::HashMap,
    net::SocketAddr,
    sync::{Arc, Mutex},
};

use super::{
    connection_pool::{Pool, PoolNotify},
    connector::Connector,
    options::ConnectionOptions,
};
use crate::{policy::reconnection::ReconnectionPolicy, pool::conn::Connection};

/// Maps host address to [`Pool`]: add/remove by address, least-busy
/// lookup, keyspace propagation, and a coordinated close.
pub(crate) struct PoolManager {
    pools: Mutex<HashMap<SocketAddr, Arc<Pool>>>,
    connector: Connector,
    connection_options: Mutex<ConnectionOptions>,
    core_connections_per_host: usize,
    reconnection: Arc<dyn ReconnectionPolicy>,
    notify: Arc<dyn PoolNotify>,
}

impl PoolManager {
    pub(crate) fn new(
        connector: Connector,
        connection_options: ConnectionOptions,
        core_connections_per_host: usize,
        reconnection: Arc<dyn ReconnectionPolicy>,
        notify: Arc<dyn PoolNotify>,
    ) -> Self {
        Self {
            pools: Mutex::new(HashMap::new()),
            connector,
            connection_options: Mutex::new(connection_options),
            core_connections_per_host,
            reconnection,
            notify,
        }
    }

    /// Opens a pool for `address` if one isn't already present.
    pub(crate) fn add(&self, address: SocketAddr) {
        let mut pools = self.pools.lock().unwrap();
        if pools.contains_key(&address) {
            return;
        }
        let options = self.connection_options.lock().unwrap().clone();
        let pool = Pool::new(
            address,
            self.connector.clone(),
            options,
            self.core_connections_per_host,
            self.reconnection.clone(),
            self.notify.clone(),
        );
        pools.insert(address, pool);
    }

    /// Asks the pool for `address` to close; the entry is removed from the
    /// map immediately rather than waiting for the pool's own close to
    /// finish, since no caller can observe a half-removed entry either way.
    pub(crate) async fn remove(&self, address: SocketAddr) {
        let pool = self.pools.lock().unwrap().remove(&address);
        if let Some(pool) = pool {
            pool.close().await;
        }
    }

    /// `O(1)` map lookup followed by the pool's own least-busy selection.
    pub(crate) fn find_least_busy(&self, address: SocketAddr) -> Option<Connection> {
        self.pools.lock().unwrap().get(&address)?.least_busy()
    }

    /// A snapshot of addresses currently known to the manager, regardless
    /// of their pool's state.
    pub(crate) fn available(&self) -> Vec<SocketAddr> {
        self.pools.lock().unwrap().keys().copied().collect()
    }

    /// Propagates a keyspace change to every pool's open connections, and
    /// records it so connections opened afterward pick it up at handshake
    /// time too.
    pub(crate) async fn set_keyspace(&self, keyspace: &str) {
        self.connection_options.lock().unwrap().keyspace = Some(keyspace.to_string());
        let pools: Vec<Arc<Pool>> = self.pools.lock().unwrap().values().cloned().collect();
        for pool in pools {
            for connection in pool.connections_snapshot() {
                let _ = connection.set_keyspace(keyspace).await;
            }
        }
    }

    /// Closes every pool. Pools are copied out of the map first so closing
    /// one doesn't invalidate iteration over the others.
    pub(crate) async fn close(&self) {
        let pools: Vec<Arc<Pool>> = self.pools.lock().unwrap().drain().map(|(_, p)| p).collect();
        for pool in pools {
            pool.close().await;
        }
    }
}
