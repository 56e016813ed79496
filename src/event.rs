//! Session-level notifications: pool transitions the application may want
//! to observe, distinct from [`crate::cluster::ClusterEventListener`] (which
//! is cluster-internal and drives re-preparation, not application code).

use std::net::SocketAddr;

/// Receives pool-up/down/critical notifications forwarded by the
/// [`crate::pool::PoolManager`]. All methods default to a no-op.
pub trait SessionEventListener: Send + Sync {
    /// A pool to `address` opened its first connection.
    fn on_pool_up(&self, _address: SocketAddr) {}
    /// A pool to `address` lost its last connection.
    fn on_pool_down(&self, _address: SocketAddr) {}
    /// A pool to `address` hit a critical failure and closed permanently.
    fn on_pool_critical(&self, _address: SocketAddr) {}
}

/// The default listener: observes everything, acts on nothing.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoopSessionEventListener;

impl SessionEventListener for NoopSessionEventListener {}

/// Bridges a [`SessionEventListener`] to the pool-internal
/// [`crate::pool::PoolNotify`] trait, so `Session` can hand the manager one
/// listener without the `pool` module depending on this public trait's
/// naming.
pub(crate) struct PoolNotifyBridge {
    pub(crate) listener: std::sync::Arc<dyn SessionEventListener>,
}

impl crate::pool::PoolNotify for PoolNotifyBridge {
    fn on_up(&self, address: SocketAddr) {
        self.listener.on_pool_up(address);
    }

    fn on_down(&self, address: SocketAddr) {
        self.listener.on_pool_down(address);
    }

    fn on_critical(&self, address: SocketAddr) {
        self.listener.on_pool_critical(address);
    }
}
