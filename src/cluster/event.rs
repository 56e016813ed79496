//! Listener hooks the cluster invokes as it observes topology and status
//! changes, in the order the control connection observed them.

use std::net::SocketAddr;

/// Receives cluster-level topology notifications. All methods default to a
/// no-op so callers only override what they need.
pub trait ClusterEventListener: Send + Sync {
    /// A new node joined the cluster (`TOPOLOGY_CHANGE NEW_NODE`) or was
    /// seen for the first time during bootstrap.
    fn on_add(&self, _address: SocketAddr) {}

    /// A node transitioned to reachable (`STATUS_CHANGE UP`, or a pool
    /// reporting its first successful connection).
    fn on_up(&self, _address: SocketAddr) {}

    /// A pool lost its last connection and transitioned to `DOWN`.
    /// `STATUS_CHANGE DOWN` events from the control connection are not
    /// routed here by default (see `treat_status_change_down_as_hint`).
    fn on_down(&self, _address: SocketAddr) {}

    /// A node left the cluster (`TOPOLOGY_CHANGE REMOVED_NODE`).
    fn on_remove(&self, _address: SocketAddr) {}
}

/// The default listener installed when the caller configures none: observes
/// everything, acts on nothing.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoopClusterEventListener;

impl ClusterEventListener for NoopClusterEventListener {}

/// Re-prepares cached prepared statements against a newly up or newly
/// added host. Boxed future rather than an `async fn` in the trait, since
/// this crate does not otherwise depend on an async-trait helper crate.
pub trait PrepareHostHandler: Send + Sync {
    /// Re-prepares every cached statement against `address`. Errors are the
    /// handler's own responsibility to log; the cluster never surfaces
    /// them, since a failed re-prepare must not block the host from being
    /// marked ready.
    fn prepare_on_host(
        &self,
        address: SocketAddr,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = ()> + Send>>;
}

/// The default handler installed when `prepare-on-up-or-add-host` is not
/// configured: does nothing.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoopPrepareHostHandler;

impl PrepareHostHandler for NoopPrepareHostHandler {
    fn prepare_on_host(
        &self,
        _address: SocketAddr,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = ()> + Send>> {
        Box::pin(std::future::ready(()))
    }
}
