//! The cluster: one control connection at a time, the canonical host map,
//! schema snapshot, and token maps it keeps current, and the reconnect
//! loop that rebuilds the control connection on any host when it drops.
//!
//! A `Cluster` never closes on its own; it retries indefinitely using its
//! own load-balancing policy's query plan to choose the next control host,
//! until [`Cluster::close`] is called.

use std::{
    net::SocketAddr,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
};

use super::{
    control::{ControlConnection, TokenMaps},
    event::{ClusterEventListener, NoopClusterEventListener, NoopPrepareHostHandler, PrepareHostHandler},
    host::HostMap,
    schema::SchemaSnapshot,
};
use crate::{
    error::Result,
    policy::{
        load_balancing::{LoadBalancingPolicy, PlanRequest},
        reconnection::ReconnectionPolicy,
    },
    pool::{connector::Connector, options::ConnectionOptions},
    runtime,
};

/// Owns the single control connection and the metadata it keeps current:
/// the host map, schema snapshot, and per-keyspace token maps.
pub(crate) struct Cluster {
    hosts: Arc<Mutex<HostMap>>,
    schema: Arc<Mutex<SchemaSnapshot>>,
    token_maps: TokenMaps,
    closed: Arc<AtomicBool>,
    control_task: runtime::AsyncJoinHandle<()>,
}

/// Assembles everything a [`Cluster`] needs to bootstrap and then keep
/// reconnecting its control connection, grouped since the constructor
/// would otherwise take an unreasonable number of positional arguments.
pub(crate) struct ClusterOptions {
    /// Addresses to attempt a control connection against before any host
    /// has been discovered.
    pub contact_points: Vec<SocketAddr>,
    /// How to establish the transport to a chosen address.
    pub connector: Connector,
    /// Handshake options applied to the control connection (and to every
    /// other connection derived from the same session configuration).
    pub connection_options: ConnectionOptions,
    /// The native-protocol port hosts discovered via `system.local`/
    /// `system.peers` are assumed to listen on (those rows carry no port
    /// column of their own).
    pub native_port: u16,
    /// Chooses the next control-connection host on every (re)connect.
    pub load_balancing: Arc<dyn LoadBalancingPolicy>,
    /// Schedules the delay between control-connection reconnect attempts.
    pub reconnection: Arc<dyn ReconnectionPolicy>,
    /// Receives topology/status/schema notifications. Defaults to a no-op.
    pub listener: Arc<dyn ClusterEventListener>,
    /// Re-prepares cached statements on `UP`/`ADD`, per
    /// `prepare-on-up-or-add-host`. Defaults to a no-op.
    pub prepare_host_handler: Arc<dyn PrepareHostHandler>,
    /// Whether a `STATUS_CHANGE DOWN` event should mark the host down.
    /// Ignored by default, matching the original driver: pool failures, not
    /// the control channel, are meant to drive down detection.
    pub treat_status_change_down_as_hint: bool,
}

impl Default for ClusterOptions {
    fn default() -> Self {
        Self {
            contact_points: Vec::new(),
            connector: Connector::Plain,
            connection_options: ConnectionOptions::default(),
            native_port: 9042,
            load_balancing: Arc::new(crate::policy::load_balancing::RoundRobinPolicy::new()),
            reconnection: Arc::new(crate::policy::reconnection::ConstantReconnectionPolicy::new(
                std::time::Duration::from_secs(1),
            )),
            listener: Arc::new(NoopClusterEventListener),
            prepare_host_handler: Arc::new(NoopPrepareHostHandler),
            treat_status_change_down_as_hint: false,
        }
    }
}

impl Cluster {
    /// Establishes the first control connection against one of
    /// `options.contact_points`, bootstraps the host map, schema snapshot,
    /// and token maps from it, and spawns the background task that keeps a
    /// control connection alive thereafter.
    pub(crate) async fn connect(options: ClusterOptions) -> Result<Self> {
        let hosts = Arc::new(Mutex::new(HostMap::new()));
        let schema = Arc::new(Mutex::new(SchemaSnapshot::new()));
        let token_maps: TokenMaps = Arc::new(Mutex::new(std::collections::HashMap::new()));
        let closed = Arc::new(AtomicBool::new(false));

        let listener: Arc<dyn ClusterEventListener> = Arc::new(DispatchingListener {
            inner: options.listener.clone(),
            prepare: options.prepare_host_handler.clone(),
        });

        let first = connect_first(
            &options.contact_points,
            &options.connector,
            &options.connection_options,
            options.treat_status_change_down_as_hint,
        )
        .await?;
        first.bootstrap(options.native_port, &hosts, &schema, &token_maps).await?;

        let control_task = runtime::spawn(control_loop(
            first,
            hosts.clone(),
            schema.clone(),
            token_maps.clone(),
            listener,
            options.load_balancing,
            options.reconnection,
            options.connector,
            options.connection_options,
            options.native_port,
            options.contact_points,
            options.treat_status_change_down_as_hint,
            closed.clone(),
        ));

        Ok(Self {
            hosts,
            schema,
            token_maps,
            closed,
            control_task,
        })
    }

    /// The canonical host map, shared with load-balancing policies.
    pub(crate) fn hosts(&self) -> Arc<Mutex<HostMap>> {
        self.hosts.clone()
    }

    /// The current schema snapshot.
    pub(crate) fn schema(&self) -> Arc<Mutex<SchemaSnapshot>> {
        self.schema.clone()
    }

    /// The per-keyspace token maps, shared with [`crate::policy::load_balancing::TokenAwarePolicy`].
    pub(crate) fn token_maps(&self) -> TokenMaps {
        self.token_maps.clone()
    }

    /// Stops the control-connection reconnect loop. Idempotent.
    pub(crate) fn close(&self) {
        self.closed.store(true, Ordering::Relaxed);
        self.control_task.abort();
    }
}

/// Wraps the caller's listener, fanning out each notification to both it
/// and the prepare-on-up-or-add-host handler. `on_down` is never invoked by
/// the control connection itself, but is still forwarded for pool-driven
/// callers that share this listener.
struct DispatchingListener {
    inner: Arc<dyn ClusterEventListener>,
    prepare: Arc<dyn PrepareHostHandler>,
}

impl ClusterEventListener for DispatchingListener {
    fn on_add(&self, address: SocketAddr) {
        self.inner.on_add(address);
        runtime::spawn(self.prepare.prepare_on_host(address));
    }

    fn on_up(&self, address: SocketAddr) {
        self.inner.on_up(address);
        runtime::spawn(self.prepare.prepare_on_host(address));
    }

    fn on_down(&self, address: SocketAddr) {
        self.inner.on_down(address);
    }

    fn on_remove(&self, address: SocketAddr) {
        self.inner.on_remove(address);
    }
}

async fn connect_first(
    contact_points: &[SocketAddr],
    connector: &Connector,
    connection_options: &ConnectionOptions,
    treat_down_as_hint: bool,
) -> Result<ControlConnection> {
    let mut last_error = None;
    for address in contact_points {
        match connect_control(*address, connector, connection_options, treat_down_as_hint).await {
            Ok(control) => return Ok(control),
            Err(e) => last_error = Some(e),
        }
    }
    Err(last_error.unwrap_or_else(|| crate::error::Error::internal("no contact points configured")))
}

async fn connect_control(
    address: SocketAddr,
    connector: &Connector,
    connection_options: &ConnectionOptions,
    treat_down_as_hint: bool,
) -> Result<ControlConnection> {
    let mut options = connection_options.clone();
    options.register_event_types = vec![
        "TOPOLOGY_CHANGE".to_string(),
        "STATUS_CHANGE".to_string(),
        "SCHEMA_CHANGE".to_string(),
    ];
    let stream = connector.connect(address).await?;
    ControlConnection::connect(address, stream, &options, treat_down_as_hint).await
}

/// Keeps a control connection alive forever: when one dies (for any
/// reason, including the very first bootstrap attempt failing), waits out
/// the reconnection policy's delay and tries the next host in the current
/// query plan, falling back to the original contact points if no host is
/// yet known to be up.
#[allow(clippy::too_many_arguments)]
async fn control_loop(
    mut current: ControlConnection,
    hosts: Arc<Mutex<HostMap>>,
    schema: Arc<Mutex<SchemaSnapshot>>,
    token_maps: TokenMaps,
    listener: Arc<dyn ClusterEventListener>,
    load_balancing: Arc<dyn LoadBalancingPolicy>,
    reconnection: Arc<dyn ReconnectionPolicy>,
    connector: Connector,
    connection_options: ConnectionOptions,
    native_port: u16,
    contact_points: Vec<SocketAddr>,
    treat_down_as_hint: bool,
    closed: Arc<AtomicBool>,
) {
    loop {
        current
            .run(hosts.clone(), schema.clone(), token_maps.clone(), listener.clone())
            .await;

        if closed.load(Ordering::Relaxed) {
            return;
        }

        #[cfg(feature = "tracing-unstable")]
        tracing::warn!("control connection lost, reconnecting");

        let mut schedule = reconnection.new_schedule();
        loop {
            if closed.load(Ordering::Relaxed) {
                return;
            }

            let plan = {
                let hosts = hosts.lock().unwrap();
                if hosts.up_hosts().is_empty() {
                    contact_points.clone()
                } else {
                    load_balancing.plan(&hosts, &PlanRequest::default())
                }
            };

            let mut reconnected = None;
            for address in &plan {
                if let Ok(control) =
                    connect_control(*address, &connector, &connection_options, treat_down_as_hint).await
                {
                    reconnected = Some(control);
                    break;
                }
            }

            match reconnected {
                Some(control) => {
                    if control.bootstrap(native_port, &hosts, &schema, &token_maps).await.is_ok() {
                        #[cfg(feature = "tracing-unstable")]
                        tracing::debug!(address = %control.address(), "control connection reestablished");
                        current = control;
                        break;
                    }
                }
                None => {}
            }

            let delay = schedule.next_delay();
            #[cfg(feature = "tracing-unstable")]
            tracing::debug!(delay_ms = %delay.as_millis(), "control connection reconnect delayed");
            runtime::sleep(delay).await;
        }
    }
}
