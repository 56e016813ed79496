//! Per-host connection pool: keeps `core_connections_per_host` connections
//! open, reconnects on loss with backoff, and picks the least busy
//! connection for a caller to use.

use std::{
    net::SocketAddr,
    sync::{
        atomic::{AtomicBool, AtomicU8, Ordering},
        Arc, Mutex,
    },
};

use super::{connector::Connector, options::ConnectionOptions};
use crate::{
    error::Result,
    policy::reconnection::ReconnectionPolicy,
    pool::conn::Connection,
    runtime,
};

/// Pool-level notification state: `UP` iff at least one connection is
/// open; `CRITICAL` and `CLOSED` are terminal.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub(crate) enum PoolState {
    New = 0,
    Up = 1,
    Down = 2,
    Critical = 3,
    Closed = 4,
}

impl PoolState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => PoolState::Up,
            2 => PoolState::Down,
            3 => PoolState::Critical,
            4 => PoolState::Closed,
            _ => PoolState::New,
        }
    }
}

/// Receives pool-level transitions. [`super::manager::PoolManager`] forwards
/// these to a session-level listener; a no-op default is used otherwise.
pub(crate) trait PoolNotify: Send + Sync {
    fn on_up(&self, _address: SocketAddr) {}
    fn on_down(&self, _address: SocketAddr) {}
    fn on_critical(&self, _address: SocketAddr) {}
}

#[derive(Default)]
pub(crate) struct NoopPoolNotify;
impl PoolNotify for NoopPoolNotify {}

struct Shared {
    address: SocketAddr,
    connections: Mutex<Vec<Connection>>,
    state: AtomicU8,
    closing: AtomicBool,
    was_up: AtomicBool,
}

/// A pool of connections to a single host. Identity is the address; state
/// transitions `NEW -> UP | DOWN | CRITICAL -> CLOSED`.
pub(crate) struct Pool {
    shared: Arc<Shared>,
    connector: Connector,
    connection_options: ConnectionOptions,
    core_connections_per_host: usize,
    reconnection: Arc<dyn ReconnectionPolicy>,
    notify: Arc<dyn PoolNotify>,
    maintain_task: Mutex<Option<runtime::AsyncJoinHandle<()>>>,
}

impl Pool {
    /// Creates a pool for `address` and spawns its connection-maintenance
    /// task, which dials up to `core_connections_per_host` connections and
    /// keeps reconnecting lost ones until the pool is closed.
    pub(crate) fn new(
        address: SocketAddr,
        connector: Connector,
        connection_options: ConnectionOptions,
        core_connections_per_host: usize,
        reconnection: Arc<dyn ReconnectionPolicy>,
        notify: Arc<dyn PoolNotify>,
    ) -> Arc<Self> {
        let shared = Arc::new(Shared {
            address,
            connections: Mutex::new(Vec::new()),
            state: AtomicU8::new(PoolState::New as u8),
            closing: AtomicBool::new(false),
            was_up: AtomicBool::new(false),
        });

        let pool = Arc::new(Self {
            shared,
            connector,
            connection_options,
            core_connections_per_host: core_connections_per_host.max(1),
            reconnection,
            notify,
            maintain_task: Mutex::new(None),
        });

        let task = runtime::spawn(maintain(pool.clone()));
        *pool.maintain_task.lock().unwrap() = Some(task);
        pool
    }

    pub(crate) fn address(&self) -> SocketAddr {
        self.shared.address
    }

    pub(crate) fn state(&self) -> PoolState {
        PoolState::from_u8(self.shared.state.load(Ordering::Relaxed))
    }

    /// Returns the open connection with the fewest in-flight requests. Ties
    /// are broken by position in the underlying vector.
    pub(crate) fn least_busy(&self) -> Option<Connection> {
        self.shared
            .connections
            .lock()
            .unwrap()
            .iter()
            .filter(|c| !c.is_defunct())
            .min_by_key(|c| c.in_flight())
            .cloned()
    }

    /// The number of currently open (non-defunct) connections.
    pub(crate) fn connection_count(&self) -> usize {
        self.shared.connections.lock().unwrap().len()
    }

    /// A snapshot of every currently open connection, for callers (such as
    /// the pool manager's keyspace propagation) that need to act on each
    /// one without holding the pool's lock.
    pub(crate) fn connections_snapshot(&self) -> Vec<Connection> {
        self.shared.connections.lock().unwrap().clone()
    }

    /// Idempotent close: marks the pool closing, defuncts every connection,
    /// waits for the maintenance task to observe the close and exit, then
    /// notifies `DOWN` if the pool was ever `UP`.
    pub(crate) async fn close(&self) {
        if self.shared.closing.swap(true, Ordering::Relaxed) {
            return;
        }
        for connection in self.shared.connections.lock().unwrap().drain(..) {
            connection.close();
        }
        let task = self.maintain_task.lock().unwrap().take();
        if let Some(task) = task {
            task.abort();
        }
        self.shared.state.store(PoolState::Closed as u8, Ordering::Relaxed);
        if self.shared.was_up.load(Ordering::Relaxed) {
            self.notify.on_down(self.shared.address);
        }
    }
}

async fn maintain(pool: Arc<Pool>) {
    let mut schedule = pool.reconnection.new_schedule();
    loop {
        if pool.shared.closing.load(Ordering::Relaxed) {
            return;
        }

        prune_defunct(&pool);
        let deficit = pool.core_connections_per_host.saturating_sub(pool.connection_count());
        if deficit == 0 {
            runtime::sleep(std::time::Duration::from_millis(100)).await;
            continue;
        }

        match dial(&pool).await {
            Ok(connection) => {
                pool.shared.connections.lock().unwrap().push(connection);
                let was_down = pool.state() != PoolState::Up;
                pool.shared.state.store(PoolState::Up as u8, Ordering::Relaxed);
                pool.shared.was_up.store(true, Ordering::Relaxed);
                if was_down {
                    #[cfg(feature = "tracing-unstable")]
                    tracing::debug!(address = %pool.shared.address, "pool transitioned to UP");
                    pool.notify.on_up(pool.shared.address);
                }
                schedule = pool.reconnection.new_schedule();
            }
            Err(e) if e.is_critical() => {
                #[cfg(feature = "tracing-unstable")]
                tracing::error!(address = %pool.shared.address, error = %e, "pool transitioned to CRITICAL");
                pool.shared.state.store(PoolState::Critical as u8, Ordering::Relaxed);
                pool.notify.on_critical(pool.shared.address);
                pool.close().await;
                return;
            }
            Err(_e) => {
                if pool.connection_count() == 0 {
                    let was_up = pool.state() == PoolState::Up;
                    pool.shared.state.store(PoolState::Down as u8, Ordering::Relaxed);
                    if was_up {
                        #[cfg(feature = "tracing-unstable")]
                        tracing::warn!(address = %pool.shared.address, "pool transitioned to DOWN");
                        pool.notify.on_down(pool.shared.address);
                    }
                }
                let delay = schedule.next_delay();
                #[cfg(feature = "tracing-unstable")]
                tracing::debug!(address = %pool.shared.address, delay_ms = %delay.as_millis(), "reconnect delayed");
                runtime::sleep(delay).await;
            }
        }
    }
}

#[cfg(test)]
impl Pool {
    /// Builds a pool around already-established connections with no
    /// maintenance task, for tests that only need [`Pool::least_busy`]'s
    /// selection logic.
    fn for_test(address: SocketAddr, connections: Vec<Connection>) -> Arc<Self> {
        let shared = Arc::new(Shared {
            address,
            connections: Mutex::new(connections),
            state: AtomicU8::new(PoolState::Up as u8),
            closing: AtomicBool::new(false),
            was_up: AtomicBool::new(true),
        });
        Arc::new(Self {
            shared,
            connector: Connector::Plain,
            connection_options: ConnectionOptions::default(),
            core_connections_per_host: 1,
            reconnection: Arc::new(crate::policy::reconnection::ExponentialReconnectionPolicy::new(
                std::time::Duration::from_millis(100),
                std::time::Duration::from_secs(30),
            )),
            notify: Arc::new(NoopPoolNotify),
            maintain_task: Mutex::new(None),
        })
    }
}

fn prune_defunct(pool: &Arc<Pool>) {
    let mut connections = pool.shared.connections.lock().unwrap();
    let had = connections.len();
    connections.retain(|c| !c.is_defunct());
    if connections.is_empty() && had > 0 {
        let was_up = pool.state() == PoolState::Up;
        drop(connections);
        pool.shared.state.store(PoolState::Down as u8, Ordering::Relaxed);
        if was_up {
            pool.notify.on_down(pool.shared.address);
        }
    }
}

async fn dial(pool: &Arc<Pool>) -> Result<Connection> {
    let stream = pool.connector.connect(pool.shared.address).await?;
    Connection::establish(pool.shared.address, stream, &pool.connection_options, None).await
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use bytes::BytesMut;
    use tokio::{
        io::{AsyncReadExt, AsyncWriteExt},
        net::{TcpListener, TcpStream},
    };

    use super::*;
    use crate::protocol::{Frame, FrameFlags, Opcode};

    /// Accepts one connection, replies `READY` to its `STARTUP`, then reads
    /// (and never answers) every further frame, so the client sees those
    /// requests as perpetually in flight.
    async fn serve_handshake_then_stall(listener: &TcpListener) {
        let (mut socket, _) = listener.accept().await.unwrap();
        read_and_answer_startup(&mut socket).await;
        let mut buf = BytesMut::with_capacity(1024);
        loop {
            buf.resize(1024, 0);
            match socket.read(&mut buf).await {
                Ok(0) | Err(_) => return,
                Ok(_) => continue,
            }
        }
    }

    async fn read_and_answer_startup(socket: &mut TcpStream) {
        let protocol_version = crate::protocol::DEFAULT_PROTOCOL_VERSION;
        let header_len = Frame::header_len(protocol_version);
        let mut header = vec![0u8; header_len];
        socket.read_exact(&mut header).await.unwrap();
        let (_, _, _, body_len) = Frame::peek_header(&header, protocol_version).unwrap().unwrap();
        let mut body = vec![0u8; body_len];
        if body_len > 0 {
            socket.read_exact(&mut body).await.unwrap();
        }
        let ready = Frame::encode(protocol_version, FrameFlags::empty(), 0, Opcode::Ready, &[]).unwrap();
        socket.write_all(&ready).await.unwrap();
    }

    async fn connect_one(listener_addr: std::net::SocketAddr) -> Connection {
        let stream = Connector::Plain.connect(listener_addr).await.unwrap();
        Connection::establish(listener_addr, stream, &ConnectionOptions::default(), None)
            .await
            .unwrap()
    }

    /// Fires `count` requests on `connection` without awaiting their
    /// (never-arriving) responses, so they remain in flight.
    fn hold_requests_in_flight(connection: &Connection, count: usize) {
        for _ in 0..count {
            let connection = connection.clone();
            tokio::spawn(async move {
                let _ = connection.send(Opcode::Query, BytesMut::new()).await;
            });
        }
    }

    #[tokio::test]
    async fn least_busy_returns_connection_with_fewest_in_flight_requests() {
        let mut connections = Vec::new();
        for inflight in [2usize, 5, 1] {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            let addr = listener.local_addr().unwrap();
            let server = tokio::spawn(async move { serve_handshake_then_stall(&listener).await });
            let connection = connect_one(addr).await;
            hold_requests_in_flight(&connection, inflight);
            connections.push((connection, server));
        }

        // Give the writer tasks time to dequeue the held requests and bump
        // `in_flight` before sampling it.
        tokio::time::sleep(Duration::from_millis(200)).await;

        let conns: Vec<Connection> = connections.iter().map(|(c, _)| c.clone()).collect();
        let pool = Pool::for_test("127.0.0.1:1".parse().unwrap(), conns);

        let chosen = pool.least_busy().expect("a connection is open");
        // The third dialed connection (1 in flight) must win; its address
        // is the only fact distinguishing it once selected.
        assert_eq!(chosen.address(), connections[2].0.address());

        for (connection, server) in connections {
            connection.close();
            server.abort();
        }
    }
}
