//! The async I/O substrate: TCP/TLS connection establishment, DNS
//! resolution, background task spawning, and timeout helpers. Everything
//! above this module talks to [`stream::AsyncStream`], never to `tokio`
//! directly, so the transport can be swapped without touching connection
//! or pool logic.

mod interval;
mod join_handle;
mod resolver;
mod stream;
pub(crate) mod tls;

use std::{future::Future, net::SocketAddr, time::Duration};

use rustls::pki_types::ServerName;
use tokio::net::TcpStream;

pub(crate) use interval::Interval;
pub(crate) use join_handle::AsyncJoinHandle;
pub(crate) use resolver::AsyncResolver;
pub(crate) use stream::AsyncStream;
pub(crate) use tls::{PemMaterial, TlsConfig, TlsMaterial};

use crate::error::{Error, ErrorKind, Result};

/// Opens a plaintext TCP connection to `addr`, disabling Nagle's algorithm
/// since every request is latency-sensitive request/response traffic.
pub(crate) async fn connect_tcp(addr: SocketAddr) -> Result<AsyncStream> {
    let stream = TcpStream::connect(addr).await?;
    stream.set_nodelay(true)?;
    Ok(AsyncStream::Tcp(stream))
}

/// Opens a TCP connection to `addr` and performs a TLS handshake over it,
/// verifying the peer against `verify_name` (which may differ from `addr`
/// for SNI-routed cloud deployments).
pub(crate) async fn connect_tls(
    addr: SocketAddr,
    verify_name: ServerName<'static>,
    tls: &TlsConfig,
) -> Result<AsyncStream> {
    let tcp = TcpStream::connect(addr).await?;
    tcp.set_nodelay(true)?;
    let tls_stream = tls.connect(verify_name, tcp).await?;
    Ok(AsyncStream::Tls(Box::new(tls_stream)))
}

/// Spawns a future onto the tokio runtime as a detached background task.
pub(crate) fn spawn<F>(future: F) -> AsyncJoinHandle<F::Output>
where
    F: Future + Send + 'static,
    F::Output: Send + 'static,
{
    AsyncJoinHandle::spawn(future)
}

/// Suspends the current task for `duration`, used for reconnection backoff
/// delays.
pub(crate) async fn sleep(duration: Duration) {
    tokio::time::sleep(duration).await;
}

/// Races `future` against a deadline, returning [`ErrorKind::Timeout`] if
/// the deadline elapses first.
pub(crate) async fn with_timeout<F>(duration: Duration, future: F) -> Result<F::Output>
where
    F: Future,
{
    tokio::time::timeout(duration, future)
        .await
        .map_err(|_| Error::from(ErrorKind::Timeout(duration)))
}
