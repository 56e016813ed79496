//! How a pool or the cluster turns a bare [`SocketAddr`] into an
//! [`AsyncStream`], shared so both go through the identical TCP/TLS path.

use std::{
    collections::HashMap,
    net::SocketAddr,
    sync::{Arc, Mutex},
};

use rustls::pki_types::ServerName;

use crate::{error::Result, runtime, runtime::AsyncStream, runtime::TlsConfig};

/// Derives the name to verify (and, for TLS, to present via SNI) for a
/// given address. Plain cloud deployments verify the dialed IP; SNI-proxy
/// cloud deployments verify a per-host server id distinct from the address
/// actually dialed.
pub(crate) type SniResolver = Arc<dyn Fn(SocketAddr) -> ServerName<'static> + Send + Sync>;

/// How to establish a transport connection to a host.
#[derive(Clone)]
pub(crate) enum Connector {
    /// Plain TCP, no TLS.
    Plain,
    /// TLS, verifying the peer against whatever `sni` resolves the address
    /// to.
    Tls { config: TlsConfig, sni: SniResolver },
    /// TLS through an SNI proxy: every dial goes to the same physical
    /// `proxy_address`, and the SNI presented during the handshake selects
    /// which backend node the proxy forwards the connection to. Since every
    /// cloud host shares one routable address, hosts are told apart in the
    /// rest of this core by a synthetic per-host `SocketAddr` (see
    /// `cloud::topology`) that exists only as a map key; this variant
    /// translates that synthetic key back to the real dial target and the
    /// server id to present as SNI.
    CloudTls {
        config: TlsConfig,
        proxy_address: SocketAddr,
        sni_by_address: Arc<Mutex<HashMap<SocketAddr, ServerName<'static>>>>,
    },
}

impl Connector {
    /// The default SNI resolver for non-cloud TLS: verify the address's own
    /// IP.
    pub(crate) fn ip_sni() -> SniResolver {
        Arc::new(|addr: SocketAddr| ServerName::IpAddress(addr.ip().into()))
    }

    pub(crate) async fn connect(&self, address: SocketAddr) -> Result<AsyncStream> {
        match self {
            Connector::Plain => runtime::connect_tcp(address).await,
            Connector::Tls { config, sni } => {
                runtime::connect_tls(address, sni(address), config).await
            }
            Connector::CloudTls {
                config,
                proxy_address,
                sni_by_address,
            } => {
                let name = sni_by_address
                    .lock()
                    .unwrap()
                    .get(&address)
                    .cloned()
                    .unwrap_or_else(|| ServerName::IpAddress(proxy_address.ip().into()));
                runtime::connect_tls(*proxy_address, name, config).await
            }
        }
    }
}
