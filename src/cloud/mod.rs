//! Secure connect bundle loading and cloud metadata resolution.
//!
//! A cloud deployment is reached through a single SNI-terminating proxy:
//! every node answers on the same `(ip, port)`, and the proxy picks the
//! backend purely from the TLS SNI name presented during the handshake. See
//! [`metadata::resolve`] for the wire contract and [`Connector::CloudTls`]
//! (in [`crate::pool::connector`]) for how that gets threaded into dialing.

mod bundle;
mod metadata;

use std::{
    collections::HashMap,
    hash::{Hash, Hasher},
    net::SocketAddr,
    path::Path,
    sync::{Arc, Mutex},
};

use rustls::pki_types::ServerName;

use crate::{
    error::Result,
    pool::connector::Connector,
    runtime::{PemMaterial, TlsConfig},
};

pub(crate) use bundle::CloudSecureBundle;
pub(crate) use metadata::{CloudContactPoint, CloudTopology};

/// Everything derived from a secure connect bundle: the TLS material to dial
/// with, and the initial contact set resolved from the metadata service.
pub(crate) struct CloudConfig {
    pub(crate) connector: Connector,
    /// Synthetic per-host addresses, one per contact point, to seed
    /// [`crate::cluster::ClusterOptions::contact_points`] with.
    pub(crate) contact_points: Vec<SocketAddr>,
    pub(crate) local_dc: String,
    pub(crate) credentials: Option<(String, String)>,
}

impl CloudConfig {
    /// Loads the bundle at `path`, fetches its metadata, and assembles a
    /// ready-to-use [`Connector::CloudTls`] plus contact point set.
    pub(crate) async fn resolve(path: &Path) -> Result<Self> {
        let bundle = CloudSecureBundle::load(path)?;
        let tls = TlsConfig::build_from_pem(PemMaterial {
            ca: Some(&bundle.ca_cert),
            cert: Some(&bundle.client_cert),
            key: Some(&bundle.client_key),
            allow_invalid_certs: false,
        })?;

        let topology = metadata::resolve(&bundle).await?;

        let mut sni_by_address = HashMap::with_capacity(topology.contact_points.len());
        let mut contact_points = Vec::with_capacity(topology.contact_points.len());
        let mut proxy_address = None;

        for point in &topology.contact_points {
            let synthetic = synthetic_address(point);
            let name = ServerName::try_from(point.server_id.clone()).map_err(|e| {
                crate::error::Error::bad_params(format!(
                    "cloud metadata returned an invalid server id '{}': {e}",
                    point.server_id
                ))
            })?;
            sni_by_address.insert(synthetic, name);
            contact_points.push(synthetic);
            proxy_address.get_or_insert(point.proxy_address);
        }

        let connector = Connector::CloudTls {
            config: tls,
            proxy_address: proxy_address
                .ok_or_else(|| crate::error::Error::bad_params("cloud metadata returned no contact points"))?,
            sni_by_address: Arc::new(Mutex::new(sni_by_address)),
        };

        let credentials = match (bundle.config.username.clone(), bundle.config.password.clone()) {
            (Some(user), Some(pass)) => Some((user, pass)),
            _ => None,
        };

        Ok(Self {
            connector,
            contact_points,
            local_dc: topology.local_dc,
            credentials,
        })
    }
}

/// Derives a stable synthetic `SocketAddr` for a cloud contact point: the
/// real proxy IP (never dialed through this address directly — see
/// `Connector::CloudTls`) with a port hashed from the server id, so distinct
/// backends get distinct map keys despite sharing one routable endpoint.
/// Collisions are possible in principle but vanishingly unlikely for the
/// handful of nodes a single cluster's metadata enumerates.
#[allow(clippy::cast_possible_truncation)] // bounded by the modulus below, always < u16::MAX
fn synthetic_address(point: &CloudContactPoint) -> SocketAddr {
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    point.server_id.hash(&mut hasher);
    let port = (1024 + hasher.finish() % (u16::MAX as u64 - 1024)) as u16;
    SocketAddr::new(point.proxy_address.ip(), port)
}
