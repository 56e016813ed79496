//! Secure connect bundle loading: a ZIP archive containing the client
//! identity and trust material needed to reach a managed cluster through its
//! SNI proxy.

use std::{io::Read, net::SocketAddr, path::Path};

use serde::Deserialize;

use crate::{
    error::{Error, ErrorKind, HttpError, Result},
    runtime::AsyncResolver,
};

/// The parsed contents of `config.json`, the bundle member naming the
/// metadata service to contact and (optionally) the credentials to
/// authenticate with once connected.
#[derive(Debug, Clone, Deserialize)]
pub(crate) struct BundleConfig {
    pub(crate) host: String,
    pub(crate) port: u16,
    #[serde(default)]
    pub(crate) username: Option<String>,
    #[serde(default)]
    pub(crate) password: Option<String>,
}

/// A loaded secure connect bundle: the metadata service address plus the
/// PEM-encoded trust and identity material to build a [`crate::runtime::TlsConfig`]
/// from.
pub(crate) struct CloudSecureBundle {
    pub(crate) config: BundleConfig,
    pub(crate) ca_cert: Vec<u8>,
    pub(crate) client_cert: Vec<u8>,
    pub(crate) client_key: Vec<u8>,
}

impl CloudSecureBundle {
    /// Loads and unpacks a bundle from `path`. The archive must contain
    /// exactly `config.json`, `ca.crt`, `cert`, and `key`; any missing member
    /// is a fatal load error, per the bundle's documented format.
    pub(crate) fn load(path: &Path) -> Result<Self> {
        let file = std::fs::File::open(path)?;
        let mut archive = zip::ZipArchive::new(file).map_err(|e| bundle_error(path, &e))?;

        let config_bytes = read_member(&mut archive, path, "config.json")?;
        let config: BundleConfig = serde_json::from_slice(&config_bytes).map_err(|e| {
            bad_bundle(path, format!("failed to parse config.json: {e}"))
        })?;

        let ca_cert = read_member(&mut archive, path, "ca.crt")?;
        let client_cert = read_member(&mut archive, path, "cert")?;
        let client_key = read_member(&mut archive, path, "key")?;

        Ok(Self {
            config,
            ca_cert,
            client_cert,
            client_key,
        })
    }

    /// The address of the metadata service named in `config.json`, defaulting
    /// the port to 30443 when the bundle omits one (a zero port is treated
    /// as absent).
    pub(crate) async fn metadata_address(&self) -> Result<SocketAddr> {
        let port = if self.config.port == 0 { 30443 } else { self.config.port };
        resolve_host_port(&self.config.host, port).await
    }
}

/// Resolves `host:port` to a [`SocketAddr`] via the same DNS path ordinary
/// contact points use.
pub(crate) async fn resolve_host_port(host: &str, port: u16) -> Result<SocketAddr> {
    let resolver = AsyncResolver::new()?;
    let ip = resolver
        .resolve(host)
        .await?
        .into_iter()
        .next()
        .ok_or_else(|| {
            Error::from(ErrorKind::Http(HttpError::Socket {
                message: format!("could not resolve {host}:{port}"),
            }))
        })?;
    Ok(SocketAddr::new(ip, port))
}

fn read_member<R: std::io::Read + std::io::Seek>(
    archive: &mut zip::ZipArchive<R>,
    path: &Path,
    name: &str,
) -> Result<Vec<u8>> {
    let mut entry = archive
        .by_name(name)
        .map_err(|_| bad_bundle(path, format!("bundle is missing required member '{name}'")))?;
    let mut buf = Vec::with_capacity(usize::try_from(entry.size()).unwrap_or(0));
    entry
        .read_to_end(&mut buf)
        .map_err(|e| bad_bundle(path, format!("failed to read '{name}': {e}")))?;
    Ok(buf)
}

fn bundle_error(path: &Path, err: &zip::result::ZipError) -> Error {
    bad_bundle(path, format!("not a valid bundle archive: {err}"))
}

fn bad_bundle(path: &Path, message: String) -> Error {
    Error::bad_params(format!("{}: {message}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_json_parses_optional_credentials() {
        let json = r#"{"host":"cloud.example","port":30002}"#;
        let config: BundleConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.host, "cloud.example");
        assert_eq!(config.port, 30002);
        assert!(config.username.is_none());
        assert!(config.password.is_none());
    }

    #[test]
    fn config_json_parses_with_credentials() {
        let json = r#"{"host":"cloud.example","port":30002,"username":"u","password":"p"}"#;
        let config: BundleConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.username.as_deref(), Some("u"));
        assert_eq!(config.password.as_deref(), Some("p"));
    }
}
