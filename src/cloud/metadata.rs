//! The cloud metadata service client: fetches the SNI proxy address and the
//! set of server-side ids reachable through it.

use std::{net::SocketAddr, time::Duration};

use serde::Deserialize;

use crate::error::{Error, ErrorKind, HttpError, Result};

use super::bundle::{resolve_host_port, CloudSecureBundle};

const SUPPORTED_VERSION: i64 = 1;
const DEFAULT_SNI_PROXY_PORT: u16 = 30443;
const METADATA_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Deserialize)]
struct MetadataResponse {
    version: i64,
    contact_info: ContactInfo,
}

#[derive(Debug, Deserialize)]
struct ContactInfo {
    local_dc: String,
    contact_points: Vec<String>,
    sni_proxy_address: String,
}

#[derive(Debug, Deserialize)]
struct ErrorResponse {
    #[serde(default)]
    message: Option<String>,
}

/// One SNI-routed contact point: the shared proxy address to dial, and the
/// per-host server id to present as SNI so the proxy forwards the connection
/// to the right backend node.
#[derive(Debug, Clone)]
pub(crate) struct CloudContactPoint {
    pub(crate) proxy_address: SocketAddr,
    pub(crate) server_id: String,
}

/// The resolved topology a cloud deployment bootstraps from: the local
/// datacenter every contact point belongs to, and the SNI-routed contact
/// points themselves.
#[derive(Debug, Clone)]
pub(crate) struct CloudTopology {
    pub(crate) local_dc: String,
    pub(crate) contact_points: Vec<CloudContactPoint>,
}

/// Fetches and parses `GET /metadata?version=1` from the bundle's metadata
/// service, authenticating with the bundle's client certificate.
pub(crate) async fn resolve(bundle: &CloudSecureBundle) -> Result<CloudTopology> {
    let client = build_client(bundle)?;
    let address = bundle.metadata_address().await?;
    let url = format!("https://{}:{}/metadata?version=1", bundle.config.host, address.port());

    let response = client
        .get(&url)
        .send()
        .await
        .map_err(|e| http_error_from_reqwest(&e))?;

    let status = response.status();
    let content_type = response
        .headers()
        .get(reqwest::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .to_string();

    let body = response.bytes().await.map_err(|e| http_error_from_reqwest(&e))?;

    if !status.is_success() {
        let message = serde_json::from_slice::<ErrorResponse>(&body)
            .ok()
            .and_then(|e| e.message)
            .unwrap_or_else(|| format!("metadata service returned status {status}"));
        return Err(Error::from(ErrorKind::Http(HttpError::HttpStatus {
            status: status.as_u16(),
            message,
        })));
    }

    if !content_type.contains("json") {
        return Err(Error::from(ErrorKind::Http(HttpError::Parsing {
            message: format!("expected a json response, got content-type '{content_type}'"),
        })));
    }

    let parsed: MetadataResponse = serde_json::from_slice(&body).map_err(|e| {
        Error::from(ErrorKind::Http(HttpError::Parsing {
            message: format!("failed to parse metadata response: {e}"),
        }))
    })?;

    if parsed.version != SUPPORTED_VERSION {
        return Err(Error::from(ErrorKind::Http(HttpError::UnsupportedMetadataVersion {
            version: parsed.version,
        })));
    }

    topology_from(parsed.contact_info).await
}

async fn topology_from(info: ContactInfo) -> Result<CloudTopology> {
    let (host, port) = split_host_port(&info.sni_proxy_address, DEFAULT_SNI_PROXY_PORT)?;
    let proxy_address = resolve_host_port(&host, port).await?;

    let contact_points = info
        .contact_points
        .into_iter()
        .map(|server_id| CloudContactPoint {
            proxy_address,
            server_id,
        })
        .collect();

    Ok(CloudTopology {
        local_dc: info.local_dc,
        contact_points,
    })
}

fn split_host_port(value: &str, default_port: u16) -> Result<(String, u16)> {
    match value.rsplit_once(':') {
        Some((host, port)) => {
            let port: u16 = port.parse().map_err(|_| {
                Error::from(ErrorKind::Http(HttpError::Parsing {
                    message: format!("invalid sni_proxy_address '{value}'"),
                }))
            })?;
            Ok((host.to_string(), port))
        }
        None => Ok((value.to_string(), default_port)),
    }
}

fn build_client(bundle: &CloudSecureBundle) -> Result<reqwest::Client> {
    let ca = reqwest::tls::Certificate::from_pem(&bundle.ca_cert).map_err(|e| {
        Error::from(ErrorKind::Http(HttpError::Socket {
            message: format!("invalid bundle CA certificate: {e}"),
        }))
    })?;

    let mut identity_pem = bundle.client_cert.clone();
    identity_pem.extend_from_slice(&bundle.client_key);
    let identity = reqwest::tls::Identity::from_pem(&identity_pem).map_err(|e| {
        Error::from(ErrorKind::Http(HttpError::Socket {
            message: format!("invalid bundle client identity: {e}"),
        }))
    })?;

    reqwest::Client::builder()
        .use_rustls_tls()
        .add_root_certificate(ca)
        .identity(identity)
        .timeout(METADATA_TIMEOUT)
        .build()
        .map_err(|e| {
            Error::from(ErrorKind::Http(HttpError::Socket {
                message: format!("failed to build metadata http client: {e}"),
            }))
        })
}

fn http_error_from_reqwest(err: &reqwest::Error) -> Error {
    if err.is_timeout() {
        Error::from(ErrorKind::Http(HttpError::Timeout))
    } else if err.is_connect() {
        Error::from(ErrorKind::Http(HttpError::Socket {
            message: err.to_string(),
        }))
    } else {
        Error::from(ErrorKind::Http(HttpError::Socket {
            message: err.to_string(),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_host_port_uses_default_when_absent() {
        let (host, port) = split_host_port("cloud.example", DEFAULT_SNI_PROXY_PORT).unwrap();
        assert_eq!(host, "cloud.example");
        assert_eq!(port, DEFAULT_SNI_PROXY_PORT);
    }

    #[test]
    fn split_host_port_parses_explicit_port() {
        let (host, port) = split_host_port("cloud.example:30002", DEFAULT_SNI_PROXY_PORT).unwrap();
        assert_eq!(host, "cloud.example");
        assert_eq!(port, 30002);
    }

    #[test]
    fn metadata_response_parses_seed_scenario() {
        let json = r#"{"version":1,"contact_info":{"type":"sni_proxy","local_dc":"dc1","contact_points":["276b1694-1","8c29f723-2","fb91d3ff-3"],"sni_proxy_address":"cloud.example:30002"}}"#;
        let parsed: MetadataResponse = serde_json::from_str(json).unwrap();
        assert_eq!(parsed.version, 1);
        assert_eq!(parsed.contact_info.local_dc, "dc1");
        assert_eq!(parsed.contact_info.contact_points.len(), 3);
        assert_eq!(parsed.contact_info.sni_proxy_address, "cloud.example:30002");
    }

    #[test]
    fn rejects_unsupported_version() {
        let json = r#"{"version":2,"contact_info":{"type":"sni_proxy","local_dc":"dc1","contact_points":[],"sni_proxy_address":"cloud.example:30002"}}"#;
        let parsed: MetadataResponse = serde_json::from_str(json).unwrap();
        assert_ne!(parsed.version, SUPPORTED_VERSION);
    }
}
