//! TLS context construction and hostname verification.
//!
//! Verification delegates chain/signature/expiry checks to rustls's own
//! webpki-based verifier, which already matches the presented
//! `ServerName` against SAN entries (both `IPADDR` and `DNS`, including
//! RFC 6125 wildcards). The one behavior rustls deliberately omits —
//! falling back to the certificate's Common Name when no SAN extension is
//! present at all — is implemented here as a narrow post-check, since that
//! fallback is explicitly required and no SAN-absent cert should otherwise
//! be accepted.

use std::{
    io::BufReader,
    path::Path,
    sync::{Arc, OnceLock},
};

use rustls::{
    client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier},
    client::WebPkiServerVerifier,
    pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime},
    ClientConfig, DigitallySignedStruct, RootCertStore, SignatureScheme,
};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;

use crate::error::{Error, ErrorKind, Result, SslError};

static CRYPTO_PROVIDER_INIT: OnceLock<()> = OnceLock::new();

/// Installs the process-wide rustls crypto provider exactly once. Safe to
/// call repeatedly; only the first call has any effect. Per the design
/// notes, TLS library initialization is modeled as a process-wide one-shot
/// rather than per-connection state.
pub(crate) fn ensure_crypto_provider_installed() {
    CRYPTO_PROVIDER_INIT.get_or_init(|| {
        let _ = rustls::crypto::ring::default_provider().install_default();
    });
}

/// Certificate/key material and verification policy for one cluster's TLS
/// connections. Expensive to build; constructed once by the pool manager
/// and shared across every connection.
#[derive(Clone)]
pub struct TlsConfig {
    connector: TlsConnector,
}

/// The subset of [`crate::options::TlsOptions`] needed to build a
/// [`TlsConfig`], expressed independently to keep this module decoupled
/// from the configuration surface's builder types.
pub struct TlsMaterial<'a> {
    /// PEM file containing one or more trusted CA certificates. Falls
    /// back to the bundled Mozilla root store when absent.
    pub ca_file_path: Option<&'a Path>,
    /// PEM file containing the client certificate chain, for mutual TLS.
    pub cert_file_path: Option<&'a Path>,
    /// PEM file containing the client private key, for mutual TLS.
    pub key_file_path: Option<&'a Path>,
    /// Skip all certificate validation. Only ever set for local
    /// development; never enabled by default.
    pub allow_invalid_certs: bool,
}

/// Same material as [`TlsMaterial`], but already read into memory. Used by
/// the cloud secure-bundle loader, whose certificate/key members are ZIP
/// entries rather than standalone files.
pub struct PemMaterial<'a> {
    /// PEM bytes of one or more trusted CA certificates.
    pub ca: Option<&'a [u8]>,
    /// PEM bytes of the client certificate chain, for mutual TLS.
    pub cert: Option<&'a [u8]>,
    /// PEM bytes of the client private key, for mutual TLS.
    pub key: Option<&'a [u8]>,
    /// Skip all certificate validation. Only ever set for local
    /// development; never enabled by default.
    pub allow_invalid_certs: bool,
}

impl TlsConfig {
    /// Builds a [`TlsConfig`] from PEM-encoded trust and identity material
    /// read from disk.
    pub fn build(material: TlsMaterial<'_>) -> Result<Self> {
        let ca = material.ca_file_path.map(|p| std::fs::read(p)).transpose()?;
        let cert = material
            .cert_file_path
            .map(|p| std::fs::read(p))
            .transpose()?;
        let key = material
            .key_file_path
            .map(|p| std::fs::read(p))
            .transpose()?;
        Self::build_from_pem(PemMaterial {
            ca: ca.as_deref(),
            cert: cert.as_deref(),
            key: key.as_deref(),
            allow_invalid_certs: material.allow_invalid_certs,
        })
    }

    /// Builds a [`TlsConfig`] from PEM bytes already held in memory, used by
    /// the cloud secure-bundle loader (whose `ca.crt`/`cert`/`key` members
    /// come from a ZIP archive, not the filesystem).
    pub fn build_from_pem(material: PemMaterial<'_>) -> Result<Self> {
        ensure_crypto_provider_installed();

        let mut roots = RootCertStore::empty();
        match material.ca {
            Some(pem) => {
                for cert in parse_certs(pem)? {
                    roots.add(cert).map_err(|e| {
                        tls_error(SslError::InvalidCert {
                            message: format!("rejected root certificate: {e}"),
                        })
                    })?;
                }
            }
            None => {
                roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
            }
        }

        let verifier: Arc<dyn ServerCertVerifier> = if material.allow_invalid_certs {
            Arc::new(AcceptAnyServerCert)
        } else {
            let default_verifier = WebPkiServerVerifier::builder(Arc::new(roots))
                .build()
                .map_err(|e| {
                    tls_error(SslError::ProtocolError {
                        message: format!("failed to build certificate verifier: {e}"),
                    })
                })?;
            Arc::new(HostnameFallbackVerifier { default_verifier })
        };
        let builder = ClientConfig::builder()
            .dangerous()
            .with_custom_certificate_verifier(verifier);

        let config = match (material.cert, material.key) {
            (Some(cert_pem), Some(key_pem)) => {
                let certs = parse_certs(cert_pem)?;
                let key = parse_private_key(key_pem)?;
                builder.with_client_auth_cert(certs, key).map_err(|e| {
                    tls_error(SslError::InvalidPrivateKey {
                        message: e.to_string(),
                    })
                })?
            }
            _ => builder.with_no_client_auth(),
        };

        Ok(TlsConfig {
            connector: TlsConnector::from(Arc::new(config)),
        })
    }

    /// Performs a TLS client handshake over an already-connected TCP
    /// stream, verifying the peer against `verify_name` (the SNI/hostname
    /// to present and validate against, which for cloud deployments is the
    /// per-host server-id rather than the IP actually dialed).
    pub async fn connect(
        &self,
        verify_name: ServerName<'static>,
        tcp: TcpStream,
    ) -> Result<tokio_rustls::client::TlsStream<TcpStream>> {
        self.connector.connect(verify_name, tcp).await.map_err(|e| {
            tls_error(SslError::ProtocolError {
                message: format!("tls handshake failed: {e}"),
            })
            .with_source(e.into())
        })
    }
}

fn parse_certs(pem: &[u8]) -> Result<Vec<CertificateDer<'static>>> {
    let mut reader = BufReader::new(pem);
    rustls_pemfile::certs(&mut reader)
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| {
            tls_error(SslError::InvalidCert {
                message: format!("failed to parse certificate PEM: {e}"),
            })
        })
}

fn parse_private_key(pem: &[u8]) -> Result<PrivateKeyDer<'static>> {
    let mut reader = BufReader::new(pem);
    rustls_pemfile::private_key(&mut reader)
        .map_err(|e| {
            tls_error(SslError::InvalidPrivateKey {
                message: format!("failed to parse private key PEM: {e}"),
            })
        })?
        .ok_or_else(|| {
            tls_error(SslError::InvalidPrivateKey {
                message: "no private key found in PEM".to_string(),
            })
        })
}

fn tls_error(kind: SslError) -> Error {
    ErrorKind::Ssl(kind).into()
}

/// Delegates to rustls's webpki verifier, but additionally accepts a
/// certificate with no SAN extension at all if its Subject Common Name
/// matches the requested server name exactly. This mirrors the original
/// driver's legacy CN-fallback behavior; rustls's own verifier refuses
/// this deliberately and would otherwise reject such a certificate with no
/// way to opt back in short of disabling verification altogether.
#[derive(Debug)]
struct HostnameFallbackVerifier {
    default_verifier: Arc<WebPkiServerVerifier>,
}

impl ServerCertVerifier for HostnameFallbackVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        server_name: &ServerName<'_>,
        ocsp_response: &[u8],
        now: UnixTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        match self.default_verifier.verify_server_cert(
            end_entity,
            intermediates,
            server_name,
            ocsp_response,
            now,
        ) {
            Ok(verified) => Ok(verified),
            Err(rustls::Error::InvalidCertificate(cert_err))
                if matches!(
                    cert_err,
                    rustls::CertificateError::NotValidForName
                        | rustls::CertificateError::NotValidForNameContext { .. }
                ) =>
            {
                if cn_fallback::has_no_san(end_entity)
                    && cn_fallback::common_name_matches(end_entity, server_name)
                {
                    Ok(ServerCertVerified::assertion())
                } else {
                    Err(rustls::Error::InvalidCertificate(cert_err))
                }
            }
            Err(other) => Err(other),
        }
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        self.default_verifier.verify_tls12_signature(message, cert, dss)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        self.default_verifier.verify_tls13_signature(message, cert, dss)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.default_verifier.supported_verify_schemes()
    }
}

#[derive(Debug)]
struct AcceptAnyServerCert;

impl ServerCertVerifier for AcceptAnyServerCert {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        vec![
            SignatureScheme::RSA_PKCS1_SHA256,
            SignatureScheme::RSA_PKCS1_SHA384,
            SignatureScheme::RSA_PKCS1_SHA512,
            SignatureScheme::ECDSA_NISTP256_SHA256,
            SignatureScheme::ECDSA_NISTP384_SHA384,
            SignatureScheme::ED25519,
            SignatureScheme::RSA_PSS_SHA256,
            SignatureScheme::RSA_PSS_SHA384,
            SignatureScheme::RSA_PSS_SHA512,
        ]
    }
}

/// Minimal DER scanning for the two fields the CN fallback needs. This is
/// deliberately not a general X.509 parser: it only detects the presence
/// of the subjectAltName extension (OID 2.5.29.17) and extracts a
/// commonName (OID 2.5.4.3) attribute value from the Subject, which is all
/// the fallback in [`HostnameFallbackVerifier`] requires.
mod cn_fallback {
    use rustls::pki_types::{CertificateDer, ServerName};

    const OID_SUBJECT_ALT_NAME: [u8; 3] = [0x55, 0x1d, 0x11];
    const OID_COMMON_NAME: [u8; 3] = [0x55, 0x04, 0x03];

    pub(super) fn has_no_san(cert: &CertificateDer<'_>) -> bool {
        !contains_oid(cert.as_ref(), &OID_SUBJECT_ALT_NAME)
    }

    pub(super) fn common_name_matches(cert: &CertificateDer<'_>, name: &ServerName<'_>) -> bool {
        let expected = match name {
            ServerName::DnsName(dns) => dns.as_ref(),
            _ => return false,
        };
        extract_common_name(cert.as_ref())
            .map(|cn| cn.eq_ignore_ascii_case(expected))
            .unwrap_or(false)
    }

    fn contains_oid(der: &[u8], oid: &[u8]) -> bool {
        der.windows(oid.len()).any(|window| window == oid)
    }

    /// Finds the byte sequence for the commonName OID and reads the
    /// following ASN.1 string value (PrintableString, UTF8String, or
    /// IA5String), which in a standard DER-encoded Name immediately follows
    /// the OID as the AttributeValue of that RDN.
    fn extract_common_name(der: &[u8]) -> Option<&str> {
        let oid_pos = der
            .windows(OID_COMMON_NAME.len())
            .position(|window| window == OID_COMMON_NAME)?;
        let after_oid = oid_pos + OID_COMMON_NAME.len();
        let tag = *der.get(after_oid)?;
        if !matches!(tag, 0x0c | 0x13 | 0x16) {
            return None;
        }
        let len = *der.get(after_oid + 1)? as usize;
        let start = after_oid + 2;
        let end = start.checked_add(len)?;
        let bytes = der.get(start..end)?;
        std::str::from_utf8(bytes).ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn crypto_provider_install_is_idempotent() {
        ensure_crypto_provider_installed();
        ensure_crypto_provider_installed();
    }

    /// A cert presenting only an `IPADDR` SAN is rustls's problem, not ours:
    /// `WebPkiServerVerifier` already matches `ServerName::IpAddress` against
    /// `subjectAltName` entries, so `HostnameFallbackVerifier` only needs to
    /// stay out of the way (it only intercepts `NotValidForName`-class
    /// failures, and only then checks for a SAN extension at all). These
    /// tests cover the narrow CN-fallback scanning this module actually adds.
    fn der_with_common_name(cn: &str, include_san: bool) -> Vec<u8> {
        const OID_COMMON_NAME: [u8; 3] = [0x55, 0x04, 0x03];
        const OID_SUBJECT_ALT_NAME: [u8; 3] = [0x55, 0x1d, 0x11];

        let mut der = vec![0x30, 0x00]; // arbitrary leading SEQUENCE tag/len filler
        der.extend_from_slice(&OID_COMMON_NAME);
        der.push(0x0c); // UTF8String tag
        der.push(cn.len() as u8);
        der.extend_from_slice(cn.as_bytes());
        if include_san {
            der.extend_from_slice(&OID_SUBJECT_ALT_NAME);
        }
        der
    }

    #[test]
    fn common_name_extracted_and_matched_when_san_absent() {
        let der = der_with_common_name("cassandra.example.com", false);
        let cert = CertificateDer::from(der);
        assert!(cn_fallback::has_no_san(&cert));

        let name = ServerName::try_from("cassandra.example.com").unwrap();
        assert!(cn_fallback::common_name_matches(&cert, &name));

        let wrong_name = ServerName::try_from("other.example.com").unwrap();
        assert!(!cn_fallback::common_name_matches(&cert, &wrong_name));
    }

    #[test]
    fn san_presence_disables_the_fallback_path() {
        let der = der_with_common_name("cassandra.example.com", true);
        let cert = CertificateDer::from(der);
        assert!(!cn_fallback::has_no_san(&cert));
    }
}
