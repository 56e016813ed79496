//! The public configuration surface: a [`ClusterConfig`] assembles contact
//! points, timeouts, TLS/cloud material, and policy composition into the
//! pieces [`crate::Session::connect`] hands to the cluster, pool, and
//! execution layers.

use std::{net::SocketAddr, path::PathBuf, sync::Arc, time::Duration};

use typed_builder::TypedBuilder;

use crate::{
    cloud::CloudConfig,
    cluster::ClusterOptions,
    compression,
    error::Result,
    policy::{
        load_balancing::RoundRobinPolicy, reconnection::ExponentialReconnectionPolicy,
        retry::DefaultRetryPolicy, speculative::NoSpeculativeExecution,
        timestamp::ServerSideTimestamps, LoadBalancingPolicy, ReconnectionPolicy, RetryPolicy,
        SpeculativeExecutionPolicy, TimestampGenerator,
    },
    pool::{
        connector::Connector,
        options::{ConnectionOptions, Credentials},
    },
    runtime::{AsyncResolver, TlsConfig, TlsMaterial},
};

/// TLS trust and identity material for a manually-configured (non-cloud)
/// connection. Mutually exclusive with [`ClusterConfig::cloud_secure_bundle`].
#[derive(Clone, Debug, Default, TypedBuilder)]
#[builder(field_defaults(default, setter(into)))]
pub struct TlsOptions {
    /// PEM file of trusted CA certificates. Falls back to the bundled
    /// Mozilla root store when absent.
    #[builder(setter(strip_option))]
    pub trusted_certs_path: Option<PathBuf>,
    /// PEM file of the client certificate chain, for mutual TLS.
    #[builder(setter(strip_option))]
    pub cert_path: Option<PathBuf>,
    /// PEM file of the client private key, for mutual TLS.
    #[builder(setter(strip_option))]
    pub key_path: Option<PathBuf>,
    /// Skip certificate validation entirely. Never enable this outside
    /// local development.
    pub allow_invalid_certs: bool,
}

/// Everything the application can configure before calling
/// [`crate::Session::connect`], mirroring the enumerated configuration
/// surface of the original driver's `Cluster` builder.
#[derive(Clone, TypedBuilder)]
#[builder(field_defaults(default))]
pub struct ClusterConfig {
    /// Hostnames or IP literals to bootstrap the control connection from.
    /// Ignored (and must be empty) when `cloud_secure_bundle` is set.
    #[builder(default, setter(into))]
    pub contact_points: Vec<String>,
    /// The native-protocol port contact points and discovered peers are
    /// assumed to listen on.
    #[builder(default = 9042)]
    pub port: u16,
    /// The CQL native protocol version to negotiate at `STARTUP`.
    #[builder(default = crate::protocol::DEFAULT_PROTOCOL_VERSION)]
    pub protocol_version: u8,
    /// Shuffles the resolved contact point list before the first connection
    /// attempt, so a fleet of identical clients doesn't all hammer the same
    /// host first.
    #[builder(default)]
    pub use_randomized_contact_points: bool,

    /// Timeout for establishing a single connection's TCP/TLS/handshake
    /// sequence.
    #[builder(default = Duration::from_secs(5))]
    pub connect_timeout: Duration,
    /// Timeout for an individual request, enforced by the execution engine
    /// independent of any per-connection heartbeat.
    #[builder(default = Duration::from_secs(12))]
    pub request_timeout: Duration,
    /// Interval between `OPTIONS` heartbeats sent on idle connections.
    #[builder(default = Duration::from_secs(30))]
    pub heartbeat_interval: Duration,
    /// How long a connection may sit with no in-flight requests before the
    /// pool considers recycling it.
    #[builder(default = Duration::from_secs(60))]
    pub idle_timeout: Duration,

    /// Connections kept open per host per pool.
    #[builder(default = 2)]
    pub core_connections_per_host: usize,

    /// Plain-text username/password credentials. Mutually exclusive with a
    /// custom SASL provider, which this core does not implement.
    #[builder(default, setter(strip_option))]
    pub credentials: Option<Credentials>,

    /// Manual TLS configuration. Mutually exclusive with `cloud_secure_bundle`.
    #[builder(default, setter(strip_option))]
    pub tls: Option<TlsOptions>,
    /// Path to a cloud secure connect bundle. Mutually exclusive with
    /// `contact_points` and `tls`.
    #[builder(default, setter(into, strip_option))]
    pub cloud_secure_bundle: Option<PathBuf>,

    /// The frame-body compression algorithm to negotiate, if any.
    #[builder(default, setter(strip_option))]
    pub compression: Option<compression::Algorithm>,

    /// Schedules delays between reconnection attempts (both per-host pools
    /// and the control connection).
    #[builder(default_code = "Arc::new(ExponentialReconnectionPolicy::new(Duration::from_millis(100), Duration::from_secs(30)))")]
    pub reconnection_policy: Arc<dyn ReconnectionPolicy>,
    /// Decides whether a failed request is retried, and at what consistency.
    #[builder(default_code = "Arc::new(DefaultRetryPolicy)")]
    pub retry_policy: Arc<dyn RetryPolicy>,
    /// Orders candidate hosts for each request. Composed with
    /// `TokenAwarePolicy`/`LatencyAwarePolicy`/whitelist-blacklist wrappers
    /// by constructing the desired chain directly and passing it here.
    #[builder(default_code = "Arc::new(RoundRobinPolicy::new())")]
    pub load_balancing_policy: Arc<dyn LoadBalancingPolicy>,
    /// Governs whether and when a second host is raced against the first
    /// for idempotent requests.
    #[builder(default_code = "Arc::new(NoSpeculativeExecution)")]
    pub speculative_execution_policy: Arc<dyn SpeculativeExecutionPolicy>,
    /// Attaches (or withholds) a client-side write timestamp.
    #[builder(default_code = "Arc::new(ServerSideTimestamps)")]
    pub timestamp_generator: Arc<dyn TimestampGenerator>,

    /// Re-prepares cached statements on a host that comes back `UP` or is
    /// newly `ADD`ed.
    #[builder(default = true)]
    pub prepare_on_up_or_add_host: bool,
    /// Whether a `STATUS_CHANGE DOWN` control-connection event marks a host
    /// down immediately, instead of waiting for its pool to observe the
    /// failure directly.
    #[builder(default)]
    pub treat_status_change_down_as_hint: bool,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        ClusterConfig::builder().build()
    }
}

/// Everything [`ClusterConfig::resolve`] produces: the pieces `Session`
/// hands to [`crate::cluster::Cluster`] and [`crate::pool::PoolManager`].
pub(crate) struct ResolvedConfig {
    pub(crate) cluster_options: ClusterOptions,
    pub(crate) connector: Connector,
    pub(crate) connection_options: ConnectionOptions,
    pub(crate) core_connections_per_host: usize,
    pub(crate) reconnection_policy: Arc<dyn ReconnectionPolicy>,
    pub(crate) load_balancing_policy: Arc<dyn LoadBalancingPolicy>,
    pub(crate) retry_policy: Arc<dyn RetryPolicy>,
    pub(crate) speculative_execution_policy: Arc<dyn SpeculativeExecutionPolicy>,
    pub(crate) timestamp_generator: Arc<dyn TimestampGenerator>,
    pub(crate) request_timeout: Duration,
    pub(crate) prepare_on_up_or_add_host: bool,
}

impl ClusterConfig {
    /// Validates that manual contact points/TLS and a cloud secure bundle
    /// aren't both configured, resolves contact points (DNS or cloud
    /// metadata), builds the TLS/cloud connector, and assembles everything
    /// downstream construction needs.
    pub(crate) async fn resolve(&self) -> Result<ResolvedConfig> {
        let has_manual_contact_points = !self.contact_points.is_empty();
        let has_manual_tls = self.tls.is_some();
        if self.cloud_secure_bundle.is_some() && (has_manual_contact_points || has_manual_tls) {
            return Err(crate::error::Error::bad_params(
                "cloud_secure_bundle is exclusive with contact_points and tls; configure only one",
            ));
        }

        let connection_options = ConnectionOptions {
            protocol_version: self.protocol_version,
            compression: self.compression,
            credentials: self.credentials.clone(),
            keyspace: None,
            connect_timeout: self.connect_timeout,
            heartbeat_interval: self.heartbeat_interval,
            idle_timeout: self.idle_timeout,
            register_event_types: Vec::new(),
        };

        let (connector, contact_points, local_dc, credentials) = match &self.cloud_secure_bundle {
            Some(path) => {
                let cloud = CloudConfig::resolve(path).await?;
                let credentials = cloud.credentials.clone().map(|(username, password)| Credentials {
                    username,
                    password,
                });
                (cloud.connector, cloud.contact_points, Some(cloud.local_dc), credentials)
            }
            None => {
                let connector = self.build_manual_connector()?;
                let contact_points = self.resolve_manual_contact_points().await?;
                (connector, contact_points, None, None)
            }
        };

        let mut connection_options = connection_options;
        if connection_options.credentials.is_none() {
            connection_options.credentials = credentials;
        }

        let mut load_balancing_policy = self.load_balancing_policy.clone();
        if let Some(local_dc) = local_dc {
            load_balancing_policy = Arc::new(crate::policy::load_balancing::DcAwarePolicy::new(local_dc, 0));
        }

        let cluster_options = ClusterOptions {
            contact_points: contact_points.clone(),
            connector: connector.clone(),
            connection_options: connection_options.clone(),
            native_port: self.port,
            load_balancing: load_balancing_policy.clone(),
            reconnection: self.reconnection_policy.clone(),
            listener: Arc::new(crate::cluster::NoopClusterEventListener),
            prepare_host_handler: Arc::new(crate::cluster::NoopPrepareHostHandler),
            treat_status_change_down_as_hint: self.treat_status_change_down_as_hint,
        };

        Ok(ResolvedConfig {
            cluster_options,
            connector,
            connection_options,
            core_connections_per_host: self.core_connections_per_host,
            reconnection_policy: self.reconnection_policy.clone(),
            load_balancing_policy,
            retry_policy: self.retry_policy.clone(),
            speculative_execution_policy: self.speculative_execution_policy.clone(),
            timestamp_generator: self.timestamp_generator.clone(),
            request_timeout: self.request_timeout,
            prepare_on_up_or_add_host: self.prepare_on_up_or_add_host,
        })
    }

    fn build_manual_connector(&self) -> Result<Connector> {
        match &self.tls {
            None => Ok(Connector::Plain),
            Some(tls) => {
                let config = TlsConfig::build(TlsMaterial {
                    ca_file_path: tls.trusted_certs_path.as_deref(),
                    cert_file_path: tls.cert_path.as_deref(),
                    key_file_path: tls.key_path.as_deref(),
                    allow_invalid_certs: tls.allow_invalid_certs,
                })?;
                Ok(Connector::Tls {
                    config,
                    sni: Connector::ip_sni(),
                })
            }
        }
    }

    async fn resolve_manual_contact_points(&self) -> Result<Vec<SocketAddr>> {
        let resolver = AsyncResolver::new()?;
        let mut addresses = Vec::with_capacity(self.contact_points.len());
        for host in &self.contact_points {
            for ip in resolver.resolve(host).await? {
                addresses.push(SocketAddr::new(ip, self.port));
            }
        }
        if self.use_randomized_contact_points {
            use rand::seq::SliceRandom;
            addresses.shuffle(&mut rand::rng());
        }
        Ok(addresses)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_has_no_contact_points_and_default_port() {
        let config = ClusterConfig::default();
        assert!(config.contact_points.is_empty());
        assert_eq!(config.port, 9042);
        assert_eq!(config.core_connections_per_host, 2);
    }

    #[tokio::test]
    async fn cloud_and_manual_contact_points_are_exclusive() {
        let config = ClusterConfig::builder()
            .contact_points(vec!["127.0.0.1".to_string()])
            .cloud_secure_bundle(PathBuf::from("/tmp/does-not-matter.zip"))
            .build();
        let err = config.resolve().await.unwrap_err();
        assert!(matches!(
            err.kind.as_ref(),
            crate::error::ErrorKind::Library(crate::error::LibraryError::BadParams { .. })
        ));
    }

    #[tokio::test]
    async fn cloud_and_manual_tls_are_exclusive() {
        let config = ClusterConfig::builder()
            .tls(TlsOptions::builder().allow_invalid_certs(true).build())
            .cloud_secure_bundle(PathBuf::from("/tmp/does-not-matter.zip"))
            .build();
        let err = config.resolve().await.unwrap_err();
        assert!(matches!(
            err.kind.as_ref(),
            crate::error::ErrorKind::Library(crate::error::LibraryError::BadParams { .. })
        ));
    }
}
