//! DNS resolution of hostname contact points to IP addresses.

use std::net::IpAddr;

use hickory_resolver::{
    config::ResolverConfig, name_server::TokioConnectionProvider, Resolver,
};

use crate::error::{Error, ErrorKind, LibraryError, Result};

/// Resolves hostname contact points supplied in [`crate::options::ClusterConfig`]
/// to concrete IP addresses before the first connection attempt.
pub(crate) struct AsyncResolver {
    resolver: Resolver<TokioConnectionProvider>,
}

impl AsyncResolver {
    /// Builds a resolver using the system's configured nameservers.
    pub(crate) fn new() -> Result<Self> {
        let resolver = Resolver::builder_with_config(
            ResolverConfig::default(),
            TokioConnectionProvider::default(),
        )
        .build();
        Ok(Self { resolver })
    }

    /// Resolves a hostname to its IP addresses. If `host` already parses as
    /// an IP address literal, it is returned as-is without a DNS query.
    pub(crate) async fn resolve(&self, host: &str) -> Result<Vec<IpAddr>> {
        if let Ok(ip) = host.parse::<IpAddr>() {
            return Ok(vec![ip]);
        }
        let lookup = self.resolver.lookup_ip(host).await.map_err(|e| {
            Error::from(ErrorKind::Library(LibraryError::UnableToInit {
                message: format!("failed to resolve contact point {host}: {e}"),
            }))
        })?;
        Ok(lookup.iter().collect())
    }
}
