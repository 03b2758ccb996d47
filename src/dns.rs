//! Hostname resolution for seed and manual endpoints.

use std::net::{IpAddr, SocketAddr};

use trust_dns_resolver::config::{ResolverConfig, ResolverOpts};
use trust_dns_resolver::TokioAsyncResolver;

use crate::error::{P2pError, P2pResult};

/// Async resolver for `host:port` endpoints.
pub struct Resolver {
    resolver: TokioAsyncResolver,
}

impl Resolver {
    /// Create a resolver using the system configuration defaults.
    pub fn new() -> Self {
        let resolver =
            TokioAsyncResolver::tokio(ResolverConfig::default(), ResolverOpts::default());
        Self { resolver }
    }

    /// Resolve a hostname (or textual IP) to socket addresses.
    pub async fn resolve(&self, host: &str, port: u16) -> P2pResult<Vec<SocketAddr>> {
        // Literal IPs skip the resolver entirely.
        if let Ok(ip) = host.parse::<IpAddr>() {
            return Ok(vec![SocketAddr::new(ip, port)]);
        }

        let response = self.resolver.lookup_ip(host).await.map_err(|e| {
            P2pError::OperationFailed(format!("resolving {}: {}", host, e))
        })?;

        let mut addrs: Vec<SocketAddr> = response
            .iter()
            .map(|ip| SocketAddr::new(ip, port))
            .collect();
        addrs.sort();
        addrs.dedup();

        if addrs.is_empty() {
            return Err(P2pError::AddressNotFound);
        }

        tracing::debug!(host, count = addrs.len(), "resolved endpoint");
        Ok(addrs)
    }
}

impl Default for Resolver {
    fn default() -> Self {
        Self::new()
    }
}
