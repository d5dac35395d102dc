use std::net::IpAddr;

use anyhow::{anyhow, Result};
use hickory_resolver::config::{NameServerConfigGroup, ResolverConfig, ResolverOpts};
use hickory_resolver::TokioAsyncResolver;
use tracing::debug;

/// Resolver pinned to an external nameserver.
///
/// Passthrough dials must not consult local name resolution: the hosts file
/// has been pointed at loopback, and resolving the platform through it would
/// loop the proxy back into itself.
pub struct BypassResolver {
    inner: TokioAsyncResolver,
}

impl BypassResolver {
    pub fn new(resolver_ip: IpAddr) -> Self {
        let group = NameServerConfigGroup::from_ips_clear(&[resolver_ip], 53, true);
        let config = ResolverConfig::from_parts(None, Vec::new(), group);
        let inner = TokioAsyncResolver::tokio(config, ResolverOpts::default());
        Self { inner }
    }

    pub async fn resolve(&self, host: &str) -> Result<IpAddr> {
        let lookup = self.inner.lookup_ip(host).await?;
        let address = lookup
            .iter()
            .next()
            .ok_or_else(|| anyhow!("no address records for {host}"))?;
        debug!(host, %address, "bypass resolution");
        Ok(address)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builds_with_external_nameserver() {
        // construction is synchronous and must not touch the network
        let _resolver = BypassResolver::new("8.8.8.8".parse().unwrap());
    }
}
