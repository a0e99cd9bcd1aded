//! Implements [`ServiceDiscovery`] for dns.

use crate::{ServiceDiscovery, ServiceName};
use anyhow::Context;
use std::collections::HashSet;
use std::net::SocketAddr;
use trust_dns_resolver::{system_conf, TokioAsyncResolver};

/// Implements [`ServiceDiscovery`] by resolving the service name as a
/// hostname via DNS queries. All resolved IPs are paired with a fixed,
/// preconfigured port.
///
/// DNS has no watch semantics, so this backend is snapshot-only: the
/// registry polls it on its probe interval. Intended for environments
/// where servers sit behind a headless DNS record rather than a
/// coordination store.
pub struct DnsDiscovery {
    /// The trust-dns resolver which contacts the dns service directly such
    /// that we bypass os-specific dns caching.
    dns: TokioAsyncResolver,
    port: u16,
}

impl DnsDiscovery {
    /// Construct a new [`DnsDiscovery`] from env and system configuration,
    /// e.g `resolv.conf`.
    pub async fn from_system_config(port: u16) -> Result<Self, anyhow::Error> {
        let (config, mut opts) = system_conf::read_system_conf()
            .context("failed to read dns services from system configuration")?;

        // We do not want any caching on our side.
        opts.cache_size = 0;

        let dns = TokioAsyncResolver::tokio(config, opts);

        Ok(Self { dns, port })
    }
}

#[async_trait::async_trait]
impl ServiceDiscovery for DnsDiscovery {
    #[tracing::instrument(level = "debug", skip(self))]
    async fn snapshot(&self, service: &ServiceName) -> Result<HashSet<SocketAddr>, anyhow::Error> {
        match self.dns.lookup_ip(service.as_str()).await {
            Ok(lookup) => {
                tracing::debug!("dns query expires in: {:?}", lookup.valid_until());
                Ok(lookup
                    .iter()
                    .map(|ip_addr| {
                        tracing::debug!("result: ip {}", ip_addr);
                        (ip_addr, self.port).into()
                    })
                    .collect())
            }
            Err(err) => Err(err.into()),
        }
    }
}
