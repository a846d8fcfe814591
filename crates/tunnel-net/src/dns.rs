//! Hostname resolution.
//!
//! The dual-stack strategy queries A and AAAA records independently and
//! merges them, IPv4 first. It only fails when both families fail.

use crate::error::{NetError, Result};
use hickory_resolver::config::{ResolverConfig, ResolverOpts};
use hickory_resolver::system_conf::read_system_conf;
use hickory_resolver::TokioAsyncResolver;
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::sync::{Arc, OnceLock};
use tracing::debug;

/// How hostnames are turned into addresses.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DnsStrategy {
    /// Operating system resolver (`getaddrinfo`)
    System,
    /// Independent A and AAAA queries, merged
    #[default]
    DualStack,
}

impl DnsStrategy {
    pub fn from_system_flag(system_dns: bool) -> Self {
        if system_dns {
            Self::System
        } else {
            Self::DualStack
        }
    }
}

/// Resolver handle. Cheap to clone; clones share the DNS client and its
/// cache. The client is built on first use and queries the nameservers
/// configured on the host (`/etc/resolv.conf` on Unix).
///
/// The DNS client runs its I/O on the runtime that first used it, so a
/// handle should not outlive that runtime.
#[derive(Clone, Default)]
pub struct Resolver {
    strategy: DnsStrategy,
    client: Arc<OnceLock<TokioAsyncResolver>>,
}

impl std::fmt::Debug for Resolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Resolver")
            .field("strategy", &self.strategy)
            .finish()
    }
}

impl Resolver {
    pub fn new(strategy: DnsStrategy) -> Self {
        Self {
            strategy,
            client: Arc::new(OnceLock::new()),
        }
    }

    pub fn strategy(&self) -> DnsStrategy {
        self.strategy
    }

    /// Every address for `host`.
    pub async fn lookup(&self, host: &str) -> Result<Vec<IpAddr>> {
        if let Ok(ip) = host.parse::<IpAddr>() {
            return Ok(vec![ip]);
        }

        let addresses = match self.strategy {
            DnsStrategy::System => self.lookup_system(host).await?,
            DnsStrategy::DualStack => self.lookup_dual_stack(host).await?,
        };

        if addresses.is_empty() {
            return Err(NetError::dns(host, "no addresses found"));
        }

        debug!("Resolved {} to {:?}", host, addresses);
        Ok(addresses)
    }

    /// The first address for `host`.
    pub async fn lookup_one(&self, host: &str) -> Result<IpAddr> {
        let addresses = self.lookup(host).await?;
        addresses
            .into_iter()
            .next()
            .ok_or_else(|| NetError::dns(host, "no addresses found"))
    }

    async fn lookup_system(&self, host: &str) -> Result<Vec<IpAddr>> {
        let addresses = tokio::net::lookup_host((host, 0))
            .await
            .map_err(|e| NetError::dns(host, e))?
            .map(|addr| addr.ip())
            .collect();
        Ok(addresses)
    }

    fn dns_client(&self, host: &str) -> Result<&TokioAsyncResolver> {
        if let Some(client) = self.client.get() {
            return Ok(client);
        }
        let (config, options) = system_config().map_err(|e| NetError::dns(host, e))?;
        Ok(self
            .client
            .get_or_init(|| TokioAsyncResolver::tokio(config, options)))
    }

    async fn lookup_dual_stack(&self, host: &str) -> Result<Vec<IpAddr>> {
        let client = self.dns_client(host)?;

        let (v4, v6) = tokio::join!(client.ipv4_lookup(host), client.ipv6_lookup(host));

        let mut addresses = Vec::new();
        let v4_error = match v4 {
            Ok(lookup) => {
                addresses.extend(lookup.iter().map(|a| IpAddr::V4(a.0)));
                None
            }
            Err(e) => Some(e),
        };
        let v6_error = match v6 {
            Ok(lookup) => {
                addresses.extend(lookup.iter().map(|aaaa| IpAddr::V6(aaaa.0)));
                None
            }
            Err(e) => Some(e),
        };

        match (v4_error, v6_error) {
            (Some(e4), Some(_)) if addresses.is_empty() => Err(NetError::dns(host, e4)),
            _ => Ok(addresses),
        }
    }
}

/// Nameservers and options from the host configuration
fn system_config() -> std::result::Result<(ResolverConfig, ResolverOpts), String> {
    read_system_conf().map_err(|e| e.to_string())
}
