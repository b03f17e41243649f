use dns_lookup::{lookup_addr, lookup_host};
use std::net::IpAddr;

use crate::icmp::IpVersion;

/// Name resolution used by route discovery.
pub trait HostResolver: Send + Sync {
    /// Addresses of `host` in the requested family, best first. Empty when
    /// the name does not resolve.
    fn resolve(&self, host: &str, version: IpVersion) -> Vec<IpAddr>;
}

/// Resolver backed by the system's `getaddrinfo`.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemResolver;

impl HostResolver for SystemResolver {
    fn resolve(&self, host: &str, version: IpVersion) -> Vec<IpAddr> {
        match lookup(host, version) {
            Ok(addresses) => addresses,
            Err(e) => {
                log::debug!("Resolution of {} failed: {}", host, e);
                Vec::new()
            }
        }
    }
}

/// Blocking lookup of `hostname`, keeping only addresses of `version`.
pub fn lookup(hostname: &str, version: IpVersion) -> anyhow::Result<Vec<IpAddr>> {
    // First try to parse as IP address
    if let Ok(ip) = hostname.parse::<IpAddr>() {
        if !version.matches(&ip) {
            return Err(anyhow::anyhow!("{} is not an {} address", ip, version));
        }
        return Ok(vec![ip]);
    }

    let addresses = lookup_host(hostname)?;

    let filtered: Vec<IpAddr> = addresses
        .into_iter()
        .filter(|addr| version.matches(addr))
        .collect();

    if filtered.is_empty() {
        return Err(anyhow::anyhow!("No {} addresses found for hostname: {}", version, hostname));
    }

    Ok(filtered)
}

pub async fn resolve_hostname(hostname: &str, version: IpVersion) -> anyhow::Result<IpAddr> {
    let addresses = tokio::task::spawn_blocking({
        let hostname = hostname.to_string();
        move || lookup(&hostname, version)
    })
    .await??;

    addresses
        .first()
        .copied()
        .ok_or_else(|| anyhow::anyhow!("No suitable address found"))
}

pub async fn reverse_lookup(ip: IpAddr) -> Option<String> {
    tokio::task::spawn_blocking(move || lookup_addr(&ip).ok())
        .await
        .ok()
        .flatten()
}
