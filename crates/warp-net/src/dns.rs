//! Async DNS Resolver with Caching
//!
//! Resolves named endpoints (`host:port`) before a tunnel is built.
//! Queries go to the configured resolver address only, so endpoint
//! lookups never fall back to the system resolver.

use hickory_resolver::config::{NameServerConfigGroup, ResolverConfig, ResolverOpts};
use hickory_resolver::TokioAsyncResolver;
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, info};

/// DNS resolution errors
#[derive(Debug, Error)]
pub enum DnsError {
    #[error("Resolution failed: {0}")]
    ResolutionFailed(String),

    #[error("No addresses found for domain")]
    NoAddresses,
}

/// DNS resolver configuration
#[derive(Debug, Clone)]
pub struct DnsConfig {
    /// Nameserver to query
    pub nameserver: IpAddr,
    /// Nameserver port
    pub port: u16,
    /// Cache TTL for successful lookups
    pub cache_ttl: Duration,
    /// Maximum cache size
    pub max_cache_entries: usize,
    /// Timeout for DNS queries
    pub timeout: Duration,
}

impl DnsConfig {
    /// Configuration querying `nameserver` on port 53
    pub fn with_nameserver(nameserver: IpAddr) -> Self {
        Self {
            nameserver,
            ..Default::default()
        }
    }
}

impl Default for DnsConfig {
    fn default() -> Self {
        Self {
            nameserver: IpAddr::from([1, 1, 1, 1]),
            port: 53,
            cache_ttl: Duration::from_secs(300), // 5 minutes
            max_cache_entries: 256,
            timeout: Duration::from_secs(5),
        }
    }
}

/// Cached DNS entry
#[derive(Clone)]
struct CacheEntry {
    addresses: Vec<IpAddr>,
    expires_at: Instant,
}

/// Async DNS resolver with caching
pub struct DnsResolver {
    /// Underlying resolver
    resolver: TokioAsyncResolver,
    /// DNS cache
    cache: Arc<RwLock<HashMap<String, CacheEntry>>>,
    /// Configuration
    config: DnsConfig,
}

impl DnsResolver {
    /// Create a new DNS resolver
    pub fn new(config: DnsConfig) -> Self {
        let servers = NameServerConfigGroup::from_ips_clear(&[config.nameserver], config.port, true);
        let resolver_config = ResolverConfig::from_parts(None, vec![], servers);

        let mut opts = ResolverOpts::default();
        opts.timeout = config.timeout;

        info!("DNS resolver initialized (nameserver: {})", config.nameserver);

        Self {
            resolver: TokioAsyncResolver::tokio(resolver_config, opts),
            cache: Arc::new(RwLock::new(HashMap::new())),
            config,
        }
    }

    pub fn config(&self) -> &DnsConfig {
        &self.config
    }

    /// Resolve a domain to IP addresses
    ///
    /// IP literals are returned as-is without touching the network.
    pub async fn resolve(&self, domain: &str) -> Result<Vec<IpAddr>, DnsError> {
        if let Ok(ip) = domain.trim_start_matches('[').trim_end_matches(']').parse::<IpAddr>() {
            return Ok(vec![ip]);
        }

        let normalized = domain.to_lowercase();

        if let Some(cached) = self.get_cached(&normalized) {
            debug!("DNS cache hit for: {}", domain);
            return Ok(cached);
        }

        debug!("DNS lookup for: {}", domain);
        let lookup = self.resolver.lookup_ip(normalized.as_str()).await
            .map_err(|e| DnsError::ResolutionFailed(e.to_string()))?;

        let addresses: Vec<IpAddr> = lookup.iter().collect();

        if addresses.is_empty() {
            return Err(DnsError::NoAddresses);
        }

        self.cache_addresses(&normalized, &addresses);

        Ok(addresses)
    }

    /// Resolve to a single address, preferring the requested families
    pub async fn resolve_one(&self, domain: &str, ipv4: bool, ipv6: bool) -> Result<IpAddr, DnsError> {
        let addresses = self.resolve(domain).await?;
        addresses
            .iter()
            .copied()
            .find(|ip| (ip.is_ipv4() && ipv4) || (ip.is_ipv6() && ipv6))
            .or_else(|| addresses.first().copied())
            .ok_or(DnsError::NoAddresses)
    }

    /// Get cache statistics (total, still valid)
    pub fn cache_stats(&self) -> (usize, usize) {
        let cache = self.cache.read().unwrap_or_else(|e| e.into_inner());
        let now = Instant::now();
        let total = cache.len();
        let valid = cache.values().filter(|e| e.expires_at > now).count();
        (total, valid)
    }

    fn get_cached(&self, domain: &str) -> Option<Vec<IpAddr>> {
        let cache = self.cache.read().unwrap_or_else(|e| e.into_inner());

        cache
            .get(domain)
            .filter(|entry| entry.expires_at > Instant::now())
            .map(|entry| entry.addresses.clone())
    }

    fn cache_addresses(&self, domain: &str, addresses: &[IpAddr]) {
        let mut cache = self.cache.write().unwrap_or_else(|e| e.into_inner());

        if cache.len() >= self.config.max_cache_entries {
            let now = Instant::now();
            cache.retain(|_, v| v.expires_at > now);

            if cache.len() >= self.config.max_cache_entries {
                let keys_to_remove: Vec<_> = cache.keys()
                    .take(cache.len() / 4 + 1)
                    .cloned()
                    .collect();
                for key in keys_to_remove {
                    cache.remove(&key);
                }
            }
        }

        cache.insert(domain.to_string(), CacheEntry {
            addresses: addresses.to_vec(),
            expires_at: Instant::now() + self.config.cache_ttl,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_resolver_creation() {
        let resolver = DnsResolver::new(DnsConfig::with_nameserver("9.9.9.9".parse().unwrap()));
        assert_eq!(resolver.config().port, 53);
        assert_eq!(resolver.cache_stats(), (0, 0));
    }

    #[tokio::test]
    async fn test_ip_literal_bypasses_lookup() {
        let resolver = DnsResolver::new(DnsConfig::default());

        let v4 = resolver.resolve("162.159.192.1").await.unwrap();
        assert_eq!(v4, vec!["162.159.192.1".parse::<IpAddr>().unwrap()]);

        let v6 = resolver.resolve("[2606:4700:d0::a29f:c001]").await.unwrap();
        assert!(v6[0].is_ipv6());

        // Literals are never cached
        assert_eq!(resolver.cache_stats(), (0, 0));
    }

    #[tokio::test]
    async fn test_cache_eviction() {
        let resolver = DnsResolver::new(DnsConfig {
            max_cache_entries: 2,
            ..Default::default()
        });
        let ip: IpAddr = "10.0.0.1".parse().unwrap();

        resolver.cache_addresses("a.example", &[ip]);
        resolver.cache_addresses("b.example", &[ip]);
        resolver.cache_addresses("c.example", &[ip]);

        let (total, valid) = resolver.cache_stats();
        assert!(total <= 2);
        assert_eq!(total, valid);
        assert_eq!(resolver.get_cached("c.example"), Some(vec![ip]));
    }
}
