use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::Deserialize;

use crate::config::{OrchestratorConfig, ResolverConfig};
use crate::error::{Error, Result};

/// Hostname lookup used before anything is started. `None` means unresolvable.
#[async_trait]
pub trait DnsLookup: Send + Sync {
    async fn lookup(&self, hostname: &str) -> Option<IpAddr>;
}

/// Lookup through the operating system resolver.
pub struct SystemDnsLookup {
    timeout: Duration,
}

impl SystemDnsLookup {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

impl Default for SystemDnsLookup {
    fn default() -> Self {
        Self::new(Duration::from_secs(5))
    }
}

#[async_trait]
impl DnsLookup for SystemDnsLookup {
    async fn lookup(&self, hostname: &str) -> Option<IpAddr> {
        let lookup = tokio::net::lookup_host((hostname, 0));
        match tokio::time::timeout(self.timeout, lookup).await {
            Ok(Ok(mut addrs)) => addrs.next().map(|addr| addr.ip()),
            Ok(Err(e)) => {
                tracing::debug!(hostname, error = %e, "System lookup failed");
                None
            }
            Err(_) => {
                tracing::debug!(hostname, "System lookup timed out");
                None
            }
        }
    }
}

#[derive(Deserialize)]
struct DohResponse {
    #[serde(rename = "Answer")]
    answer: Option<Vec<DohAnswer>>,
}

#[derive(Deserialize)]
struct DohAnswer {
    #[serde(rename = "TTL")]
    ttl: u32,
    data: String,
}

impl DohResponse {
    /// First answer that is an address; CNAME answers carry hostnames in `data`.
    fn first_address(self) -> Option<(IpAddr, u32)> {
        self.answer?
            .into_iter()
            .find_map(|a| a.data.parse::<IpAddr>().ok().map(|ip| (ip, a.ttl)))
    }
}

struct CacheEntry {
    ip: IpAddr,
    expires: Instant,
}

/// JSON DNS-over-HTTPS lookup with a small TTL cache.
pub struct DohLookup {
    client: reqwest::Client,
    url: String,
    timeout: Duration,
    cache: Arc<Mutex<HashMap<String, CacheEntry>>>,
    #[cfg(feature = "doh_fallback")]
    fallback: SystemDnsLookup,
}

impl DohLookup {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Self {
        Self {
            client: reqwest::Client::new(),
            url: url.into(),
            timeout,
            cache: Arc::new(Mutex::new(HashMap::new())),
            #[cfg(feature = "doh_fallback")]
            fallback: SystemDnsLookup::new(timeout),
        }
    }

    fn get_cached(&self, hostname: &str) -> Option<IpAddr> {
        let cache = self.cache.lock().ok()?;
        let entry = cache.get(hostname)?;
        (entry.expires > Instant::now()).then_some(entry.ip)
    }

    fn cache_result(&self, hostname: &str, ip: IpAddr, ttl: u32) {
        if let Ok(mut cache) = self.cache.lock() {
            let expires = Instant::now() + Duration::from_secs(u64::from(ttl));
            cache.insert(hostname.to_string(), CacheEntry { ip, expires });
        }
    }

    async fn query(&self, hostname: &str, record_type: &str) -> Option<IpAddr> {
        let response = self
            .client
            .get(&self.url)
            .query(&[("name", hostname), ("type", record_type)])
            .header("Accept", "application/dns-json")
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|e| tracing::debug!(hostname, record_type, error = %e, "DoH request failed"))
            .ok()?
            .json::<DohResponse>()
            .await
            .map_err(|e| tracing::debug!(hostname, record_type, error = %e, "DoH response malformed"))
            .ok()?;

        let (ip, ttl) = response.first_address()?;
        self.cache_result(hostname, ip, ttl.min(300));
        Some(ip)
    }

    /// IPv4 first, then IPv6 for hosts that only publish AAAA records.
    async fn resolve(&self, hostname: &str) -> Option<IpAddr> {
        match self.query(hostname, "A").await {
            Some(ip) => Some(ip),
            None => self.query(hostname, "AAAA").await,
        }
    }
}

#[async_trait]
impl DnsLookup for DohLookup {
    async fn lookup(&self, hostname: &str) -> Option<IpAddr> {
        if let Some(ip) = self.get_cached(hostname) {
            return Some(ip);
        }

        for _attempt in 0..2 {
            if let Some(ip) = self.resolve(hostname).await {
                return Some(ip);
            }
        }

        #[cfg(feature = "doh_fallback")]
        {
            self.fallback.lookup(hostname).await
        }
        #[cfg(not(feature = "doh_fallback"))]
        {
            None
        }
    }
}

/// Build the lookup the configuration asks for.
pub fn lookup_from_config(config: &OrchestratorConfig) -> Arc<dyn DnsLookup> {
    match &config.resolver {
        ResolverConfig::System => Arc::new(SystemDnsLookup::new(config.dns_timeout())),
        ResolverConfig::DnsOverHttps { url } => {
            Arc::new(DohLookup::new(url.clone(), config.dns_timeout()))
        }
    }
}

/// Fails fast when the upstream hostname cannot be resolved.
pub struct PreflightValidator {
    dns: Arc<dyn DnsLookup>,
}

impl PreflightValidator {
    pub fn new(dns: Arc<dyn DnsLookup>) -> Self {
        Self { dns }
    }

    pub async fn validate(&self, hostname: &str) -> Result<IpAddr> {
        if let Ok(ip) = hostname.trim_start_matches('[').trim_end_matches(']').parse::<IpAddr>() {
            return Ok(ip);
        }

        match self.dns.lookup(hostname).await {
            Some(ip) => {
                tracing::debug!(hostname, %ip, "Upstream hostname resolved");
                Ok(ip)
            }
            None => {
                tracing::warn!(hostname, "Upstream hostname did not resolve");
                Err(Error::Resolution {
                    hostname: hostname.to_string(),
                })
            }
        }
    }
}
