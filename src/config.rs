use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::logging::LogLevel;

/// Runtime settings for the orchestrator and its system facilities.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Processes whose executable lives under this directory are treated as
    /// stale instances of this application and may be terminated.
    pub install_dir: PathBuf,
    pub resolver: ResolverConfig,
    pub dns_timeout_ms: u64,
    pub terminate_timeout_ms: u64,
    pub log_level: LogLevel,
    pub probe_target: ProbeTarget,
    pub maintenance: MaintenanceConfig,
}

/// Which lookup backs the preflight hostname check
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ResolverConfig {
    System,
    DnsOverHttps { url: String },
}

/// Destination the outbound connectivity probe asks the local endpoint to reach
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ProbeTarget {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct MaintenanceConfig {
    pub refresh_dns_cache: bool,
    pub install_firewall_rules: bool,
    pub diagnostic_snapshot: bool,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            install_dir: default_install_dir(),
            resolver: ResolverConfig::System,
            dns_timeout_ms: 5_000,
            terminate_timeout_ms: 5_000,
            log_level: LogLevel::Info,
            probe_target: ProbeTarget::default(),
            maintenance: MaintenanceConfig::default(),
        }
    }
}

impl Default for ResolverConfig {
    fn default() -> Self {
        ResolverConfig::System
    }
}

impl Default for ProbeTarget {
    fn default() -> Self {
        Self {
            host: "www.google.com".to_string(),
            port: 443,
        }
    }
}

impl Default for MaintenanceConfig {
    fn default() -> Self {
        Self {
            refresh_dns_cache: true,
            install_firewall_rules: true,
            diagnostic_snapshot: true,
        }
    }
}

impl OrchestratorConfig {
    /// Defaults overlaid with `TUNNEL_*` environment variables.
    pub fn from_env() -> Self {
        Self::default().with_overrides(|key| env::var(key).ok())
    }

    fn with_overrides<F>(mut self, lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(dir) = lookup("TUNNEL_INSTALL_DIR") {
            self.install_dir = PathBuf::from(dir);
        }
        if let Some(level) = lookup("TUNNEL_LOG").and_then(|v| v.parse().ok()) {
            self.log_level = level;
        }
        if let Some(ms) = lookup("TUNNEL_DNS_TIMEOUT_MS").and_then(|v| v.parse().ok()) {
            self.dns_timeout_ms = ms;
        }
        if let Some(url) = lookup("TUNNEL_DOH_URL") {
            self.resolver = ResolverConfig::DnsOverHttps { url };
        }
        if let Some(target) = lookup("TUNNEL_PROBE_TARGET").and_then(|v| parse_host_port(&v)) {
            self.probe_target = target;
        }
        self
    }

    pub fn dns_timeout(&self) -> Duration {
        Duration::from_millis(self.dns_timeout_ms)
    }

    pub fn terminate_timeout(&self) -> Duration {
        Duration::from_millis(self.terminate_timeout_ms)
    }
}

fn default_install_dir() -> PathBuf {
    env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(Path::to_path_buf))
        .unwrap_or_else(|| PathBuf::from("."))
}

/// Parse `host:port`, keeping IPv6 literals in brackets intact.
fn parse_host_port(value: &str) -> Option<ProbeTarget> {
    let colon = value.rfind(':')?;
    let host = value[..colon].trim_start_matches('[').trim_end_matches(']');
    let port = value[colon + 1..].parse::<u16>().ok()?;
    if host.is_empty() {
        return None;
    }
    Some(ProbeTarget {
        host: host.to_string(),
        port,
    })
}
