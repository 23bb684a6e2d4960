use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Username/password pair for an authenticated SOCKS5 hop (RFC 1929).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

/// Upstream server the session forwards traffic through.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum UpstreamServer {
    /// Server that already speaks SOCKS5 and can act as the local endpoint itself.
    DirectSocks5(Socks5Server),
    /// Server whose protocol needs a local relay adapter.
    Relayed(RelayedServer),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Socks5Server {
    pub hostname: String,
    pub port: u16,
    #[serde(default)]
    pub remark: String,
    #[serde(default)]
    pub auth: Option<Credentials>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelayedServer {
    /// Protocol tag used to look up the relay adapter (e.g. "shadowsocks").
    pub protocol: String,
    pub hostname: String,
    pub port: u16,
    #[serde(default)]
    pub remark: String,
    /// Protocol-specific settings, opaque to the orchestrator.
    #[serde(default)]
    pub options: HashMap<String, String>,
}

impl UpstreamServer {
    pub fn hostname(&self) -> &str {
        match self {
            UpstreamServer::DirectSocks5(s) => &s.hostname,
            UpstreamServer::Relayed(s) => &s.hostname,
        }
    }

    pub fn port(&self) -> u16 {
        match self {
            UpstreamServer::DirectSocks5(s) => s.port,
            UpstreamServer::Relayed(s) => s.port,
        }
    }

    pub fn remark(&self) -> &str {
        match self {
            UpstreamServer::DirectSocks5(s) => &s.remark,
            UpstreamServer::Relayed(s) => &s.remark,
        }
    }

    /// Tag used to look up the server adapter: "socks5" or the relay protocol.
    pub fn protocol(&self) -> String {
        match self {
            UpstreamServer::DirectSocks5(_) => "socks5".to_string(),
            UpstreamServer::Relayed(s) => s.protocol.to_ascii_lowercase(),
        }
    }

    /// Display name: the remark when set, otherwise `host:port`.
    pub fn display_name(&self) -> String {
        if self.remark().is_empty() {
            format!("{}:{}", self.hostname(), self.port())
        } else {
            self.remark().to_string()
        }
    }
}

/// The fixed set of redirection strategies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModeType {
    /// Points the OS proxy settings at the local endpoint.
    SystemProxy,
    /// Redirects the traffic of selected processes.
    ProcessRedirect,
    /// Captures packets through a virtual adapter.
    Tun,
    /// Captures and shares traffic of other devices on the LAN.
    Share,
}

impl fmt::Display for ModeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ModeType::SystemProxy => "system-proxy",
            ModeType::ProcessRedirect => "process-redirect",
            ModeType::Tun => "tun",
            ModeType::Share => "share",
        };
        f.write_str(name)
    }
}

/// Redirection strategy selected for the session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Mode {
    SystemProxy(SystemProxyMode),
    ProcessRedirect(ProcessRedirectMode),
    Tun(TunMode),
    Share(ShareMode),
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SystemProxyMode {
    #[serde(default)]
    pub remark: String,
    #[serde(default)]
    pub bypass: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProcessRedirectMode {
    #[serde(default)]
    pub remark: String,
    #[serde(default)]
    pub processes: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TunMode {
    #[serde(default)]
    pub remark: String,
    #[serde(default)]
    pub routes: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ShareMode {
    #[serde(default)]
    pub remark: String,
}

impl Mode {
    pub fn mode_type(&self) -> ModeType {
        match self {
            Mode::SystemProxy(_) => ModeType::SystemProxy,
            Mode::ProcessRedirect(_) => ModeType::ProcessRedirect,
            Mode::Tun(_) => ModeType::Tun,
            Mode::Share(_) => ModeType::Share,
        }
    }

    pub fn remark(&self) -> &str {
        match self {
            Mode::SystemProxy(m) => &m.remark,
            Mode::ProcessRedirect(m) => &m.remark,
            Mode::Tun(m) => &m.remark,
            Mode::Share(m) => &m.remark,
        }
    }
}

/// Address of the SOCKS5-compatible listener a mode redirects traffic into.
///
/// Carries credentials only when the upstream itself is used directly and
/// requires authentication.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalEndpoint {
    pub host: String,
    pub port: u16,
    #[serde(default)]
    pub auth: Option<Credentials>,
}

impl LocalEndpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            auth: None,
        }
    }

    /// The upstream server's own address, used on the bypass branch.
    pub fn from_socks5(server: &Socks5Server) -> Self {
        Self {
            host: server.hostname.clone(),
            port: server.port,
            auth: server.auth.clone(),
        }
    }
}

impl fmt::Display for LocalEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}
