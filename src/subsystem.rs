use std::collections::HashMap;
use std::fmt;
use std::ops::BitOr;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use crate::descriptor::{LocalEndpoint, Mode, ModeType, UpstreamServer};
use crate::error::{Error, Result};

/// Failure reported by a subsystem adapter.
#[derive(Error, Debug)]
pub enum SubsystemError {
    /// A binary, driver or runtime the adapter depends on is not installed.
    #[error("missing component {}", path.display())]
    MissingComponent { path: PathBuf },

    #[error("{message}")]
    Failed { message: String },
}

impl SubsystemError {
    pub fn failed<S: Into<String>>(message: S) -> Self {
        Self::Failed {
            message: message.into(),
        }
    }

    /// Translate into the orchestrator's error, naming the component.
    pub fn into_start_error(self, component: &str) -> Error {
        match self {
            SubsystemError::MissingComponent { path } => Error::MissingRuntimeComponent {
                component: component.to_string(),
                detail: path.display().to_string(),
            },
            SubsystemError::Failed { message } => Error::SubsystemStart {
                component: component.to_string(),
                message,
            },
        }
    }
}

pub type SubsystemResult<T> = std::result::Result<T, SubsystemError>;

/// Turns an upstream server into a local SOCKS5 endpoint.
#[async_trait]
pub trait ServerSubsystem: Send + Sync {
    fn name(&self) -> &str;

    /// Port the adapter will bind, queried before `start` so it can be reconciled.
    fn local_listener_port(&self) -> u16;

    async fn start(&mut self, server: &UpstreamServer) -> SubsystemResult<LocalEndpoint>;

    /// Idempotent teardown.
    async fn stop(&mut self) -> SubsystemResult<()>;
}

/// Applies a redirection strategy on top of a local endpoint.
#[async_trait]
pub trait ModeSubsystem: Send + Sync {
    fn name(&self) -> &str;

    async fn start(&mut self, endpoint: &LocalEndpoint, mode: &Mode) -> SubsystemResult<()>;

    /// Idempotent teardown.
    async fn stop(&mut self) -> SubsystemResult<()>;
}

/// Capabilities a mode adapter advertises.
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct ModeFeatureSet(u32);

impl ModeFeatureSet {
    pub const NONE: Self = Self(0);
    /// The mode can authenticate against an upstream SOCKS5 server itself.
    pub const SOCKS5_AUTH_PASSTHROUGH: Self = Self(1 << 0);
    /// The mode also redirects UDP traffic.
    pub const UDP_REDIRECT: Self = Self(1 << 1);

    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    pub const fn bits(self) -> u32 {
        self.0
    }
}

impl BitOr for ModeFeatureSet {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl fmt::Debug for ModeFeatureSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names = Vec::new();
        if self.contains(Self::SOCKS5_AUTH_PASSTHROUGH) {
            names.push("SOCKS5_AUTH_PASSTHROUGH");
        }
        if self.contains(Self::UDP_REDIRECT) {
            names.push("UDP_REDIRECT");
        }
        write!(f, "ModeFeatureSet({})", names.join(" | "))
    }
}

/// A mode adapter together with what the orchestrator needs to know before starting it.
pub struct ModeResolution {
    pub subsystem: Box<dyn ModeSubsystem>,
    pub features: ModeFeatureSet,
    /// Port the mode binds itself, reconciled before it starts.
    pub reserved_port: Option<u16>,
}

type ServerFactory = Arc<dyn Fn() -> Box<dyn ServerSubsystem> + Send + Sync>;
type ModeFactory = Arc<dyn Fn() -> ModeResolution + Send + Sync>;

/// Adapter lookup keyed on descriptor tags.
#[derive(Default, Clone)]
pub struct SubsystemRegistry {
    servers: HashMap<String, ServerFactory>,
    modes: HashMap<ModeType, ModeFactory>,
}

impl SubsystemRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the relay adapter for a server protocol tag (case-insensitive).
    pub fn register_server<F>(&mut self, protocol: &str, factory: F) -> &mut Self
    where
        F: Fn() -> Box<dyn ServerSubsystem> + Send + Sync + 'static,
    {
        self.servers
            .insert(protocol.to_ascii_lowercase(), Arc::new(factory));
        self
    }

    pub fn register_mode<F>(&mut self, mode: ModeType, factory: F) -> &mut Self
    where
        F: Fn() -> ModeResolution + Send + Sync + 'static,
    {
        self.modes.insert(mode, Arc::new(factory));
        self
    }

    pub fn resolve_server(&self, server: &UpstreamServer) -> Result<Box<dyn ServerSubsystem>> {
        let protocol = server.protocol();
        self.servers
            .get(&protocol)
            .map(|factory| factory())
            .ok_or(Error::UnsupportedServer { protocol })
    }

    pub fn resolve_mode(&self, mode: ModeType) -> Result<ModeResolution> {
        self.modes
            .get(&mode)
            .map(|factory| factory())
            .ok_or(Error::UnsupportedMode { mode })
    }
}
