use std::path::PathBuf;

use thiserror::Error;

use crate::descriptor::ModeType;

/// Orchestrator error types
#[derive(Error, Debug)]
pub enum Error {
    #[error("Unable to resolve upstream server hostname '{hostname}'")]
    Resolution { hostname: String },

    #[error("Port {port} ({label}) is already in use")]
    PortInUse { port: u16, label: String },

    #[error("Port {port} ({label}) is reserved by the operating system")]
    PortReserved { port: u16, label: String },

    #[error("Port {port} ({label}) is held by process {pid} ({})", path.display())]
    ForeignPortHolder {
        port: u16,
        label: String,
        pid: u32,
        path: PathBuf,
    },

    #[error("{component}: a required file or runtime is missing: {detail}")]
    MissingRuntimeComponent { component: String, detail: String },

    #[error("{component} failed to start: {message}")]
    SubsystemStart { component: String, message: String },

    #[error("No server adapter registered for protocol '{protocol}'")]
    UnsupportedServer { protocol: String },

    #[error("No mode adapter registered for '{mode}'")]
    UnsupportedMode { mode: ModeType },

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Diagnostic error: {message}")]
    Diagnostic {
        message: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub fn diagnostic_with_source<S: Into<String>, E: std::error::Error + Send + Sync + 'static>(
        message: S,
        source: E,
    ) -> Self {
        Self::Diagnostic {
            message: message.into(),
            source: Box::new(source),
        }
    }

    /// Get error code/category for external use
    pub fn code(&self) -> &'static str {
        match self {
            Self::Resolution { .. } => "RESOLUTION",
            Self::PortInUse { .. } => "PORT_IN_USE",
            Self::PortReserved { .. } => "PORT_RESERVED",
            Self::ForeignPortHolder { .. } => "FOREIGN_PORT_HOLDER",
            Self::MissingRuntimeComponent { .. } => "MISSING_RUNTIME_COMPONENT",
            Self::SubsystemStart { .. } => "SUBSYSTEM_START",
            Self::UnsupportedServer { .. } => "UNSUPPORTED_SERVER",
            Self::UnsupportedMode { .. } => "UNSUPPORTED_MODE",
            Self::Cancelled => "CANCELLED",
            Self::Diagnostic { .. } => "DIAGNOSTIC",
        }
    }

    /// Whether the message is meant to be shown to the user as-is.
    pub fn is_user_facing(&self) -> bool {
        !matches!(self, Self::Cancelled)
    }

    /// The port a port-related error refers to.
    pub fn port(&self) -> Option<u16> {
        match self {
            Self::PortInUse { port, .. }
            | Self::PortReserved { port, .. }
            | Self::ForeignPortHolder { port, .. } => Some(*port),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn foreign_holder_message_names_pid_and_path() {
        let err = Error::ForeignPortHolder {
            port: 1080,
            label: "Socks5".to_string(),
            pid: 4242,
            path: PathBuf::from("/usr/bin/other-proxy"),
        };
        let text = err.to_string();
        assert!(text.contains("1080"));
        assert!(text.contains("4242"));
        assert!(text.contains("/usr/bin/other-proxy"));
        assert_eq!(err.code(), "FOREIGN_PORT_HOLDER");
        assert_eq!(err.port(), Some(1080));
    }

    #[test]
    fn start_failure_embeds_original_message() {
        let err = Error::SubsystemStart {
            component: "Shadowsocks".to_string(),
            message: "handshake refused".to_string(),
        };
        assert_eq!(err.to_string(), "Shadowsocks failed to start: handshake refused");
        assert!(err.is_user_facing());
        assert!(!Error::Cancelled.is_user_facing());
    }

    #[test]
    fn diagnostic_keeps_underlying_cause() {
        let cause = std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "refused");
        let err = Error::diagnostic_with_source("Outbound connectivity probe failed", cause);
        assert_eq!(err.code(), "DIAGNOSTIC");
        let source = std::error::Error::source(&err).map(ToString::to_string);
        assert_eq!(source.as_deref(), Some("refused"));
    }
}
