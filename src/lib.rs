//! Lifecycle orchestration for a local traffic-forwarding session: preflight
//! checks, port reconciliation, staged start of a server and a mode adapter,
//! guaranteed teardown, and diagnostics against the running endpoint.

pub mod config;
pub mod core;
pub mod descriptor;
pub mod diagnostics;
pub mod error;
pub mod logging;
pub mod maintenance;
pub mod port;
pub mod preflight;
pub mod session;
pub mod status;
pub mod subsystem;

pub use config::OrchestratorConfig;
pub use descriptor::{LocalEndpoint, Mode, ModeType, UpstreamServer};
pub use error::{Error, Result};
pub use session::{ServerHandle, Session, SessionParts, SessionState};
pub use subsystem::{
    ModeFeatureSet, ModeResolution, ModeSubsystem, ServerSubsystem, SubsystemError,
    SubsystemRegistry,
};
