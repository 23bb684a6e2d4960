use std::env;
use std::process::ExitCode;
use std::sync::Arc;

use tunnel_orchestrator::config::OrchestratorConfig;
use tunnel_orchestrator::logging;
use tunnel_orchestrator::port::{PortAvailability, PortInspector, PortScope, SystemPortInspector};
use tunnel_orchestrator::preflight::{lookup_from_config, PreflightValidator};

const USAGE: &str = "usage: tunnel-orchestrator <upstream-host> [port...]";

/// Host check: resolves the upstream hostname and reports who holds each port.
#[tokio::main]
async fn main() -> ExitCode {
    let config = OrchestratorConfig::from_env();
    logging::init(config.log_level);

    let mut args = env::args().skip(1);
    let Some(hostname) = args.next() else {
        eprintln!("{USAGE}");
        return ExitCode::from(2);
    };
    let mut ports = Vec::new();
    for arg in args {
        match arg.parse::<u16>() {
            Ok(port) => ports.push(port),
            Err(_) => {
                eprintln!("invalid port '{arg}'\n{USAGE}");
                return ExitCode::from(2);
            }
        }
    }

    let mut healthy = true;

    let validator = PreflightValidator::new(lookup_from_config(&config));
    match validator.validate(&hostname).await {
        Ok(ip) => tracing::info!(hostname = %hostname, %ip, "Upstream resolves"),
        Err(e) => {
            tracing::error!(error = %e, "Preflight failed");
            healthy = false;
        }
    }

    let inspector: Arc<dyn PortInspector> = Arc::new(SystemPortInspector::new());
    for port in ports {
        match inspector.processes_using_tcp_port(port).await {
            Ok(holders) => {
                for holder in holders {
                    tracing::info!(port, pid = holder.pid, path = %holder.path.display(), "Port holder");
                }
            }
            Err(e) => tracing::warn!(port, error = %e, "Could not enumerate port holders"),
        }
        match inspector.check_port_available(port, PortScope::Tcp) {
            PortAvailability::Available => tracing::info!(port, "Port available"),
            other => {
                tracing::warn!(port, availability = ?other, "Port unavailable");
                healthy = false;
            }
        }
    }

    if healthy {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}
