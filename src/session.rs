use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::config::OrchestratorConfig;
use crate::core::observability;
use crate::descriptor::{LocalEndpoint, Mode, UpstreamServer};
use crate::diagnostics::{ConnectProbe, NatDiscovery, NatTypeResult, Socks5ConnectProbe};
use crate::error::{Error, Result};
use crate::maintenance::{BackgroundTasks, HostMaintenance, SystemMaintenance};
use crate::port::{PortInspector, PortReconciler, SystemPortInspector};
use crate::preflight::{lookup_from_config, DnsLookup, PreflightValidator};
use crate::status::{self, LogStatus, PortReport, StatusSink};
use crate::subsystem::{ModeFeatureSet, ModeSubsystem, ServerSubsystem, SubsystemRegistry};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Starting,
    Running,
    Stopping,
}

/// Collaborators a session is built from.
pub struct SessionParts {
    pub config: OrchestratorConfig,
    pub registry: SubsystemRegistry,
    pub inspector: Arc<dyn PortInspector>,
    pub dns: Arc<dyn DnsLookup>,
    pub maintenance: Arc<dyn HostMaintenance>,
    pub status: Arc<dyn StatusSink>,
    pub nat: Arc<dyn NatDiscovery>,
    pub probe: Arc<dyn ConnectProbe>,
    pub background: Arc<BackgroundTasks>,
}

impl SessionParts {
    /// Parts backed by the running system. NAT discovery has no built-in
    /// implementation and must be supplied.
    pub fn system(
        config: OrchestratorConfig,
        registry: SubsystemRegistry,
        nat: Arc<dyn NatDiscovery>,
    ) -> Self {
        let inspector: Arc<dyn PortInspector> = Arc::new(SystemPortInspector::new());
        Self {
            dns: lookup_from_config(&config),
            maintenance: Arc::new(SystemMaintenance::new(inspector.clone())),
            probe: Arc::new(Socks5ConnectProbe::new(config.probe_target.clone())),
            status: Arc::new(LogStatus),
            background: Arc::new(BackgroundTasks::new()),
            inspector,
            registry,
            nat,
            config,
        }
    }
}

/// Who provides the local endpoint of a running session.
pub enum ServerHandle {
    /// The upstream SOCKS5 server is used as the endpoint directly.
    Direct,
    Relay(Box<dyn ServerSubsystem>),
}

impl ServerHandle {
    pub fn name(&self) -> &str {
        match self {
            ServerHandle::Direct => "direct",
            ServerHandle::Relay(adapter) => adapter.name(),
        }
    }
}

struct ActiveSession {
    server: UpstreamServer,
    mode: Mode,
    endpoint: LocalEndpoint,
    server_handle: ServerHandle,
    mode_handle: Box<dyn ModeSubsystem>,
    features: ModeFeatureSet,
}

/// Adapters handed out during a start, kept so a failure can unwind them.
#[derive(Default)]
struct Staged {
    server: Option<Box<dyn ServerSubsystem>>,
    mode: Option<Box<dyn ModeSubsystem>>,
}

struct Launched {
    endpoint: LocalEndpoint,
    server_handle: ServerHandle,
    mode_handle: Box<dyn ModeSubsystem>,
    features: ModeFeatureSet,
    mode_listener: Option<u16>,
}

/// The one forwarding session of the application.
///
/// `start` and `stop` take `&mut self`, so callers cannot overlap them or run
/// diagnostics while either is in flight.
pub struct Session {
    config: OrchestratorConfig,
    registry: SubsystemRegistry,
    preflight: PreflightValidator,
    reconciler: PortReconciler,
    maintenance: Arc<dyn HostMaintenance>,
    status: Arc<dyn StatusSink>,
    nat: Arc<dyn NatDiscovery>,
    probe: Arc<dyn ConnectProbe>,
    background: Arc<BackgroundTasks>,
    state: SessionState,
    active: Option<ActiveSession>,
}

impl Session {
    pub fn new(parts: SessionParts) -> Self {
        let reconciler = PortReconciler::new(
            parts.inspector,
            parts.config.install_dir.clone(),
            parts.config.terminate_timeout(),
        );
        Self {
            preflight: PreflightValidator::new(parts.dns),
            reconciler,
            registry: parts.registry,
            maintenance: parts.maintenance,
            status: parts.status,
            nat: parts.nat,
            probe: parts.probe,
            background: parts.background,
            config: parts.config,
            state: SessionState::Idle,
            active: None,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn is_running(&self) -> bool {
        self.state == SessionState::Running
    }

    pub fn local_endpoint(&self) -> Option<&LocalEndpoint> {
        self.active.as_ref().map(|a| &a.endpoint)
    }

    pub fn server(&self) -> Option<&UpstreamServer> {
        self.active.as_ref().map(|a| &a.server)
    }

    pub fn mode(&self) -> Option<&Mode> {
        self.active.as_ref().map(|a| &a.mode)
    }

    pub fn features(&self) -> Option<ModeFeatureSet> {
        self.active.as_ref().map(|a| a.features)
    }

    pub fn server_handle(&self) -> Option<&ServerHandle> {
        self.active.as_ref().map(|a| &a.server_handle)
    }

    pub fn mode_handle(&self) -> Option<&dyn ModeSubsystem> {
        self.active.as_ref().map(|a| a.mode_handle.as_ref())
    }

    /// Bring up `server` and `mode`. On failure everything partially started
    /// has already been stopped and the session is idle.
    pub async fn start(&mut self, server: UpstreamServer, mode: Mode) -> Result<LocalEndpoint> {
        self.preflight.validate(server.hostname()).await?;

        if self.active.is_some() {
            tracing::warn!("Start requested while a session is active; stopping it first");
            self.stop().await;
        }

        self.state = SessionState::Starting;
        tracing::info!(
            server = %server.display_name(),
            mode = %mode.mode_type(),
            "Starting session"
        );
        self.spawn_host_maintenance();

        let mut staged = Staged::default();
        match self.launch(&server, &mode, &mut staged).await {
            Ok(launched) => {
                let endpoint = launched.endpoint.clone();
                self.active = Some(ActiveSession {
                    server,
                    mode,
                    endpoint: launched.endpoint,
                    server_handle: launched.server_handle,
                    mode_handle: launched.mode_handle,
                    features: launched.features,
                });
                self.state = SessionState::Running;

                let report = PortReport {
                    socks: endpoint.port,
                    mode_listener: launched.mode_listener,
                };
                let sink = self.status.clone();
                status::notify("ports", || sink.ports(&report));
                observability::record_session_started();
                if observability::OBS_DEV {
                    tracing::debug!(snapshot = ?observability::snapshot(), "Observability");
                }
                self.spawn_snapshot(&endpoint);

                tracing::info!(%endpoint, "Session running");
                Ok(endpoint)
            }
            Err(e) => {
                tracing::error!(error = %e, code = e.code(), "Session start failed; unwinding");
                observability::record_start_failure();
                self.state = SessionState::Stopping;
                let sink = self.status.clone();
                status::notify("reset", || sink.reset());
                teardown(staged.server, staged.mode).await;
                self.state = SessionState::Idle;
                Err(e)
            }
        }
    }

    async fn launch(
        &self,
        server: &UpstreamServer,
        mode: &Mode,
        staged: &mut Staged,
    ) -> Result<Launched> {
        let resolution = self.registry.resolve_mode(mode.mode_type())?;
        let mode_name = resolution.subsystem.name().to_string();
        if let Some(port) = resolution.reserved_port {
            self.reconciler.reconcile(port, &mode_name).await?;
        }
        let features = resolution.features;

        let endpoint = match server {
            UpstreamServer::DirectSocks5(socks)
                if socks.auth.is_none()
                    || features.contains(ModeFeatureSet::SOCKS5_AUTH_PASSTHROUGH) =>
            {
                tracing::debug!(server = %server.display_name(), "Using upstream SOCKS5 server directly");
                LocalEndpoint::from_socks5(socks)
            }
            _ => {
                let adapter = self.registry.resolve_server(server)?;
                let name = adapter.name().to_string();
                self.reconciler
                    .reconcile(adapter.local_listener_port(), &name)
                    .await?;

                self.notify_starting(&format!("Starting {name}"));
                let adapter = staged.server.insert(adapter);
                adapter
                    .start(server)
                    .await
                    .map_err(|e| e.into_start_error(&name))?
            }
        };

        self.notify_starting(&format!("Starting {mode_name}"));
        let mode_listener = resolution.reserved_port;
        let mut mode_handle = resolution.subsystem;
        if let Err(e) = mode_handle.start(&endpoint, mode).await {
            staged.mode = Some(mode_handle);
            return Err(e.into_start_error(&mode_name));
        }

        Ok(Launched {
            endpoint,
            server_handle: staged
                .server
                .take()
                .map_or(ServerHandle::Direct, ServerHandle::Relay),
            mode_handle,
            features,
            mode_listener,
        })
    }

    /// Tear down whatever is running. Always ends idle; teardown errors are
    /// logged, never returned.
    pub async fn stop(&mut self) {
        let Some(active) = self.active.take() else {
            return;
        };

        self.state = SessionState::Stopping;
        let sink = self.status.clone();
        status::notify("reset", || sink.reset());
        tracing::info!(server = %active.server.display_name(), "Stopping session");

        let server = match active.server_handle {
            ServerHandle::Direct => None,
            ServerHandle::Relay(adapter) => Some(adapter),
        };
        teardown(server, Some(active.mode_handle)).await;

        observability::record_session_stopped();
        self.state = SessionState::Idle;
        tracing::info!("Session stopped");
    }

    /// Precondition: the session is running.
    pub async fn discover_nat_type(&self, cancel: &CancellationToken) -> Result<NatTypeResult> {
        let endpoint = self.running_endpoint();
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(Error::Cancelled),
            result = self.nat.discover(endpoint, cancel) => {
                result.map_err(|e| Error::diagnostic_with_source("NAT type discovery failed", e))
            }
        }
    }

    /// Precondition: the session is running.
    pub async fn probe_outbound_connect(&self, cancel: &CancellationToken) -> Result<Option<u16>> {
        let endpoint = self.running_endpoint();
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(Error::Cancelled),
            result = self.probe.probe(endpoint, cancel) => {
                result.map_err(|e| Error::diagnostic_with_source("Outbound connectivity probe failed", e))
            }
        }
    }

    fn running_endpoint(&self) -> &LocalEndpoint {
        match &self.active {
            Some(active) => &active.endpoint,
            None => panic!("diagnostics require a running session"),
        }
    }

    fn notify_starting(&self, text: &str) {
        let sink = self.status.clone();
        status::notify("starting", || sink.starting(text));
    }

    fn spawn_host_maintenance(&self) {
        let toggles = &self.config.maintenance;
        if toggles.refresh_dns_cache {
            let maintenance = self.maintenance.clone();
            self.background.spawn("refresh-dns-cache", async move {
                maintenance.refresh_dns_cache().await
            });
        }
        if toggles.install_firewall_rules {
            let maintenance = self.maintenance.clone();
            self.background.spawn("install-firewall-rules", async move {
                maintenance.install_firewall_rules().await
            });
        }
    }

    fn spawn_snapshot(&self, endpoint: &LocalEndpoint) {
        if !self.config.maintenance.diagnostic_snapshot {
            return;
        }
        let maintenance = self.maintenance.clone();
        let endpoint = endpoint.clone();
        self.background.spawn("diagnostic-snapshot", async move {
            maintenance.diagnostic_snapshot(&endpoint).await
        });
    }
}

/// Stop both adapters concurrently. Each runs in its own task so a panicking
/// adapter cannot take the other down with it.
async fn teardown(server: Option<Box<dyn ServerSubsystem>>, mode: Option<Box<dyn ModeSubsystem>>) {
    let server_stop = server.map(|mut adapter| {
        tokio::spawn(async move {
            let name = adapter.name().to_string();
            (name, adapter.stop().await)
        })
    });
    let mode_stop = mode.map(|mut adapter| {
        tokio::spawn(async move {
            let name = adapter.name().to_string();
            (name, adapter.stop().await)
        })
    });

    let (server_result, mode_result) = tokio::join!(
        async {
            match server_stop {
                Some(handle) => Some(handle.await),
                None => None,
            }
        },
        async {
            match mode_stop {
                Some(handle) => Some(handle.await),
                None => None,
            }
        },
    );

    for result in [server_result, mode_result].into_iter().flatten() {
        match result {
            Ok((_, Ok(()))) => {}
            Ok((component, Err(e))) => {
                observability::record_stop_failure();
                tracing::warn!(component = %component, error = %e, "Subsystem failed to stop cleanly");
            }
            Err(e) => {
                observability::record_stop_failure();
                tracing::warn!(error = %e, "Subsystem stop task panicked");
            }
        }
    }
}
