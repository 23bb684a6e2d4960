use std::collections::HashMap;
use std::io;
use std::net::{IpAddr, Ipv4Addr};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use tunnel_orchestrator::config::OrchestratorConfig;
use tunnel_orchestrator::descriptor::{
    Credentials, LocalEndpoint, Mode, ModeType, RelayedServer, Socks5Server, SystemProxyMode,
    TunMode, UpstreamServer,
};
use tunnel_orchestrator::diagnostics::{ConnectProbe, NatDiscovery, NatTypeResult};
use tunnel_orchestrator::maintenance::{BackgroundTasks, HostMaintenance};
use tunnel_orchestrator::port::{PortAvailability, PortHolder, PortInspector, PortScope};
use tunnel_orchestrator::preflight::DnsLookup;
use tunnel_orchestrator::status::{PortReport, StatusSink};
use tunnel_orchestrator::subsystem::{
    ModeFeatureSet, ModeResolution, ModeSubsystem, ServerSubsystem, SubsystemError,
    SubsystemRegistry, SubsystemResult,
};
use tunnel_orchestrator::{Error, ServerHandle, Session, SessionParts, SessionState};

const INSTALL_DIR: &str = "/opt/tunnel-orchestrator";
const RELAY_PORT: u16 = 1080;

type Events = Arc<Mutex<Vec<String>>>;

fn record(events: &Events, event: impl Into<String>) {
    events.lock().unwrap().push(event.into());
}

fn count(events: &Events, event: &str) -> usize {
    events.lock().unwrap().iter().filter(|e| *e == event).count()
}

#[derive(Clone, Copy)]
enum Outcome {
    Ok,
    Fail,
    Missing,
}

impl Outcome {
    fn into_result(self) -> SubsystemResult<()> {
        match self {
            Outcome::Ok => Ok(()),
            Outcome::Fail => Err(SubsystemError::failed("handshake refused")),
            Outcome::Missing => Err(SubsystemError::MissingComponent {
                path: PathBuf::from("bin/wintun.dll"),
            }),
        }
    }
}

struct RecordingServer {
    events: Events,
    start: Outcome,
}

#[async_trait]
impl ServerSubsystem for RecordingServer {
    fn name(&self) -> &str {
        "Relay"
    }

    fn local_listener_port(&self) -> u16 {
        RELAY_PORT
    }

    async fn start(&mut self, server: &UpstreamServer) -> SubsystemResult<LocalEndpoint> {
        record(&self.events, format!("server:start:{}", server.hostname()));
        self.start.into_result()?;
        Ok(LocalEndpoint::new("127.0.0.1", RELAY_PORT))
    }

    async fn stop(&mut self) -> SubsystemResult<()> {
        record(&self.events, "server:stop");
        Ok(())
    }
}

struct RecordingMode {
    events: Events,
    start: Outcome,
    stop: Outcome,
}

#[async_trait]
impl ModeSubsystem for RecordingMode {
    fn name(&self) -> &str {
        "TUN"
    }

    async fn start(&mut self, endpoint: &LocalEndpoint, _mode: &Mode) -> SubsystemResult<()> {
        record(&self.events, format!("mode:start:{endpoint}"));
        self.start.into_result()
    }

    async fn stop(&mut self) -> SubsystemResult<()> {
        record(&self.events, "mode:stop");
        self.stop.into_result()
    }
}

#[derive(Default)]
struct FakeInspector {
    holders: Mutex<HashMap<u16, Vec<PortHolder>>>,
    availability: Mutex<HashMap<u16, PortAvailability>>,
    queried: Mutex<Vec<u16>>,
    killed: Mutex<Vec<u32>>,
}

impl FakeInspector {
    fn hold(&self, port: u16, pid: u32, path: &str) {
        self.holders
            .lock()
            .unwrap()
            .entry(port)
            .or_default()
            .push(PortHolder {
                pid,
                path: PathBuf::from(path),
            });
    }
}

#[async_trait]
impl PortInspector for FakeInspector {
    async fn processes_using_tcp_port(&self, port: u16) -> io::Result<Vec<PortHolder>> {
        self.queried.lock().unwrap().push(port);
        Ok(self
            .holders
            .lock()
            .unwrap()
            .get(&port)
            .cloned()
            .unwrap_or_default())
    }

    async fn terminate(&self, pid: u32, _timeout: Duration) -> io::Result<()> {
        self.killed.lock().unwrap().push(pid);
        for holders in self.holders.lock().unwrap().values_mut() {
            holders.retain(|h| h.pid != pid);
        }
        Ok(())
    }

    fn check_port_available(&self, port: u16, _scope: PortScope) -> PortAvailability {
        if self
            .holders
            .lock()
            .unwrap()
            .get(&port)
            .is_some_and(|h| !h.is_empty())
        {
            return PortAvailability::InUse;
        }
        self.availability
            .lock()
            .unwrap()
            .get(&port)
            .copied()
            .unwrap_or(PortAvailability::Available)
    }
}

struct FakeDns {
    answer: Option<IpAddr>,
}

#[async_trait]
impl DnsLookup for FakeDns {
    async fn lookup(&self, hostname: &str) -> Option<IpAddr> {
        if hostname.ends_with(".invalid") {
            return None;
        }
        self.answer
    }
}

#[derive(Default)]
struct RecordingMaintenance {
    events: Events,
}

#[async_trait]
impl HostMaintenance for RecordingMaintenance {
    async fn refresh_dns_cache(&self) -> io::Result<()> {
        record(&self.events, "dns-cache");
        Ok(())
    }

    async fn install_firewall_rules(&self) -> io::Result<()> {
        record(&self.events, "firewall");
        Err(io::Error::new(io::ErrorKind::PermissionDenied, "not elevated"))
    }

    async fn diagnostic_snapshot(&self, endpoint: &LocalEndpoint) -> io::Result<()> {
        record(&self.events, format!("snapshot:{endpoint}"));
        Ok(())
    }
}

#[derive(Default)]
struct RecordingStatus {
    starting: Mutex<Vec<String>>,
    ports: Mutex<Vec<PortReport>>,
    resets: Mutex<usize>,
}

impl StatusSink for RecordingStatus {
    fn starting(&self, text: &str) {
        self.starting.lock().unwrap().push(text.to_string());
    }

    fn ports(&self, report: &PortReport) {
        self.ports.lock().unwrap().push(*report);
    }

    fn reset(&self) {
        *self.resets.lock().unwrap() += 1;
    }
}

struct SlowNat;

#[async_trait]
impl NatDiscovery for SlowNat {
    async fn discover(
        &self,
        _endpoint: &LocalEndpoint,
        _cancel: &CancellationToken,
    ) -> io::Result<NatTypeResult> {
        tokio::time::sleep(Duration::from_secs(60)).await;
        Ok(NatTypeResult {
            nat_type: "Full cone".to_string(),
            public_address: None,
        })
    }
}

struct FixedProbe;

#[async_trait]
impl ConnectProbe for FixedProbe {
    async fn probe(
        &self,
        endpoint: &LocalEndpoint,
        _cancel: &CancellationToken,
    ) -> io::Result<Option<u16>> {
        if endpoint.port == RELAY_PORT {
            Ok(Some(49152))
        } else {
            Err(io::Error::new(io::ErrorKind::ConnectionRefused, "refused"))
        }
    }
}

struct Harness {
    events: Events,
    inspector: Arc<FakeInspector>,
    maintenance: Arc<RecordingMaintenance>,
    status: Arc<RecordingStatus>,
    background: Arc<BackgroundTasks>,
    registry: SubsystemRegistry,
    dns: Option<IpAddr>,
}

impl Harness {
    fn new() -> Self {
        Self {
            events: Events::default(),
            inspector: Arc::new(FakeInspector::default()),
            maintenance: Arc::new(RecordingMaintenance::default()),
            status: Arc::new(RecordingStatus::default()),
            background: Arc::new(BackgroundTasks::new()),
            registry: SubsystemRegistry::new(),
            dns: Some(IpAddr::V4(Ipv4Addr::new(203, 0, 113, 7))),
        }
    }

    fn relay(&mut self, protocol: &str, start: Outcome) -> &mut Self {
        let events = self.events.clone();
        self.registry.register_server(protocol, move || {
            Box::new(RecordingServer {
                events: events.clone(),
                start,
            })
        });
        self
    }

    fn mode(
        &mut self,
        features: ModeFeatureSet,
        reserved_port: Option<u16>,
        start: Outcome,
        stop: Outcome,
    ) -> &mut Self {
        let events = self.events.clone();
        self.registry.register_mode(ModeType::Tun, move || ModeResolution {
            subsystem: Box::new(RecordingMode {
                events: events.clone(),
                start,
                stop,
            }),
            features,
            reserved_port,
        });
        self
    }

    fn session(&self) -> Session {
        let config = OrchestratorConfig {
            install_dir: PathBuf::from(INSTALL_DIR),
            ..OrchestratorConfig::default()
        };
        Session::new(SessionParts {
            config,
            registry: self.registry.clone(),
            inspector: self.inspector.clone(),
            dns: Arc::new(FakeDns { answer: self.dns }),
            maintenance: self.maintenance.clone(),
            status: self.status.clone(),
            nat: Arc::new(SlowNat),
            probe: Arc::new(FixedProbe),
            background: self.background.clone(),
        })
    }

    fn events(&self) -> Vec<String> {
        self.events.lock().unwrap().clone()
    }
}

fn relayed(hostname: &str) -> UpstreamServer {
    UpstreamServer::Relayed(RelayedServer {
        protocol: "shadowsocks".to_string(),
        hostname: hostname.to_string(),
        port: 8388,
        remark: "Tokyo".to_string(),
        options: HashMap::new(),
    })
}

fn socks5(auth: Option<Credentials>) -> UpstreamServer {
    UpstreamServer::DirectSocks5(Socks5Server {
        hostname: "socks.example".to_string(),
        port: 1081,
        remark: String::new(),
        auth,
    })
}

fn credentials() -> Option<Credentials> {
    Some(Credentials {
        username: "alice".to_string(),
        password: "secret".to_string(),
    })
}

fn tun() -> Mode {
    Mode::Tun(TunMode::default())
}

#[tokio::test]
async fn relayed_server_runs_exactly_one_adapter() {
    let mut harness = Harness::new();
    harness
        .relay("shadowsocks", Outcome::Ok)
        .mode(ModeFeatureSet::NONE, None, Outcome::Ok, Outcome::Ok);
    let mut session = harness.session();

    let endpoint = session.start(relayed("relay.example"), tun()).await.unwrap();

    assert_eq!(endpoint, LocalEndpoint::new("127.0.0.1", RELAY_PORT));
    assert_eq!(session.state(), SessionState::Running);
    assert_eq!(session.local_endpoint(), Some(&endpoint));
    assert_eq!(session.server_handle().map(ServerHandle::name), Some("Relay"));
    assert_eq!(session.mode().map(Mode::mode_type), Some(ModeType::Tun));
    assert_eq!(
        harness.events(),
        vec![
            "server:start:relay.example".to_string(),
            "mode:start:127.0.0.1:1080".to_string(),
        ]
    );
    assert_eq!(
        *harness.status.ports.lock().unwrap(),
        vec![PortReport {
            socks: RELAY_PORT,
            mode_listener: None,
        }]
    );
    assert_eq!(
        *harness.status.starting.lock().unwrap(),
        vec!["Starting Relay".to_string(), "Starting TUN".to_string()]
    );
}

#[tokio::test]
async fn unauthenticated_socks5_bypasses_server_adapter() {
    let mut harness = Harness::new();
    harness
        .relay("socks5", Outcome::Ok)
        .mode(ModeFeatureSet::NONE, None, Outcome::Ok, Outcome::Ok);
    let mut session = harness.session();

    let endpoint = session.start(socks5(None), tun()).await.unwrap();

    assert_eq!(endpoint, LocalEndpoint::new("socks.example", 1081));
    assert!(matches!(session.server_handle(), Some(ServerHandle::Direct)));
    assert_eq!(count(&harness.events, "server:start:socks.example"), 0);
    assert!(!harness.inspector.queried.lock().unwrap().contains(&RELAY_PORT));

    session.stop().await;
    assert_eq!(count(&harness.events, "server:stop"), 0);
    assert_eq!(count(&harness.events, "mode:stop"), 1);
}

#[tokio::test]
async fn authenticated_socks5_bypasses_when_mode_passes_credentials() {
    let mut harness = Harness::new();
    harness.relay("socks5", Outcome::Ok).mode(
        ModeFeatureSet::SOCKS5_AUTH_PASSTHROUGH,
        None,
        Outcome::Ok,
        Outcome::Ok,
    );
    let mut session = harness.session();

    let endpoint = session.start(socks5(credentials()), tun()).await.unwrap();

    assert_eq!(endpoint.port, 1081);
    assert_eq!(endpoint.auth, credentials());
    assert!(matches!(session.server_handle(), Some(ServerHandle::Direct)));
    assert_eq!(
        session.features(),
        Some(ModeFeatureSet::SOCKS5_AUTH_PASSTHROUGH)
    );
}

#[tokio::test]
async fn authenticated_socks5_needs_relay_without_passthrough() {
    let mut harness = Harness::new();
    harness
        .relay("socks5", Outcome::Ok)
        .mode(ModeFeatureSet::NONE, None, Outcome::Ok, Outcome::Ok);
    let mut session = harness.session();

    let endpoint = session.start(socks5(credentials()), tun()).await.unwrap();

    assert_eq!(endpoint, LocalEndpoint::new("127.0.0.1", RELAY_PORT));
    assert_eq!(count(&harness.events, "server:start:socks.example"), 1);
}

#[tokio::test]
async fn authenticated_socks5_without_relay_is_unsupported() {
    let mut harness = Harness::new();
    harness.mode(ModeFeatureSet::NONE, None, Outcome::Ok, Outcome::Ok);
    let mut session = harness.session();

    let err = session.start(socks5(credentials()), tun()).await.unwrap_err();

    assert!(matches!(err, Error::UnsupportedServer { ref protocol } if protocol == "socks5"));
    assert_eq!(session.state(), SessionState::Idle);
    assert!(harness.events().is_empty());
}

#[tokio::test]
async fn unresolvable_hostname_touches_nothing() {
    let mut harness = Harness::new();
    harness
        .relay("shadowsocks", Outcome::Ok)
        .mode(ModeFeatureSet::NONE, None, Outcome::Ok, Outcome::Ok);
    harness.dns = None;
    let mut session = harness.session();

    let err = session
        .start(relayed("nowhere.invalid"), tun())
        .await
        .unwrap_err();

    assert!(matches!(err, Error::Resolution { ref hostname } if hostname == "nowhere.invalid"));
    assert_eq!(session.state(), SessionState::Idle);
    assert!(harness.events().is_empty());
    assert!(harness.inspector.queried.lock().unwrap().is_empty());
    assert!(harness.background.is_empty());
    assert_eq!(*harness.status.resets.lock().unwrap(), 0);
}

#[tokio::test]
async fn unresolvable_restart_keeps_running_session() {
    let mut harness = Harness::new();
    harness
        .relay("shadowsocks", Outcome::Ok)
        .mode(ModeFeatureSet::NONE, None, Outcome::Ok, Outcome::Ok);
    let mut session = harness.session();
    let endpoint = session.start(relayed("relay.example"), tun()).await.unwrap();
    let events_before = harness.events();

    let err = session
        .start(relayed("nowhere.invalid"), Mode::SystemProxy(SystemProxyMode::default()))
        .await
        .unwrap_err();

    assert!(matches!(err, Error::Resolution { ref hostname } if hostname == "nowhere.invalid"));
    assert_eq!(session.state(), SessionState::Running);
    assert_eq!(
        session.server().map(UpstreamServer::hostname),
        Some("relay.example")
    );
    assert_eq!(session.mode().map(Mode::mode_type), Some(ModeType::Tun));
    assert_eq!(session.local_endpoint(), Some(&endpoint));
    assert_eq!(harness.events(), events_before);
    assert_eq!(*harness.status.resets.lock().unwrap(), 0);
}

#[tokio::test]
async fn foreign_port_holder_aborts_start_without_killing() {
    let mut harness = Harness::new();
    harness
        .relay("shadowsocks", Outcome::Ok)
        .mode(ModeFeatureSet::NONE, None, Outcome::Ok, Outcome::Ok);
    harness.inspector.hold(RELAY_PORT, 4242, "/usr/bin/other-proxy");
    let mut session = harness.session();

    let err = session.start(relayed("relay.example"), tun()).await.unwrap_err();

    match err {
        Error::ForeignPortHolder { port, pid, path, .. } => {
            assert_eq!(port, RELAY_PORT);
            assert_eq!(pid, 4242);
            assert_eq!(path, PathBuf::from("/usr/bin/other-proxy"));
        }
        other => panic!("unexpected {other:?}"),
    }
    assert!(harness.inspector.killed.lock().unwrap().is_empty());
    assert_eq!(session.state(), SessionState::Idle);
    assert_eq!(count(&harness.events, "server:start:relay.example"), 0);
}

#[tokio::test]
async fn stale_own_instance_is_cleared_before_start() {
    let mut harness = Harness::new();
    harness
        .relay("shadowsocks", Outcome::Ok)
        .mode(ModeFeatureSet::NONE, Some(53), Outcome::Ok, Outcome::Ok);
    harness
        .inspector
        .hold(RELAY_PORT, 777, &format!("{INSTALL_DIR}/bin/relay"));
    harness
        .inspector
        .hold(53, 778, &format!("{INSTALL_DIR}/bin/dns-forwarder"));
    let mut session = harness.session();

    session.start(relayed("relay.example"), tun()).await.unwrap();

    assert_eq!(*harness.inspector.killed.lock().unwrap(), vec![778, 777]);
    assert_eq!(
        harness.status.ports.lock().unwrap().last().copied(),
        Some(PortReport {
            socks: RELAY_PORT,
            mode_listener: Some(53),
        })
    );
}

#[tokio::test]
async fn reserved_port_is_reported_distinctly() {
    let mut harness = Harness::new();
    harness
        .relay("shadowsocks", Outcome::Ok)
        .mode(ModeFeatureSet::NONE, None, Outcome::Ok, Outcome::Ok);
    harness
        .inspector
        .availability
        .lock()
        .unwrap()
        .insert(RELAY_PORT, PortAvailability::ReservedBySystem);
    let mut session = harness.session();

    let err = session.start(relayed("relay.example"), tun()).await.unwrap_err();

    assert_eq!(err.code(), "PORT_RESERVED");
    assert_eq!(err.port(), Some(RELAY_PORT));
    assert_eq!(session.state(), SessionState::Idle);
}

#[tokio::test]
async fn mode_failure_unwinds_started_server() {
    let mut harness = Harness::new();
    harness
        .relay("shadowsocks", Outcome::Ok)
        .mode(ModeFeatureSet::NONE, None, Outcome::Fail, Outcome::Ok);
    let mut session = harness.session();

    let err = session.start(relayed("relay.example"), tun()).await.unwrap_err();

    assert!(matches!(
        err,
        Error::SubsystemStart { ref component, ref message }
            if component == "TUN" && message == "handshake refused"
    ));
    assert_eq!(count(&harness.events, "server:stop"), 1);
    assert_eq!(count(&harness.events, "mode:stop"), 1);
    assert_eq!(session.state(), SessionState::Idle);
    assert!(session.local_endpoint().is_none());
    assert!(*harness.status.resets.lock().unwrap() >= 1);
}

#[tokio::test]
async fn server_failure_never_starts_mode() {
    let mut harness = Harness::new();
    harness
        .relay("shadowsocks", Outcome::Fail)
        .mode(ModeFeatureSet::NONE, None, Outcome::Ok, Outcome::Ok);
    let mut session = harness.session();

    let err = session.start(relayed("relay.example"), tun()).await.unwrap_err();

    assert!(matches!(err, Error::SubsystemStart { ref component, .. } if component == "Relay"));
    assert_eq!(
        harness.events(),
        vec![
            "server:start:relay.example".to_string(),
            "server:stop".to_string(),
        ]
    );
    assert_eq!(session.state(), SessionState::Idle);
}

#[tokio::test]
async fn missing_component_is_reported_as_runtime_error() {
    let mut harness = Harness::new();
    harness
        .relay("shadowsocks", Outcome::Ok)
        .mode(ModeFeatureSet::NONE, None, Outcome::Missing, Outcome::Ok);
    let mut session = harness.session();

    let err = session.start(relayed("relay.example"), tun()).await.unwrap_err();

    match err {
        Error::MissingRuntimeComponent { component, detail } => {
            assert_eq!(component, "TUN");
            assert_eq!(detail, "bin/wintun.dll");
        }
        other => panic!("unexpected {other:?}"),
    }
    assert_eq!(count(&harness.events, "server:stop"), 1);
}

#[tokio::test]
async fn unregistered_mode_fails_before_any_adapter_runs() {
    let mut harness = Harness::new();
    harness.relay("shadowsocks", Outcome::Ok);
    let mut session = harness.session();

    let err = session
        .start(
            relayed("relay.example"),
            Mode::SystemProxy(SystemProxyMode::default()),
        )
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        Error::UnsupportedMode {
            mode: ModeType::SystemProxy
        }
    ));
    assert!(harness.events().is_empty());
}

#[tokio::test]
async fn stop_is_idempotent_and_absorbs_errors() {
    let mut harness = Harness::new();
    harness
        .relay("shadowsocks", Outcome::Ok)
        .mode(ModeFeatureSet::NONE, None, Outcome::Ok, Outcome::Fail);
    let mut session = harness.session();

    session.stop().await;
    assert_eq!(session.state(), SessionState::Idle);
    assert!(harness.events().is_empty());

    session.start(relayed("relay.example"), tun()).await.unwrap();
    session.stop().await;
    session.stop().await;

    assert_eq!(session.state(), SessionState::Idle);
    assert_eq!(count(&harness.events, "server:stop"), 1);
    assert_eq!(count(&harness.events, "mode:stop"), 1);
    assert_eq!(*harness.status.resets.lock().unwrap(), 1);
}

#[tokio::test]
async fn restart_replaces_running_session() {
    let mut harness = Harness::new();
    harness
        .relay("shadowsocks", Outcome::Ok)
        .mode(ModeFeatureSet::NONE, None, Outcome::Ok, Outcome::Ok);
    let mut session = harness.session();

    session.start(relayed("first.example"), tun()).await.unwrap();
    session.start(relayed("second.example"), tun()).await.unwrap();

    assert_eq!(count(&harness.events, "server:stop"), 1);
    assert_eq!(count(&harness.events, "mode:stop"), 1);
    assert_eq!(
        session.server().map(UpstreamServer::hostname),
        Some("second.example")
    );
    assert!(session.is_running());
}

#[tokio::test]
async fn host_maintenance_runs_in_background() {
    let mut harness = Harness::new();
    harness
        .relay("shadowsocks", Outcome::Ok)
        .mode(ModeFeatureSet::NONE, None, Outcome::Ok, Outcome::Ok);
    let mut session = harness.session();

    session.start(relayed("relay.example"), tun()).await.unwrap();
    harness.background.shutdown().await;

    let events = harness.maintenance.events.lock().unwrap().clone();
    assert!(events.contains(&"dns-cache".to_string()));
    assert!(events.contains(&"firewall".to_string()));
    assert!(events.contains(&"snapshot:127.0.0.1:1080".to_string()));
    assert!(session.is_running());
}

#[tokio::test]
async fn probe_reports_bound_port_of_running_endpoint() {
    let mut harness = Harness::new();
    harness
        .relay("shadowsocks", Outcome::Ok)
        .mode(ModeFeatureSet::NONE, None, Outcome::Ok, Outcome::Ok);
    let mut session = harness.session();
    session.start(relayed("relay.example"), tun()).await.unwrap();

    let bound = session
        .probe_outbound_connect(&CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(bound, Some(49152));
}

#[tokio::test]
async fn probe_failure_is_a_diagnostic_error() {
    let mut harness = Harness::new();
    harness.mode(ModeFeatureSet::NONE, None, Outcome::Ok, Outcome::Ok);
    let mut session = harness.session();
    session.start(socks5(None), tun()).await.unwrap();

    let err = session
        .probe_outbound_connect(&CancellationToken::new())
        .await
        .unwrap_err();

    assert_eq!(err.code(), "DIAGNOSTIC");
    assert!(session.is_running());
}

#[tokio::test]
async fn cancelled_nat_discovery_leaves_session_running() {
    let mut harness = Harness::new();
    harness
        .relay("shadowsocks", Outcome::Ok)
        .mode(ModeFeatureSet::NONE, None, Outcome::Ok, Outcome::Ok);
    let mut session = harness.session();
    let endpoint = session.start(relayed("relay.example"), tun()).await.unwrap();

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(20)).await;
        trigger.cancel();
    });

    let result = session.discover_nat_type(&cancel).await;

    assert!(matches!(result, Err(Error::Cancelled)));
    assert!(session.is_running());
    assert_eq!(session.local_endpoint(), Some(&endpoint));
    assert_eq!(count(&harness.events, "server:stop"), 0);
}

#[tokio::test]
#[should_panic(expected = "diagnostics require a running session")]
async fn nat_discovery_on_idle_session_panics() {
    let harness = Harness::new();
    let session = harness.session();
    let _ = session.discover_nat_type(&CancellationToken::new()).await;
}
