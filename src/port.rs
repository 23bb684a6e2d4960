use std::collections::BTreeSet;
use std::io;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use socket2::{Domain, Protocol, Socket, Type};
use sysinfo::{Pid, ProcessRefreshKind, ProcessStatus, ProcessesToUpdate, System, UpdateKind};

use crate::core::observability;
use crate::error::{Error, Result};

/// A process bound to a TCP port.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortHolder {
    pub pid: u32,
    /// Executable path; empty when the OS would not tell us.
    pub path: PathBuf,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortScope {
    Tcp,
    Udp,
    Both,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortAvailability {
    Available,
    InUse,
    ReservedBySystem,
}

/// OS-level view of port ownership.
#[async_trait]
pub trait PortInspector: Send + Sync {
    async fn processes_using_tcp_port(&self, port: u16) -> io::Result<Vec<PortHolder>>;

    /// Kill `pid` and wait until it has exited, at most `timeout`.
    async fn terminate(&self, pid: u32, timeout: Duration) -> io::Result<()>;

    fn check_port_available(&self, port: u16, scope: PortScope) -> PortAvailability;
}

/// Frees ports held by stale instances of this application.
///
/// A single pass: holders under `install_dir` are killed, any other holder is
/// a conflict, and whatever remains shows up in the final availability check.
pub struct PortReconciler {
    inspector: Arc<dyn PortInspector>,
    install_dir: PathBuf,
    terminate_timeout: Duration,
}

impl PortReconciler {
    pub fn new(
        inspector: Arc<dyn PortInspector>,
        install_dir: impl Into<PathBuf>,
        terminate_timeout: Duration,
    ) -> Self {
        let install_dir = install_dir.into();
        let install_dir = install_dir.canonicalize().unwrap_or(install_dir);
        Self {
            inspector,
            install_dir,
            terminate_timeout,
        }
    }

    pub async fn reconcile(&self, port: u16, label: &str) -> Result<()> {
        let holders = match self.inspector.processes_using_tcp_port(port).await {
            Ok(holders) => holders,
            Err(e) => {
                tracing::warn!(port, label, error = %e, "Could not enumerate port holders");
                Vec::new()
            }
        };

        let own_pid = std::process::id();
        for holder in holders {
            if holder.pid == own_pid {
                continue;
            }

            if !self.is_self_owned(&holder.path) {
                tracing::warn!(
                    port,
                    label,
                    pid = holder.pid,
                    path = %holder.path.display(),
                    "Port held by a foreign process"
                );
                return Err(Error::ForeignPortHolder {
                    port,
                    label: label.to_string(),
                    pid: holder.pid,
                    path: holder.path,
                });
            }

            tracing::info!(
                port,
                label,
                pid = holder.pid,
                path = %holder.path.display(),
                "Terminating stale instance holding port"
            );
            match self.inspector.terminate(holder.pid, self.terminate_timeout).await {
                Ok(()) => observability::record_stale_instance_terminated(),
                Err(e) => {
                    tracing::warn!(port, pid = holder.pid, error = %e, "Failed to terminate stale instance")
                }
            }
        }

        match self.inspector.check_port_available(port, PortScope::Tcp) {
            PortAvailability::Available => Ok(()),
            PortAvailability::InUse => Err(Error::PortInUse {
                port,
                label: label.to_string(),
            }),
            PortAvailability::ReservedBySystem => Err(Error::PortReserved {
                port,
                label: label.to_string(),
            }),
        }
    }

    fn is_self_owned(&self, path: &Path) -> bool {
        if path.as_os_str().is_empty() {
            return false;
        }
        let path = path.canonicalize().unwrap_or_else(|_| path.to_path_buf());
        path.starts_with(&self.install_dir)
    }
}

/// Port inspector backed by the running operating system.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemPortInspector;

impl SystemPortInspector {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl PortInspector for SystemPortInspector {
    async fn processes_using_tcp_port(&self, port: u16) -> io::Result<Vec<PortHolder>> {
        tokio::task::spawn_blocking(move || {
            let pids = platform::tcp_port_owners(port)?;
            Ok(executable_paths(&pids))
        })
        .await
        .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?
    }

    async fn terminate(&self, pid: u32, timeout: Duration) -> io::Result<()> {
        tokio::task::spawn_blocking(move || kill_and_wait(pid, timeout))
            .await
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?
    }

    fn check_port_available(&self, port: u16, scope: PortScope) -> PortAvailability {
        let tcp = || probe_bind(port, Type::STREAM, Protocol::TCP);
        let udp = || probe_bind(port, Type::DGRAM, Protocol::UDP);
        match scope {
            PortScope::Tcp => tcp(),
            PortScope::Udp => udp(),
            PortScope::Both => match tcp() {
                PortAvailability::Available => udp(),
                blocked => blocked,
            },
        }
    }
}

/// Binds the wildcard address of both families; the worse answer wins.
fn probe_bind(port: u16, ty: Type, protocol: Protocol) -> PortAvailability {
    let v4 = bind_family(port, Domain::IPV4, ty, protocol);
    if v4 == PortAvailability::InUse {
        return v4;
    }
    match bind_family(port, Domain::IPV6, ty, protocol) {
        PortAvailability::Available => v4,
        v6 if v4 == PortAvailability::Available || v6 == PortAvailability::InUse => v6,
        _ => v4,
    }
}

fn bind_family(port: u16, domain: Domain, ty: Type, protocol: Protocol) -> PortAvailability {
    let ipv6 = domain == Domain::IPV6;
    let socket = match Socket::new(domain, ty, Some(protocol)) {
        Ok(socket) => socket,
        // No IPv6 stack on this host.
        Err(_) if ipv6 => return PortAvailability::Available,
        Err(e) => return classify_bind_error(port, &e),
    };
    let result = (|| {
        // Listeners on unix set SO_REUSEADDR, so lingering TIME_WAIT entries
        // must not count as "in use".
        #[cfg(unix)]
        socket.set_reuse_address(true)?;
        let addr = if ipv6 {
            socket.set_only_v6(true)?;
            SocketAddr::from((Ipv6Addr::UNSPECIFIED, port))
        } else {
            SocketAddr::from((Ipv4Addr::UNSPECIFIED, port))
        };
        socket.bind(&addr.into())
    })();

    match result {
        Ok(()) => PortAvailability::Available,
        Err(e) if ipv6 && e.kind() == io::ErrorKind::AddrNotAvailable => {
            PortAvailability::Available
        }
        Err(e) => classify_bind_error(port, &e),
    }
}

fn classify_bind_error(port: u16, e: &io::Error) -> PortAvailability {
    match e.kind() {
        io::ErrorKind::AddrInUse => PortAvailability::InUse,
        io::ErrorKind::PermissionDenied | io::ErrorKind::AddrNotAvailable => {
            PortAvailability::ReservedBySystem
        }
        _ => {
            tracing::debug!(port, error = %e, "Unexpected bind probe failure");
            PortAvailability::InUse
        }
    }
}

fn executable_paths(pids: &BTreeSet<u32>) -> Vec<PortHolder> {
    if pids.is_empty() {
        return Vec::new();
    }
    let targets: Vec<Pid> = pids.iter().map(|pid| Pid::from_u32(*pid)).collect();
    let mut system = System::new();
    system.refresh_processes_specifics(
        ProcessesToUpdate::Some(&targets),
        true,
        ProcessRefreshKind::nothing().with_exe(UpdateKind::OnlyIfNotSet),
    );

    pids.iter()
        .map(|pid| PortHolder {
            pid: *pid,
            path: system
                .process(Pid::from_u32(*pid))
                .and_then(|p| p.exe())
                .map(Path::to_path_buf)
                .unwrap_or_default(),
        })
        .collect()
}

fn kill_and_wait(pid: u32, timeout: Duration) -> io::Result<()> {
    let target = Pid::from_u32(pid);
    let mut system = System::new();
    let refresh = |system: &mut System| {
        system.refresh_processes(ProcessesToUpdate::Some(&[target]), true);
        system
            .process(target)
            .map_or(false, |p| p.status() != ProcessStatus::Zombie)
    };

    if !refresh(&mut system) {
        return Ok(());
    }
    let signalled = system.process(target).map_or(false, |p| p.kill());
    if !signalled {
        return Err(io::Error::new(
            io::ErrorKind::PermissionDenied,
            format!("could not signal process {pid}"),
        ));
    }

    let deadline = Instant::now() + timeout;
    while refresh(&mut system) {
        if Instant::now() >= deadline {
            return Err(io::Error::new(
                io::ErrorKind::TimedOut,
                format!("process {pid} did not exit within {timeout:?}"),
            ));
        }
        std::thread::sleep(Duration::from_millis(50));
    }
    Ok(())
}

#[cfg(target_os = "linux")]
mod platform {
    use std::collections::BTreeSet;
    use std::fs;
    use std::io;

    pub fn tcp_port_owners(port: u16) -> io::Result<BTreeSet<u32>> {
        let mut inodes = BTreeSet::new();
        for table in ["/proc/net/tcp", "/proc/net/tcp6"] {
            if let Ok(content) = fs::read_to_string(table) {
                inodes.extend(socket_inodes(&content, port));
            }
        }
        if inodes.is_empty() {
            return Ok(BTreeSet::new());
        }
        Ok(pids_owning(&inodes))
    }

    /// Inodes of sockets in a `/proc/net/tcp` table whose local port matches.
    pub(super) fn socket_inodes(table: &str, port: u16) -> Vec<u64> {
        table
            .lines()
            .skip(1)
            .filter_map(|line| {
                let parts: Vec<&str> = line.split_whitespace().collect();
                if parts.len() < 10 {
                    return None;
                }
                let local_port = parts[1].rsplit(':').next()?;
                if u16::from_str_radix(local_port, 16).ok()? != port {
                    return None;
                }
                // TIME_WAIT entries have no owning socket.
                parts[9].parse::<u64>().ok().filter(|inode| *inode != 0)
            })
            .collect()
    }

    fn pids_owning(inodes: &BTreeSet<u64>) -> BTreeSet<u32> {
        let mut pids = BTreeSet::new();
        let Ok(proc_dir) = fs::read_dir("/proc") else {
            return pids;
        };

        for entry in proc_dir.flatten() {
            let Some(pid) = entry.file_name().to_str().and_then(|n| n.parse::<u32>().ok()) else {
                continue;
            };
            let Ok(fds) = fs::read_dir(entry.path().join("fd")) else {
                continue;
            };
            let owns = fds.flatten().any(|fd| {
                fs::read_link(fd.path())
                    .ok()
                    .and_then(|link| {
                        link.to_str()?
                            .strip_prefix("socket:[")?
                            .strip_suffix(']')?
                            .parse::<u64>()
                            .ok()
                    })
                    .map_or(false, |inode| inodes.contains(&inode))
            });
            if owns {
                pids.insert(pid);
            }
        }
        pids
    }
}

#[cfg(all(unix, not(target_os = "linux")))]
mod platform {
    use std::collections::BTreeSet;
    use std::io;
    use std::process::Command;

    pub fn tcp_port_owners(port: u16) -> io::Result<BTreeSet<u32>> {
        let output = Command::new("lsof")
            .args(["-nP", &format!("-iTCP:{port}"), "-t"])
            .output()?;
        Ok(String::from_utf8_lossy(&output.stdout)
            .lines()
            .filter_map(|line| line.trim().parse::<u32>().ok())
            .collect())
    }
}

#[cfg(windows)]
mod platform {
    use std::collections::BTreeSet;
    use std::io;
    use std::process::Command;

    pub fn tcp_port_owners(port: u16) -> io::Result<BTreeSet<u32>> {
        let output = Command::new("netstat").args(["-ano"]).output()?;
        Ok(parse_netstat(&String::from_utf8_lossy(&output.stdout), port))
    }

    fn parse_netstat(text: &str, port: u16) -> BTreeSet<u32> {
        text.lines()
            .filter_map(|line| {
                let parts: Vec<&str> = line.split_whitespace().collect();
                if parts.len() < 4 || !parts[0].eq_ignore_ascii_case("TCP") {
                    return None;
                }
                let local_port = parts[1].rsplit(':').next()?.parse::<u16>().ok()?;
                if local_port != port {
                    return None;
                }
                parts.last()?.parse::<u32>().ok().filter(|pid| *pid != 0)
            })
            .collect()
    }
}
