use std::fmt::Display;
use std::future::Future;
use std::io;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use sysinfo::{Pid, ProcessRefreshKind, ProcessesToUpdate, System};
use tokio::process::Command;
use tokio::task::JoinSet;

use crate::descriptor::LocalEndpoint;
use crate::port::PortInspector;

/// Host-level side effects run around a session start. None of them decide
/// whether the start succeeds.
#[async_trait]
pub trait HostMaintenance: Send + Sync {
    async fn refresh_dns_cache(&self) -> io::Result<()>;
    async fn install_firewall_rules(&self) -> io::Result<()>;
    async fn diagnostic_snapshot(&self, endpoint: &LocalEndpoint) -> io::Result<()>;
}

/// Maintenance through the platform's own tools.
pub struct SystemMaintenance {
    inspector: Arc<dyn PortInspector>,
}

impl SystemMaintenance {
    pub fn new(inspector: Arc<dyn PortInspector>) -> Self {
        Self { inspector }
    }
}

async fn run(program: &str, args: &[&str]) -> io::Result<()> {
    let output = Command::new(program).args(args).output().await?;
    if output.status.success() {
        Ok(())
    } else {
        Err(io::Error::new(
            io::ErrorKind::Other,
            format!(
                "{program} exited with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            ),
        ))
    }
}

#[async_trait]
impl HostMaintenance for SystemMaintenance {
    async fn refresh_dns_cache(&self) -> io::Result<()> {
        if cfg!(windows) {
            run("ipconfig", &["/flushdns"]).await
        } else if cfg!(target_os = "macos") {
            run("dscacheutil", &["-flushcache"]).await
        } else if cfg!(target_os = "linux") {
            run("resolvectl", &["flush-caches"]).await
        } else {
            Ok(())
        }
    }

    async fn install_firewall_rules(&self) -> io::Result<()> {
        if !cfg!(windows) {
            return Ok(());
        }
        let exe = std::env::current_exe()?;
        let name = exe
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "tunnel-orchestrator".to_string());
        run(
            "netsh",
            &[
                "advfirewall",
                "firewall",
                "add",
                "rule",
                &format!("name={name}"),
                &format!("program={}", exe.display()),
                "dir=in",
                "action=allow",
                "enable=yes",
            ],
        )
        .await
    }

    async fn diagnostic_snapshot(&self, endpoint: &LocalEndpoint) -> io::Result<()> {
        let holders = self.inspector.processes_using_tcp_port(endpoint.port).await?;
        for holder in &holders {
            tracing::debug!(
                port = endpoint.port,
                pid = holder.pid,
                path = %holder.path.display(),
                "Endpoint listener"
            );
        }

        let pid = Pid::from_u32(std::process::id());
        let mut system = System::new();
        system.refresh_processes_specifics(
            ProcessesToUpdate::Some(&[pid]),
            true,
            ProcessRefreshKind::nothing().with_memory().with_cpu(),
        );
        if let Some(process) = system.process(pid) {
            tracing::debug!(
                endpoint = %endpoint,
                listeners = holders.len(),
                memory = process.memory(),
                "Session snapshot"
            );
        }
        Ok(())
    }
}

/// Detached tasks that live as long as their owner, not as long as the call
/// that spawned them. Failures are logged and never surfaced.
#[derive(Default)]
pub struct BackgroundTasks {
    tasks: Mutex<JoinSet<()>>,
}

impl BackgroundTasks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn spawn<F, E>(&self, label: &'static str, task: F)
    where
        F: Future<Output = Result<(), E>> + Send + 'static,
        E: Display + Send + 'static,
    {
        self.reap();
        let Ok(mut tasks) = self.tasks.lock() else {
            tracing::warn!(task = label, "Background task group poisoned; task dropped");
            return;
        };
        tasks.spawn(async move {
            match task.await {
                Ok(()) => tracing::debug!(task = label, "Background task finished"),
                Err(e) => tracing::warn!(task = label, error = %e, "Background task failed"),
            }
        });
    }

    /// Drop finished tasks so the set does not grow across sessions.
    pub fn reap(&self) {
        if let Ok(mut tasks) = self.tasks.lock() {
            while tasks.try_join_next().is_some() {}
        }
    }

    /// Number of tasks not yet reaped.
    pub fn len(&self) -> usize {
        self.tasks.lock().map(|t| t.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Wait for every outstanding task.
    pub async fn shutdown(&self) {
        let mut tasks = match self.tasks.lock() {
            Ok(mut guard) => std::mem::take(&mut *guard),
            Err(_) => return,
        };
        while tasks.join_next().await.is_some() {}
    }
}
