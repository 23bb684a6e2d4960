use std::panic::{self, AssertUnwindSafe};

/// Ports reported to the status display once a session is running.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortReport {
    pub socks: u16,
    pub mode_listener: Option<u16>,
}

/// Receives human-readable progress from the orchestrator.
pub trait StatusSink: Send + Sync {
    fn starting(&self, text: &str);
    fn ports(&self, report: &PortReport);
    /// Clears any displayed port information.
    fn reset(&self);
}

/// Sink that writes status updates to the log.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogStatus;

impl StatusSink for LogStatus {
    fn starting(&self, text: &str) {
        tracing::info!("{}", text);
    }

    fn ports(&self, report: &PortReport) {
        match report.mode_listener {
            Some(listener) => tracing::info!(socks = report.socks, listener, "Session ports"),
            None => tracing::info!(socks = report.socks, "Session ports"),
        }
    }

    fn reset(&self) {
        tracing::debug!("Status cleared");
    }
}

/// Runs a sink callback; a panicking sink is logged and otherwise ignored.
pub(crate) fn notify<F>(event: &'static str, f: F)
where
    F: FnOnce(),
{
    if panic::catch_unwind(AssertUnwindSafe(f)).is_err() {
        tracing::warn!(event, "Status sink panicked; continuing");
    }
}
