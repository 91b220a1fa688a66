//! Phase notifications for job monitoring.
//!
//! The dispatcher announces where a job is (connecting, sending, waiting on
//! the preprocessor, waiting on the remote compiler) through a [`Monitor`].
//! The default implementation logs through `tracing`; tests install a
//! recording double to assert on ordering.

use std::sync::Mutex;
use tracing::info;

/// Where a job currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Opening the transport to the server.
    Connect,
    /// Framing and sending the request.
    Send,
    /// Waiting for the local preprocessor.
    Cpp,
    /// Waiting for the remote compiler.
    Compile,
}

impl Phase {
    pub fn as_str(self) -> &'static str {
        match self {
            Phase::Connect => "connect",
            Phase::Send => "send",
            Phase::Cpp => "cpp",
            Phase::Compile => "compile",
        }
    }
}

/// Which side of the wire the phase's work happens on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Locality {
    Local,
    Remote,
}

impl Locality {
    pub fn as_str(self) -> &'static str {
        match self {
            Locality::Local => "local",
            Locality::Remote => "remote",
        }
    }
}

/// Sink for phase notifications.
pub trait Monitor: Send + Sync {
    fn note_phase(&self, phase: Phase, file: Option<&str>, host: Option<&str>, locality: Locality);
}

/// Logs each phase through `tracing`.
#[derive(Debug, Default)]
pub struct TracingMonitor;

impl Monitor for TracingMonitor {
    fn note_phase(&self, phase: Phase, file: Option<&str>, host: Option<&str>, locality: Locality) {
        info!(
            phase = phase.as_str(),
            file = file.unwrap_or("-"),
            host = host.unwrap_or("-"),
            locality = locality.as_str(),
            "phase"
        );
    }
}

/// Emits one JSON line per phase change, for build tooling that watches
/// job progress rather than humans reading logs.
pub struct JsonMonitor<W: std::io::Write + Send> {
    out: Mutex<W>,
}

impl JsonMonitor<std::io::Stderr> {
    pub fn stderr() -> Self {
        Self::new(std::io::stderr())
    }
}

impl<W: std::io::Write + Send> JsonMonitor<W> {
    pub fn new(out: W) -> Self {
        Self { out: Mutex::new(out) }
    }
}

impl<W: std::io::Write + Send> Monitor for JsonMonitor<W> {
    fn note_phase(&self, phase: Phase, file: Option<&str>, host: Option<&str>, locality: Locality) {
        let line = serde_json::json!({
            "event": "phase",
            "phase": phase.as_str(),
            "file": file,
            "host": host,
            "locality": locality.as_str(),
        });
        if let Ok(mut out) = self.out.lock() {
            let _ = writeln!(out, "{line}");
        }
    }
}

/// One recorded notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PhaseEvent {
    pub phase: Phase,
    pub file: Option<String>,
    pub host: Option<String>,
    pub locality: Locality,
}

/// Captures the notification sequence for assertions.
#[derive(Debug, Default)]
pub struct RecordingMonitor {
    events: Mutex<Vec<PhaseEvent>>,
}

impl RecordingMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<PhaseEvent> {
        self.events.lock().map(|e| e.clone()).unwrap_or_default()
    }

    pub fn phases(&self) -> Vec<Phase> {
        self.events().into_iter().map(|e| e.phase).collect()
    }
}

impl Monitor for RecordingMonitor {
    fn note_phase(&self, phase: Phase, file: Option<&str>, host: Option<&str>, locality: Locality) {
        if let Ok(mut events) = self.events.lock() {
            events.push(PhaseEvent {
                phase,
                file: file.map(str::to_string),
                host: host.map(str::to_string),
                locality,
            });
        }
    }
}
