//! Event system for UI decoupling.
//!
//! The engine reports what it is doing through an observer so a display
//! layer can show progress without being wired into the protocol code.

use std::fmt;

use crate::engine::ProtocolState;
use crate::transport::TransportKind;

/// Log level for events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

/// Events emitted by the agent.
#[derive(Debug, Clone)]
pub enum AgentEvent {
    /// A host connected over some transport.
    Connected { transport: TransportKind },
    /// The connection ended.
    Disconnected { transport: TransportKind },
    /// Protocol state changed.
    StateChanged {
        from: ProtocolState,
        to: ProtocolState,
    },
    /// A command line was received.
    Command { line: String },
    /// A command finished.
    CommandResult { ok: bool, message: String },
    /// Progress of a long operation.
    Progress {
        operation: String,
        current: u64,
        total: u64,
    },
    /// User-facing status message.
    Message { level: LogLevel, message: String },
}

/// Observer trait for receiving agent events.
pub trait AgentObserver: Send + Sync {
    /// Called when an event occurs.
    fn on_event(&self, event: &AgentEvent);
}

/// No-op observer that discards all events.
pub struct NullObserver;

impl AgentObserver for NullObserver {
    fn on_event(&self, _event: &AgentEvent) {}
}

/// Observer that logs events using tracing.
pub struct TracingObserver;

impl AgentObserver for TracingObserver {
    fn on_event(&self, event: &AgentEvent) {
        match event {
            AgentEvent::Connected { transport } => {
                tracing::info!(transport = %transport, "Host connected");
            }
            AgentEvent::Disconnected { transport } => {
                tracing::info!(transport = %transport, "Host disconnected");
            }
            AgentEvent::StateChanged { from, to } => {
                tracing::trace!(from = %from, to = %to, "State changed");
            }
            AgentEvent::Command { line } => {
                tracing::info!(command = %line, "Command received");
            }
            AgentEvent::CommandResult { ok, message } => {
                if *ok {
                    tracing::debug!(message = %message, "Command succeeded");
                } else {
                    tracing::warn!(message = %message, "Command failed");
                }
            }
            AgentEvent::Progress {
                operation,
                current,
                total,
            } => {
                let pct = if *total > 0 {
                    (*current * 100) / *total
                } else {
                    0
                };
                tracing::debug!(operation = %operation, progress = %format!("{}%", pct), "Progress");
            }
            AgentEvent::Message { level, message } => match level {
                LogLevel::Trace => tracing::trace!("{}", message),
                LogLevel::Debug => tracing::debug!("{}", message),
                LogLevel::Info => tracing::info!("{}", message),
                LogLevel::Warn => tracing::warn!("{}", message),
                LogLevel::Error => tracing::error!("{}", message),
            },
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LogLevel::Trace => write!(f, "TRACE"),
            LogLevel::Debug => write!(f, "DEBUG"),
            LogLevel::Info => write!(f, "INFO"),
            LogLevel::Warn => write!(f, "WARN"),
            LogLevel::Error => write!(f, "ERROR"),
        }
    }
}

/// Observer that keeps every event, for tests.
#[derive(Default)]
pub struct RecordingObserver {
    events: std::sync::Mutex<Vec<AgentEvent>>,
}

impl RecordingObserver {
    pub fn events(&self) -> Vec<AgentEvent> {
        self.events
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
    }
}

impl AgentObserver for RecordingObserver {
    fn on_event(&self, event: &AgentEvent) {
        self.events
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .push(event.clone());
    }
}
