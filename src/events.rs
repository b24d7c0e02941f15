//! Status and log events pushed to whichever operator surface is attached.
//!
//! Delivery is best-effort: with no subscriber attached an event is dropped, never
//! queued or replayed. The latest connection status is kept as a snapshot so a surface
//! that attaches late can still render the current state.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, watch};

const EVENT_CAPACITY: usize = 256;

/// Severity of an operator log line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Info,
    Warn,
    Error,
    Success,
}

/// Connection state of the agent loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionStatus {
    Unconfigured,
    Connecting,
    Connected,
    Busy,
    Disconnected,
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConnectionStatus::Unconfigured => "unconfigured",
            ConnectionStatus::Connecting => "connecting",
            ConnectionStatus::Connected => "connected",
            ConnectionStatus::Busy => "busy",
            ConnectionStatus::Disconnected => "disconnected",
        };
        f.write_str(s)
    }
}

/// Latest `(status, message)` pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusSnapshot {
    pub status: ConnectionStatus,
    pub message: String,
}

/// Event delivered to the operator surface.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "kebab-case")]
pub enum AgentEvent {
    LogMessage {
        level: LogLevel,
        message: String,
        timestamp: DateTime<Utc>,
    },
    ConnectionStatus {
        status: ConnectionStatus,
        message: String,
    },
}

impl AgentEvent {
    /// SSE event name.
    pub fn name(&self) -> &'static str {
        match self {
            AgentEvent::LogMessage { .. } => "log-message",
            AgentEvent::ConnectionStatus { .. } => "connection-status",
        }
    }
}

/// Broadcast hub for log and status events.
#[derive(Debug, Clone)]
pub struct EventSink {
    tx: broadcast::Sender<AgentEvent>,
    status: std::sync::Arc<watch::Sender<StatusSnapshot>>,
}

impl Default for EventSink {
    fn default() -> Self {
        Self::new()
    }
}

impl EventSink {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(EVENT_CAPACITY);
        let (status, _) = watch::channel(StatusSnapshot {
            status: ConnectionStatus::Unconfigured,
            message: "Not configured.".to_string(),
        });
        Self {
            tx,
            status: std::sync::Arc::new(status),
        }
    }

    /// Attach a new surface. Only events sent after this call are received.
    pub fn subscribe(&self) -> broadcast::Receiver<AgentEvent> {
        self.tx.subscribe()
    }

    /// Current connection status.
    pub fn status(&self) -> StatusSnapshot {
        self.status.borrow().clone()
    }

    /// Push an operator log line.
    pub fn log(&self, level: LogLevel, message: impl Into<String>) {
        let message = message.into();
        match level {
            LogLevel::Info | LogLevel::Success => tracing::info!("{}", message),
            LogLevel::Warn => tracing::warn!("{}", message),
            LogLevel::Error => tracing::error!("{}", message),
        }
        // No receivers means no surface attached; the event is dropped.
        let _ = self.tx.send(AgentEvent::LogMessage {
            level,
            message,
            timestamp: Utc::now(),
        });
    }

    /// Push a connection status transition.
    pub fn update_status(&self, status: ConnectionStatus, message: impl Into<String>) {
        let message = message.into();
        tracing::debug!(%status, "{}", message);
        self.status.send_replace(StatusSnapshot {
            status,
            message: message.clone(),
        });
        let _ = self.tx.send(AgentEvent::ConnectionStatus { status, message });
    }
}
