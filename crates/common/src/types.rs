// Common types for sshfwd

use std::fmt;

use serde::{Deserialize, Serialize};

/// Lifecycle state of a tunnel as reported in status events
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum TunnelState {
    /// Not listening (initial, and after a stop request)
    Stopped,
    /// Listening and waiting for traffic, or (re)establishing the SSH client
    Connecting,
    /// At least one connection is forwarding through a live client
    Active,
    /// Last attempt failed; the next accepted connection retries
    Error,
}

impl TunnelState {
    pub fn as_str(&self) -> &'static str {
        match self {
            TunnelState::Stopped => "stopped",
            TunnelState::Connecting => "connecting",
            TunnelState::Active => "active",
            TunnelState::Error => "error",
        }
    }

    /// Check if the tunnel holds a bound listener in this state
    pub fn is_running(&self) -> bool {
        !matches!(self, TunnelState::Stopped)
    }
}

impl fmt::Display for TunnelState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Status transition emitted by a tunnel
///
/// Tunnels do not keep a history of these; whoever drains the status queue
/// keeps the latest value per id.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TunnelStatus {
    pub id: String,
    pub state: TunnelState,
    pub message: String,
}

impl TunnelStatus {
    pub fn new(id: impl Into<String>, state: TunnelState, message: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            state,
            message: message.into(),
        }
    }
}

/// Severity tag carried in tunnel log lines
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Debug,
    Error,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Debug => "DEBUG",
            LogLevel::Error => "ERROR",
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
