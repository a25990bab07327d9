// Error types for the tunnel engine

use thiserror::Error;

#[derive(Error, Debug)]
pub enum TunnelError {
    #[error("Failed to bind to {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Authentication setup failed: {0}")]
    Auth(String),

    #[error("SSH connection to {addr} failed: {reason}")]
    SshConnect { addr: String, reason: String },

    #[error("Remote dial to {target} failed: {reason}")]
    RemoteDial { target: String, reason: String },

    #[error("Tunnel {0} is already running")]
    AlreadyRunning(String),

    #[error("Tunnel {0} has been stopped and must be recreated")]
    Retired(String),

    #[error("Tunnel {0} must be stopped before its configuration can change")]
    Running(String),

    #[error("Key error: {0}")]
    Key(String),

    #[error("SSH error: {0}")]
    Ssh(#[from] russh::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Tunnel is shutting down")]
    ShuttingDown,

    #[error(transparent)]
    Config(#[from] sshfwd_common::Error),
}

impl TunnelError {
    /// Whether this failure means the SSH client itself is unusable
    ///
    /// Only the failure reason is classified, never the host names that
    /// appear in the rendered message.
    pub fn is_connection_error(&self) -> bool {
        match self {
            TunnelError::SshConnect { reason, .. } | TunnelError::RemoteDial { reason, .. } => {
                is_connection_error(reason)
            }
            TunnelError::Ssh(e) => is_connection_error(&e.to_string()),
            TunnelError::Io(e) => is_connection_error(&e.to_string()),
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, TunnelError>;

/// Substrings that mark a failure as fatal to the SSH client itself
const CONNECTION_ERROR_PATTERNS: &[&str] = &[
    "connection refused",
    "reset",
    "broken pipe",
    "timeout",
    "timed out",
    "disconnect",
    "connection lost",
];

/// Classify an error message as a connection-level failure
///
/// Matching is a case-insensitive substring search. A match means the
/// shared SSH client must be discarded rather than reused.
pub fn is_connection_error(message: &str) -> bool {
    let message = message.to_lowercase();
    CONNECTION_ERROR_PATTERNS
        .iter()
        .any(|pattern| message.contains(pattern))
}
