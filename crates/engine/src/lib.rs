// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 sshfwd Contributors

// sshfwd - Tunnel Engine
// Local port listeners forwarded through SSH direct-tcpip channels

pub mod auth;
pub mod client;
pub mod error;
pub mod events;
mod forward;
pub mod known_hosts;
pub mod manager;
pub mod metrics;
pub mod settings;
pub mod ssh;
pub mod ssh_config;
pub mod transport;
pub mod tunnel;

pub use auth::{AuthResolver, Identity, SshAuth, SshConfigResolver};
pub use error::{is_connection_error, Result, TunnelError};
pub use known_hosts::{HostKeyCheck, HostKeyPolicy};
pub use manager::{EventStreams, TunnelManager};
pub use metrics::{format_latency, format_rate, MetricsSnapshot, TunnelMetrics};
pub use settings::EngineSettings;
pub use ssh::RusshConnector;
pub use transport::{BoxedStream, ForwardStream, SshConnector, SshSession};
pub use tunnel::Tunnel;
