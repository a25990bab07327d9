// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 sshfwd Contributors

// sshfwd - Common Library
// Shared types, endpoint parsing, and tunnel configuration

pub mod config;
pub mod endpoint;
pub mod error;
pub mod network;
pub mod types;

pub use config::{
    default_config_path, find_config_file, BastionConfig, ConfigLoader, TunnelConfig,
};
pub use endpoint::Endpoint;
pub use error::{Error, Result};
pub use network::{format_host_port, is_loopback_address};
pub use types::{LogLevel, TunnelState, TunnelStatus};
