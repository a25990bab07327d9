// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 sshfwd Contributors

// SSH authentication resolution
//
// Turns a tunnel definition into everything needed to log into its SSH hop:
// the effective host/port/user after ~/.ssh/config overrides, the private
// keys to offer, the connect timeout, and the host key policy.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use russh::keys::{load_secret_key, PrivateKey};
use tracing::{debug, warn};

use sshfwd_common::{Endpoint, TunnelConfig};

use crate::error::{Result, TunnelError};
use crate::known_hosts::HostKeyCheck;
use crate::ssh_config::SshConfig;

pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Identity files tried when ~/.ssh/config names none
const DEFAULT_IDENTITIES: &[&str] = &["id_ed25519", "id_ecdsa", "id_rsa"];

/// A private key ready to offer to the server
#[derive(Clone)]
pub struct Identity {
    pub path: PathBuf,
    pub key: Arc<PrivateKey>,
}

impl fmt::Debug for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Identity").field("path", &self.path).finish_non_exhaustive()
    }
}

/// Resolved login for one SSH hop
#[derive(Debug, Clone)]
pub struct SshAuth {
    /// Effective hop after config overrides; `hop.user` is the login name
    pub hop: Endpoint,
    pub identities: Vec<Identity>,
    pub timeout: Duration,
    pub host_keys: HostKeyCheck,
}

impl SshAuth {
    pub fn user(&self) -> &str {
        &self.hop.user
    }
}

/// Produces SSH credentials for a tunnel
pub trait AuthResolver: Send + Sync {
    fn resolve(&self, config: &TunnelConfig) -> Result<SshAuth>;
}

/// Default resolver backed by the user's OpenSSH client configuration
#[derive(Debug, Clone)]
pub struct SshConfigResolver {
    ssh_dir: PathBuf,
    home_dir: PathBuf,
    default_user: Option<String>,
    host_keys: HostKeyCheck,
    timeout: Duration,
}

/// What to log in as and which key files to read, before touching any key
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthPlan {
    pub hop: Endpoint,
    pub key_paths: Vec<PathBuf>,
}

impl SshConfigResolver {
    /// Use `~/.ssh`, `$USER` and the default known_hosts location
    pub fn from_env() -> Result<Self> {
        let home_dir = dirs::home_dir()
            .ok_or_else(|| TunnelError::Auth("could not determine home directory".to_string()))?;
        let default_user = std::env::var("USER")
            .or_else(|_| std::env::var("USERNAME"))
            .ok()
            .filter(|u| !u.is_empty());
        Ok(Self {
            ssh_dir: home_dir.join(".ssh"),
            home_dir,
            default_user,
            host_keys: HostKeyCheck::default_location()?,
            timeout: DEFAULT_CONNECT_TIMEOUT,
        })
    }

    pub fn new(home_dir: impl Into<PathBuf>, host_keys: HostKeyCheck) -> Self {
        let home_dir = home_dir.into();
        Self {
            ssh_dir: home_dir.join(".ssh"),
            home_dir,
            default_user: None,
            host_keys,
            timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }

    pub fn with_default_user(mut self, user: impl Into<String>) -> Self {
        self.default_user = Some(user.into());
        self
    }

    pub fn with_host_keys(mut self, host_keys: HostKeyCheck) -> Self {
        self.host_keys = host_keys;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Apply ~/.ssh/config to the tunnel's SSH hop
    pub fn plan(&self, config: &TunnelConfig) -> Result<AuthPlan> {
        let mut hop = config.ssh_hop();

        let ssh_config_path = self.ssh_dir.join("config");
        let ssh_config = match SshConfig::load(&ssh_config_path) {
            Ok(parsed) => parsed,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => SshConfig::default(),
            Err(e) => {
                warn!("Ignoring unreadable {}: {}", ssh_config_path.display(), e);
                SshConfig::default()
            }
        };
        let settings = ssh_config.lookup(&hop.host);

        if let Some(user) = settings.user {
            hop.user = user;
        }
        if let Some(port) = settings.port {
            hop.port = port;
        }
        if let Some(hostname) = settings.hostname {
            hop.host = hostname;
        }
        if hop.user.is_empty() {
            hop.user = self.default_user.clone().ok_or_else(|| {
                TunnelError::Auth(format!("no SSH user configured for {}", hop.host))
            })?;
        }

        let key_paths = if settings.identity_files.is_empty() {
            DEFAULT_IDENTITIES
                .iter()
                .map(|name| self.ssh_dir.join(name))
                .collect()
        } else {
            settings
                .identity_files
                .iter()
                .map(|p| expand_tilde(p, &self.home_dir))
                .collect()
        };

        Ok(AuthPlan { hop, key_paths })
    }
}

impl AuthResolver for SshConfigResolver {
    fn resolve(&self, config: &TunnelConfig) -> Result<SshAuth> {
        let plan = self.plan(config)?;
        let identities = load_identities(&plan.key_paths);

        if identities.is_empty() {
            let tried: Vec<String> = plan
                .key_paths
                .iter()
                .map(|p| p.display().to_string())
                .collect();
            return Err(TunnelError::Auth(format!(
                "no usable SSH identity found (tried {})",
                tried.join(", ")
            )));
        }

        Ok(SshAuth {
            hop: plan.hop,
            identities,
            timeout: self.timeout,
            host_keys: self.host_keys.clone(),
        })
    }
}

/// Load every readable, unencrypted key; failures are logged and skipped
pub fn load_identities(paths: &[PathBuf]) -> Vec<Identity> {
    paths
        .iter()
        .filter_map(|path| {
            if !path.exists() {
                return None;
            }
            match load_secret_key(path, None) {
                Ok(key) => {
                    debug!("Loaded SSH identity {}", path.display());
                    Some(Identity {
                        path: path.clone(),
                        key: Arc::new(key),
                    })
                }
                Err(e) => {
                    warn!("Skipping SSH identity {}: {}", path.display(), e);
                    None
                }
            }
        })
        .collect()
}

fn expand_tilde(path: &str, home: &Path) -> PathBuf {
    if path == "~" {
        home.to_path_buf()
    } else if let Some(rest) = path.strip_prefix("~/") {
        home.join(rest)
    } else {
        PathBuf::from(path)
    }
}
