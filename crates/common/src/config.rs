// Configuration structures for sshfwd

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::endpoint::Endpoint;
use crate::error::{Error, Result};
use crate::network::{DEFAULT_REMOTE_FALLBACK, DEFAULT_SSH_PORT};

/// Name of the per-directory config file picked up before the default path
pub const LOCAL_CONFIG_FILE: &str = ".sshfwd.yaml";

/// One configured tunnel
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct TunnelConfig {
    /// Human-readable tunnel name, also used as its id
    pub name: String,
    /// Local port to listen on
    pub local_port: u16,
    /// Port to reach on the remote side
    pub remote_port: u16,
    /// Host to reach; also the SSH server when no bastion is set
    pub remote_host: String,
    /// Free-form grouping label
    #[serde(default)]
    pub tag: String,
    /// Local bind address (default: 0.0.0.0)
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub bind_address: String,
    /// Optional jump host
    #[serde(default, skip_serializing_if = "BastionConfig::is_empty")]
    pub bastion: BastionConfig,
}

/// Bastion (jump host) settings
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct BastionConfig {
    #[serde(default)]
    pub host: String,
    #[serde(default)]
    pub user: String,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub port: u16,
}

fn is_zero(port: &u16) -> bool {
    *port == 0
}

impl BastionConfig {
    pub fn is_empty(&self) -> bool {
        self.host.is_empty() && self.user.is_empty() && self.port == 0
    }

    /// Build bastion settings from a `[user@]host[:port]` string
    pub fn from_endpoint(spec: &str) -> Self {
        let endpoint = Endpoint::parse(spec);
        Self {
            host: endpoint.host,
            user: endpoint.user,
            port: endpoint.port,
        }
    }
}

impl TunnelConfig {
    /// Stable identifier used to register the tunnel
    pub fn id(&self) -> &str {
        &self.name
    }

    pub fn has_bastion(&self) -> bool {
        !self.bastion.host.is_empty()
    }

    /// The SSH server actually dialed: the bastion if set, else the remote host
    pub fn ssh_hop(&self) -> Endpoint {
        let (host, port, user) = if self.has_bastion() {
            (self.bastion.host.as_str(), self.bastion.port, self.bastion.user.as_str())
        } else {
            (self.remote_host.as_str(), 0, "")
        };
        let mut hop = Endpoint::build(host, port, &[]).with_default_port(DEFAULT_SSH_PORT);
        if hop.user.is_empty() {
            hop.user = user.to_string();
        }
        hop
    }

    /// The target dialed through the SSH hop
    ///
    /// Without a bastion the target is resolved from the SSH server itself,
    /// so it becomes `localhost:remote_port`.
    pub fn dial_target(&self) -> Endpoint {
        if self.has_bastion() {
            Endpoint::new(self.remote_host.clone(), self.remote_port, "")
        } else {
            Endpoint::build("", self.remote_port, &[DEFAULT_REMOTE_FALLBACK])
        }
    }

    /// Validate the tunnel definition
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(Error::Config("tunnel name must not be empty".to_string()));
        }
        if self.remote_host.trim().is_empty() {
            return Err(Error::Config(format!(
                "tunnel '{}' has no remote_host",
                self.name
            )));
        }
        if self.remote_port == 0 {
            return Err(Error::Config(format!(
                "tunnel '{}' has no remote_port",
                self.name
            )));
        }
        Ok(())
    }
}

/// On-disk layout: a single `tunnels:` list
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct ConfigFile {
    #[serde(default)]
    tunnels: Vec<TunnelConfig>,
}

/// Loads and saves tunnel definitions at a fixed path
#[derive(Debug, Clone)]
pub struct ConfigLoader {
    path: PathBuf,
}

impl ConfigLoader {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load all tunnel definitions
    ///
    /// A missing file is reported as [`Error::ConfigRead`]; callers that can
    /// run with an empty set decide that themselves.
    pub fn load(&self) -> Result<Vec<TunnelConfig>> {
        let contents = fs::read_to_string(&self.path).map_err(|source| Error::ConfigRead {
            path: self.path.clone(),
            source,
        })?;

        if contents.trim().is_empty() {
            return Ok(Vec::new());
        }

        let config: ConfigFile = serde_yaml::from_str(&contents)?;
        debug!(
            "Loaded {} tunnels from {}",
            config.tunnels.len(),
            self.path.display()
        );
        Ok(config.tunnels)
    }

    /// Save tunnel definitions, creating the parent directory if needed
    pub fn save(&self, tunnels: &[TunnelConfig]) -> Result<()> {
        let config = ConfigFile {
            tunnels: tunnels.to_vec(),
        };
        let contents = serde_yaml::to_string(&config)?;

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        fs::write(&self.path, contents)?;

        info!("Saved {} tunnels to {}", tunnels.len(), self.path.display());
        Ok(())
    }
}

/// Default config location: ~/.local/state/sshfwd/config.yaml
pub fn default_config_path() -> Result<PathBuf> {
    let home = dirs::home_dir()
        .ok_or_else(|| Error::Config("could not determine home directory".to_string()))?;
    Ok(home
        .join(".local")
        .join("state")
        .join("sshfwd")
        .join("config.yaml"))
}

/// Pick the config file to use
///
/// 1. `explicit`, if given and it exists
/// 2. `.sshfwd.yaml` in the current directory
/// 3. [`default_config_path`]
pub fn find_config_file(explicit: Option<&Path>) -> Result<PathBuf> {
    let cwd = std::env::current_dir().ok();
    find_config_file_in(explicit, cwd.as_deref())
}

fn find_config_file_in(explicit: Option<&Path>, cwd: Option<&Path>) -> Result<PathBuf> {
    if let Some(path) = explicit {
        if path.exists() {
            return Ok(path.to_path_buf());
        }
    }

    if let Some(dir) = cwd {
        let local = dir.join(LOCAL_CONFIG_FILE);
        if local.exists() {
            return Ok(local);
        }
    }

    default_config_path()
}
