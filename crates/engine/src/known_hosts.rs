// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 sshfwd Contributors

// Host key verification against a private known_hosts file

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use base64::Engine;
use russh::keys::{PublicKey, PublicKeyBase64};
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use sshfwd_common::network::DEFAULT_SSH_PORT;

use crate::error::{Result, TunnelError};

/// Serializes read-modify-write cycles on known_hosts files
static FILE_LOCK: parking_lot::Mutex<()> = parking_lot::const_mutex(());

/// How unknown and changed host keys are treated
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HostKeyPolicy {
    /// Skip verification entirely
    AcceptAny,
    /// Record first-seen keys, reject changed ones
    #[default]
    AcceptNew,
    /// Only keys already on file are accepted
    Strict,
}

/// Where and how a connector verifies server keys
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostKeyCheck {
    pub policy: HostKeyPolicy,
    pub known_hosts: PathBuf,
}

impl HostKeyCheck {
    pub fn new(policy: HostKeyPolicy, known_hosts: impl Into<PathBuf>) -> Self {
        Self {
            policy,
            known_hosts: known_hosts.into(),
        }
    }

    /// `AcceptNew` against `~/.config/sshfwd/known_hosts`
    pub fn default_location() -> Result<Self> {
        Ok(Self::new(HostKeyPolicy::default(), default_known_hosts_path()?))
    }

    /// Decide whether `key` is acceptable for `host:port`
    ///
    /// Under `AcceptNew` an unknown key is appended to the file before
    /// returning `true`.
    pub fn check(&self, host: &str, port: u16, key: &PublicKey) -> Result<bool> {
        if self.policy == HostKeyPolicy::AcceptAny {
            return Ok(true);
        }

        let _file = FILE_LOCK.lock();
        let mut store = KnownHosts::load(&self.known_hosts)?;
        match store.verify(host, port, key) {
            Verdict::Trusted => Ok(true),
            Verdict::Unknown if self.policy == HostKeyPolicy::AcceptNew => {
                info!(
                    "Trusting new host key for {} ({})",
                    host_pattern(host, port),
                    fingerprint(key)
                );
                store.add(host, port, key);
                store.save()?;
                Ok(true)
            }
            Verdict::Unknown => {
                warn!(
                    "Rejecting unknown host key for {} ({})",
                    host_pattern(host, port),
                    fingerprint(key)
                );
                Ok(false)
            }
            Verdict::Changed { line } => {
                warn!(
                    "HOST KEY CHANGED for {}: presented {}, known_hosts line {} differs",
                    host_pattern(host, port),
                    fingerprint(key),
                    line
                );
                Ok(false)
            }
        }
    }
}

pub fn default_known_hosts_path() -> Result<PathBuf> {
    let config_dir = dirs::config_dir()
        .ok_or_else(|| TunnelError::Key("could not determine config directory".to_string()))?;
    Ok(config_dir.join("sshfwd").join("known_hosts"))
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Verdict {
    Trusted,
    Unknown,
    /// Host is on file with a different key
    Changed { line: usize },
}

#[derive(Debug, Clone)]
struct Entry {
    pattern: String,
    key_type: String,
    key_data: String,
    line: usize,
}

impl Entry {
    /// `pattern key_type key_data [comment]`
    fn parse(text: &str, line: usize) -> Option<Self> {
        let text = text.trim();
        if text.is_empty() || text.starts_with('#') {
            return None;
        }

        let mut fields = text.split_whitespace();
        match (fields.next(), fields.next(), fields.next()) {
            (Some(pattern), Some(key_type), Some(key_data)) => Some(Self {
                pattern: pattern.to_string(),
                key_type: key_type.to_string(),
                key_data: key_data.to_string(),
                line,
            }),
            _ => {
                warn!("Ignoring malformed known_hosts line {}", line);
                None
            }
        }
    }

    fn applies_to(&self, host: &str, port: u16) -> bool {
        self.pattern
            .split(',')
            .any(|p| p == host_pattern(host, port) || (port == DEFAULT_SSH_PORT && p == host))
    }

    fn holds(&self, key: &PublicKey) -> bool {
        self.key_type == key_algorithm(key) && self.key_data == key.public_key_base64()
    }
}

struct KnownHosts {
    path: PathBuf,
    entries: Vec<Entry>,
}

impl KnownHosts {
    /// A missing file is an empty store
    fn load(path: &Path) -> Result<Self> {
        let entries = match fs::read_to_string(path) {
            Ok(content) => content
                .lines()
                .enumerate()
                .filter_map(|(idx, text)| Entry::parse(text, idx + 1))
                .collect(),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("No known_hosts file at {} yet", path.display());
                Vec::new()
            }
            Err(e) => return Err(e.into()),
        };

        Ok(Self {
            path: path.to_path_buf(),
            entries,
        })
    }

    fn verify(&self, host: &str, port: u16, key: &PublicKey) -> Verdict {
        let mut candidates = self.entries.iter().filter(|e| e.applies_to(host, port)).peekable();

        let Some(first_line) = candidates.peek().map(|e| e.line) else {
            return Verdict::Unknown;
        };
        if candidates.any(|e| e.holds(key)) {
            Verdict::Trusted
        } else {
            Verdict::Changed { line: first_line }
        }
    }

    fn add(&mut self, host: &str, port: u16, key: &PublicKey) {
        let line = self.entries.len() + 1;
        self.entries.push(Entry {
            pattern: host_pattern(host, port),
            key_type: key_algorithm(key),
            key_data: key.public_key_base64(),
            line,
        });
    }

    fn save(&self) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }

        let mut file = fs::File::create(&self.path)?;
        writeln!(file, "# sshfwd known hosts")?;
        for entry in &self.entries {
            writeln!(file, "{} {} {}", entry.pattern, entry.key_type, entry.key_data)?;
        }

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&self.path, fs::Permissions::from_mode(0o600))?;
        }

        debug!("Wrote {} known host(s) to {}", self.entries.len(), self.path.display());
        Ok(())
    }
}

/// `host` on port 22, `[host]:port` otherwise
fn host_pattern(host: &str, port: u16) -> String {
    if port == DEFAULT_SSH_PORT {
        host.to_string()
    } else {
        format!("[{}]:{}", host, port)
    }
}

/// Algorithm name from the SSH wire encoding (length-prefixed string)
fn key_algorithm(key: &PublicKey) -> String {
    let bytes = key.public_key_bytes();
    let Some(len) = bytes.get(..4).map(|b| u32::from_be_bytes([b[0], b[1], b[2], b[3]]) as usize)
    else {
        return "unknown".to_string();
    };
    match bytes.get(4..4 + len) {
        Some(name) => String::from_utf8_lossy(name).into_owned(),
        None => "unknown".to_string(),
    }
}

/// `SHA256:<base64>` over the wire-encoded key
pub fn fingerprint(key: &PublicKey) -> String {
    let digest = Sha256::digest(key.public_key_bytes());
    format!(
        "SHA256:{}",
        base64::engine::general_purpose::STANDARD_NO_PAD.encode(digest)
    )
}
