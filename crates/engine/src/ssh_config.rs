// OpenSSH client config lookup
//
// Only the keywords the tunnel engine needs are collected: HostName, User,
// Port and IdentityFile. `Match` blocks and `Include` are not evaluated.

use std::fs;
use std::path::Path;

/// Settings that apply to one host alias
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HostSettings {
    pub hostname: Option<String>,
    pub user: Option<String>,
    pub port: Option<u16>,
    pub identity_files: Vec<String>,
}

#[derive(Debug, Clone)]
struct Block {
    /// `None` for a `Match` block, which never applies
    patterns: Option<Vec<String>>,
    options: Vec<(String, String)>,
}

/// Parsed `~/.ssh/config`
#[derive(Debug, Clone, Default)]
pub struct SshConfig {
    blocks: Vec<Block>,
}

impl SshConfig {
    pub fn load(path: &Path) -> std::io::Result<Self> {
        let content = fs::read_to_string(path)?;
        Ok(Self::parse(&content))
    }

    pub fn parse(content: &str) -> Self {
        // Options before the first Host line apply to every host
        let mut blocks = vec![Block {
            patterns: Some(vec!["*".to_string()]),
            options: Vec::new(),
        }];

        for line in content.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let Some((key, value)) = split_directive(line) else {
                continue;
            };
            let key = key.to_ascii_lowercase();

            match key.as_str() {
                "host" => blocks.push(Block {
                    patterns: Some(value.split_whitespace().map(unquote).collect()),
                    options: Vec::new(),
                }),
                "match" => blocks.push(Block {
                    patterns: None,
                    options: Vec::new(),
                }),
                _ => {
                    if let Some(block) = blocks.last_mut() {
                        block.options.push((key, unquote(value)));
                    }
                }
            }
        }

        Self { blocks }
    }

    /// Collect settings for `host`; the first value seen for a keyword wins
    pub fn lookup(&self, host: &str) -> HostSettings {
        let mut settings = HostSettings::default();

        for block in &self.blocks {
            let Some(patterns) = &block.patterns else {
                continue;
            };
            if !host_matches(patterns, host) {
                continue;
            }

            for (key, value) in &block.options {
                match key.as_str() {
                    "hostname" if settings.hostname.is_none() => {
                        settings.hostname = Some(value.clone());
                    }
                    "user" if settings.user.is_none() => {
                        settings.user = Some(value.clone());
                    }
                    "port" if settings.port.is_none() => {
                        settings.port = value.parse().ok();
                    }
                    "identityfile" => settings.identity_files.push(value.clone()),
                    _ => {}
                }
            }
        }

        settings
    }
}

/// `Key value` or `Key=value`
fn split_directive(line: &str) -> Option<(&str, &str)> {
    let split_at = line.find(|c: char| c == '=' || c.is_whitespace())?;
    let key = line[..split_at].trim();
    let value = line[split_at..]
        .trim_start()
        .trim_start_matches('=')
        .trim();
    if key.is_empty() || value.is_empty() {
        return None;
    }
    Some((key, value))
}

fn unquote(value: &str) -> String {
    value
        .strip_prefix('"')
        .and_then(|v| v.strip_suffix('"'))
        .unwrap_or(value)
        .to_string()
}

/// A host matches when some pattern matches and no negated pattern does
fn host_matches(patterns: &[String], host: &str) -> bool {
    let mut matched = false;
    for pattern in patterns {
        if let Some(negated) = pattern.strip_prefix('!') {
            if glob_match(negated, host) {
                return false;
            }
        } else if glob_match(pattern, host) {
            matched = true;
        }
    }
    matched
}

/// `*` matches any run of characters, `?` exactly one
fn glob_match(pattern: &str, text: &str) -> bool {
    let pattern: Vec<char> = pattern.chars().collect();
    let text: Vec<char> = text.chars().collect();

    let (mut p, mut t) = (0, 0);
    let mut star: Option<(usize, usize)> = None;

    while t < text.len() {
        if p < pattern.len() && (pattern[p] == '?' || pattern[p] == text[t]) {
            p += 1;
            t += 1;
        } else if p < pattern.len() && pattern[p] == '*' {
            star = Some((p, t));
            p += 1;
        } else if let Some((star_p, star_t)) = star {
            p = star_p + 1;
            t = star_t + 1;
            star = Some((star_p, star_t + 1));
        } else {
            return false;
        }
    }

    pattern[p..].iter().all(|&c| c == '*')
}
