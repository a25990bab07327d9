// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 sshfwd Contributors

// Endpoint parsing for `[user@]host[:port]` addresses

use std::fmt;

/// A network endpoint with an optional login user
///
/// The user is carried alongside the address but never appears in the
/// `host:port` rendering used for dialing.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
    pub user: String,
}

impl Endpoint {
    pub fn new(host: impl Into<String>, port: u16, user: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port,
            user: user.into(),
        }
    }

    /// Parse `[user@]host[:port]`
    ///
    /// A missing or non-numeric port yields 0; the caller applies its own
    /// default. Only the segment between the first and second `@` is kept as
    /// the host, so `"user@host@domain"` parses to user `user`, host `host`.
    pub fn parse(s: &str) -> Self {
        let mut endpoint = Endpoint {
            host: s.to_string(),
            ..Default::default()
        };
        endpoint.split_user_and_port();
        endpoint
    }

    /// Build an endpoint from a host and port, falling back to the first of
    /// `fallback_hosts` when `host` is empty
    ///
    /// The resolved host string goes through the same `@`/`:` splitting as
    /// [`Endpoint::parse`]; a port embedded there replaces `port`.
    pub fn build(host: &str, port: u16, fallback_hosts: &[&str]) -> Self {
        let host = match (host.is_empty(), fallback_hosts.first()) {
            (true, Some(fallback)) => *fallback,
            _ => host,
        };

        let mut endpoint = Endpoint {
            host: host.to_string(),
            port,
            user: String::new(),
        };
        endpoint.split_user_and_port();
        endpoint
    }

    /// Return a copy with `port` applied when no port was parsed
    pub fn with_default_port(mut self, port: u16) -> Self {
        if self.port == 0 {
            self.port = port;
        }
        self
    }

    fn split_user_and_port(&mut self) {
        let host = std::mem::take(&mut self.host);

        let mut at_parts = host.split('@');
        let first = at_parts.next().unwrap_or_default();
        let host = match at_parts.next() {
            Some(after_at) => {
                self.user = first.to_string();
                after_at
            }
            None => first,
        };

        let mut colon_parts = host.split(':');
        let name = colon_parts.next().unwrap_or_default();
        match colon_parts.next() {
            Some(port) => {
                self.host = name.to_string();
                self.port = port.parse().unwrap_or(0);
            }
            None => self.host = host.to_string(),
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}
