// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 sshfwd Contributors

// Network utility functions

use std::net::IpAddr;

/// Bind address used when a tunnel does not specify one
pub const DEFAULT_BIND_ADDRESS: &str = "0.0.0.0";

/// Host dialed from the SSH server's point of view when no bastion is configured
pub const DEFAULT_REMOTE_FALLBACK: &str = "localhost";

/// Default SSH port
pub const DEFAULT_SSH_PORT: u16 = 22;

/// Join host and port, bracketing bare IPv6 literals ("[::1]:22")
pub fn format_host_port(host: &str, port: u16) -> String {
    if host.contains(':') && !host.starts_with('[') {
        format!("[{}]:{}", host, port)
    } else {
        format!("{}:{}", host, port)
    }
}

/// Whether `host` only reaches this machine
///
/// Hostnames other than `localhost` are never resolved, so they count as
/// exposed.
pub fn is_loopback_address(host: &str) -> bool {
    let bare = host.trim_start_matches('[').trim_end_matches(']');
    bare.eq_ignore_ascii_case("localhost")
        || bare.parse::<IpAddr>().is_ok_and(|ip| ip.is_loopback())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_host_port() {
        assert_eq!(format_host_port("example.com", 22), "example.com:22");
        assert_eq!(format_host_port("127.0.0.1", 8080), "127.0.0.1:8080");
        assert_eq!(format_host_port("::1", 22), "[::1]:22");
        assert_eq!(format_host_port("[::1]", 22), "[::1]:22");
    }

    #[test]
    fn test_is_loopback_address() {
        for host in ["127.0.0.1", "127.255.255.255", "::1", "[::1]", "LocalHost"] {
            assert!(is_loopback_address(host), "{host}");
        }

        for host in ["0.0.0.0", "::", "192.168.1.1", "db.internal", ""] {
            assert!(!is_loopback_address(host), "{host}");
        }
    }
}
