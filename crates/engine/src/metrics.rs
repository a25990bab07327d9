// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 sshfwd Contributors

// Throughput and latency accounting for a single tunnel

use std::fmt;
use std::time::{Duration, Instant};

/// Live counters for one tunnel
///
/// `bytes_out` counts local → remote traffic and `bytes_in` remote → local.
/// Both only grow while the tunnel runs. Rates are derived from the delta
/// since `last_update` on each tick.
#[derive(Debug, Clone)]
pub struct TunnelMetrics {
    pub bytes_in: u64,
    pub bytes_out: u64,
    pub last_bytes_in: u64,
    pub last_bytes_out: u64,
    pub last_update: Instant,
    /// Bytes per second
    pub current_rate_in: f64,
    /// Bytes per second
    pub current_rate_out: f64,
    /// Round trip of the last health probe; `None` when unknown
    pub latency: Option<Duration>,
}

impl TunnelMetrics {
    pub fn new(now: Instant) -> Self {
        Self {
            bytes_in: 0,
            bytes_out: 0,
            last_bytes_in: 0,
            last_bytes_out: 0,
            last_update: now,
            current_rate_in: 0.0,
            current_rate_out: 0.0,
            latency: None,
        }
    }

    pub fn record_in(&mut self, bytes: usize) {
        self.bytes_in = self.bytes_in.saturating_add(bytes as u64);
    }

    pub fn record_out(&mut self, bytes: usize) {
        self.bytes_out = self.bytes_out.saturating_add(bytes as u64);
    }

    /// Recompute rates from the counter deltas since the last update
    ///
    /// Returns `false` and leaves everything untouched when no time has
    /// elapsed, so rapid polling never divides by zero or spikes.
    pub fn update_rates(&mut self, now: Instant) -> bool {
        let elapsed = now.saturating_duration_since(self.last_update).as_secs_f64();
        if elapsed <= 0.0 {
            return false;
        }

        let in_diff = self.bytes_in.saturating_sub(self.last_bytes_in);
        let out_diff = self.bytes_out.saturating_sub(self.last_bytes_out);

        self.current_rate_in = in_diff as f64 / elapsed;
        self.current_rate_out = out_diff as f64 / elapsed;

        self.last_bytes_in = self.bytes_in;
        self.last_bytes_out = self.bytes_out;
        self.last_update = now;
        true
    }

    pub fn set_latency(&mut self, latency: Option<Duration>) {
        self.latency = latency;
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            bytes_in: self.bytes_in,
            bytes_out: self.bytes_out,
            rate_in: self.current_rate_in,
            rate_out: self.current_rate_out,
            latency: self.latency,
        }
    }
}

impl Default for TunnelMetrics {
    fn default() -> Self {
        Self::new(Instant::now())
    }
}

/// Point-in-time copy of a tunnel's metrics, detached from the lock
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MetricsSnapshot {
    pub bytes_in: u64,
    pub bytes_out: u64,
    pub rate_in: f64,
    pub rate_out: f64,
    pub latency: Option<Duration>,
}

impl fmt::Display for MetricsSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "↑{} ↓{} [{}]",
            format_rate(self.rate_out),
            format_rate(self.rate_in),
            format_latency(self.latency)
        )
    }
}

/// Render a byte rate with binary prefixes, e.g. `"1.5 KB/s"`
pub fn format_rate(bytes_per_sec: f64) -> String {
    const UNIT: f64 = 1024.0;
    const PREFIXES: [char; 6] = ['K', 'M', 'G', 'T', 'P', 'E'];

    if bytes_per_sec < UNIT {
        return format!("{:.1} B/s", bytes_per_sec);
    }

    let mut div = UNIT;
    let mut exp = 0;
    let mut n = bytes_per_sec / UNIT;
    while n >= UNIT && exp < PREFIXES.len() - 1 {
        div *= UNIT;
        exp += 1;
        n /= UNIT;
    }
    format!("{:.1} {}B/s", bytes_per_sec / div, PREFIXES[exp])
}

/// Render latency in whole milliseconds, `"n/a"` when unknown
pub fn format_latency(latency: Option<Duration>) -> String {
    match latency {
        Some(d) => format!("{}ms", d.as_millis()),
        None => "n/a".to_string(),
    }
}
