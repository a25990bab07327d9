// Engine timing and queue sizing

use std::time::Duration;

/// Tunables shared by every tunnel a manager owns
#[derive(Debug, Clone)]
pub struct EngineSettings {
    /// Accept deadline; expiry is a liveness poll, not a failure
    pub accept_poll: Duration,
    /// Period of the metrics/health task
    pub health_interval: Duration,
    /// Upper bound on a single health probe (session open + close)
    pub health_timeout: Duration,
    /// Attempts at dialing the remote target through the SSH client
    pub dial_attempts: u32,
    /// Backoff unit; attempt `n` is followed by a sleep of `n * retry_base_delay`
    pub retry_base_delay: Duration,
    /// How long `stop_tunnel` waits for tasks to wind down
    pub stop_grace: Duration,
    /// Per-tunnel log queue capacity
    pub tunnel_log_capacity: usize,
    /// Per-tunnel status queue capacity
    pub tunnel_status_capacity: usize,
    /// Manager-wide log queue capacity
    pub log_capacity: usize,
    /// Manager-wide status queue capacity
    pub status_capacity: usize,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            accept_poll: Duration::from_millis(250),
            health_interval: Duration::from_secs(1),
            health_timeout: Duration::from_secs(3),
            dial_attempts: 3,
            retry_base_delay: Duration::from_millis(500),
            stop_grace: Duration::from_secs(5),
            tunnel_log_capacity: 50,
            tunnel_status_capacity: 2,
            log_capacity: 100,
            status_capacity: 5,
        }
    }
}

impl EngineSettings {
    /// Backoff after a failed attempt (1-based)
    pub fn backoff(&self, attempt: u32) -> Duration {
        self.retry_base_delay * attempt
    }
}
