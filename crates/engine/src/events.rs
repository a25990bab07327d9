// Per-tunnel log and status queues

use chrono::{DateTime, Local};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, error};

use sshfwd_common::{LogLevel, TunnelState, TunnelStatus};

/// Producer side of a tunnel's bounded event queues
///
/// Sends wait for queue space, so a slow consumer applies backpressure
/// instead of losing status transitions. After `close` every emit is
/// silently discarded.
pub struct TunnelEvents {
    id: String,
    logs: Mutex<Option<mpsc::Sender<String>>>,
    statuses: Mutex<Option<mpsc::Sender<TunnelStatus>>>,
}

impl TunnelEvents {
    pub fn channel(
        id: impl Into<String>,
        log_capacity: usize,
        status_capacity: usize,
    ) -> (Self, mpsc::Receiver<String>, mpsc::Receiver<TunnelStatus>) {
        let (log_tx, log_rx) = mpsc::channel(log_capacity.max(1));
        let (status_tx, status_rx) = mpsc::channel(status_capacity.max(1));
        let events = Self {
            id: id.into(),
            logs: Mutex::new(Some(log_tx)),
            statuses: Mutex::new(Some(status_tx)),
        };
        (events, log_rx, status_rx)
    }

    pub async fn status(&self, state: TunnelState, message: impl Into<String>) {
        let sender = self.statuses.lock().clone();
        let Some(tx) = sender else {
            return;
        };
        let _ = tx.send(TunnelStatus::new(&self.id, state, message)).await;
    }

    pub async fn debug(&self, name: &str, message: impl AsRef<str>) {
        let message = message.as_ref();
        debug!(tunnel = %self.id, "{}", message);
        self.log(name, LogLevel::Debug, message).await;
    }

    /// Log at ERROR without touching the tunnel state
    pub async fn error(&self, name: &str, message: impl AsRef<str>) {
        let message = message.as_ref();
        error!(tunnel = %self.id, "{}", message);
        self.log(name, LogLevel::Error, message).await;
    }

    /// Log at ERROR and move the tunnel to the `error` state
    pub async fn fail(&self, name: &str, message: impl AsRef<str>) {
        let message = message.as_ref();
        self.error(name, message).await;
        self.status(TunnelState::Error, message).await;
    }

    /// Drop both senders; receivers see end-of-stream once in-flight sends finish
    pub fn close(&self) {
        self.logs.lock().take();
        self.statuses.lock().take();
    }

    pub fn is_closed(&self) -> bool {
        self.statuses.lock().is_none()
    }

    async fn log(&self, name: &str, level: LogLevel, message: &str) {
        let sender = self.logs.lock().clone();
        let Some(tx) = sender else {
            return;
        };
        let _ = tx.send(format_log_line(Local::now(), name, level, message)).await;
    }
}

/// `"HH:MM:SS [name] LEVEL message"`; the bracket is omitted for unnamed tunnels
pub fn format_log_line(at: DateTime<Local>, name: &str, level: LogLevel, message: &str) -> String {
    let stamp = at.format("%H:%M:%S");
    if name.is_empty() {
        format!("{} {} {}", stamp, level, message)
    } else {
        format!("{} [{}] {} {}", stamp, name, level, message)
    }
}
