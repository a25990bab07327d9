// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 sshfwd Contributors

// A single forwarded port: listener, shared SSH client, metrics, events

use std::net::SocketAddr;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

use futures::FutureExt;
use parking_lot::{Mutex, RwLock};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, warn};

use sshfwd_common::{Endpoint, TunnelConfig, TunnelState, TunnelStatus};

use crate::auth::SshAuth;
use crate::client::ClientCell;
use crate::error::{Result, TunnelError};
use crate::events::TunnelEvents;
use crate::forward;
use crate::metrics::{MetricsSnapshot, TunnelMetrics};
use crate::settings::EngineSettings;
use crate::transport::SshConnector;

/// Everything a forwarder needs that stays fixed for one run
pub(crate) struct RunContext {
    pub hop: Endpoint,
    pub target: Endpoint,
    pub auth: SshAuth,
    pub connector: Arc<dyn SshConnector>,
}

enum RunState {
    Idle,
    Running {
        cancel: CancellationToken,
        tracker: TaskTracker,
    },
    Retired,
}

pub struct Tunnel {
    id: String,
    config: RwLock<TunnelConfig>,
    pub(crate) settings: Arc<EngineSettings>,
    pub(crate) client: ClientCell,
    metrics: Mutex<TunnelMetrics>,
    pub(crate) events: TunnelEvents,
    pending_logs: Mutex<Option<mpsc::Receiver<String>>>,
    local_addr: Mutex<Option<SocketAddr>>,
    /// Serializes launch and shutdown
    run: tokio::sync::Mutex<RunState>,
    open_connections: AtomicUsize,
}

impl Tunnel {
    /// Build a stopped tunnel and hand back its status receiver
    ///
    /// The log receiver stays parked inside the tunnel until the manager
    /// claims it on the first start.
    pub fn new(
        id: impl Into<String>,
        config: TunnelConfig,
        settings: Arc<EngineSettings>,
    ) -> (Arc<Self>, mpsc::Receiver<TunnelStatus>) {
        let id = id.into();
        let (events, log_rx, status_rx) = TunnelEvents::channel(
            id.clone(),
            settings.tunnel_log_capacity,
            settings.tunnel_status_capacity,
        );

        let tunnel = Arc::new(Self {
            id,
            config: RwLock::new(config),
            settings,
            client: ClientCell::new(),
            metrics: Mutex::new(TunnelMetrics::new(Instant::now())),
            events,
            pending_logs: Mutex::new(Some(log_rx)),
            local_addr: Mutex::new(None),
            run: tokio::sync::Mutex::new(RunState::Idle),
            open_connections: AtomicUsize::new(0),
        });
        (tunnel, status_rx)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn config(&self) -> TunnelConfig {
        self.config.read().clone()
    }

    pub fn name(&self) -> String {
        self.config.read().name.clone()
    }

    /// Replace the configuration; refused while the tunnel is listening
    pub fn set_config(&self, config: TunnelConfig) -> Result<()> {
        if self.is_running() {
            return Err(TunnelError::Running(self.id.clone()));
        }
        *self.config.write() = config;
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.local_addr.lock().is_some()
    }

    /// Stopped for good; a new tunnel must be created under this id
    pub fn is_retired(&self) -> bool {
        self.events.is_closed()
    }

    /// Address the listener is bound to while running
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.lock()
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.lock().snapshot()
    }

    pub(crate) fn record_in(&self, bytes: usize) {
        self.metrics.lock().record_in(bytes);
    }

    pub(crate) fn record_out(&self, bytes: usize) {
        self.metrics.lock().record_out(bytes);
    }

    pub(crate) fn take_log_receiver(&self) -> Option<mpsc::Receiver<String>> {
        self.pending_logs.lock().take()
    }

    pub(crate) async fn debug(&self, message: impl AsRef<str>) {
        self.events.debug(&self.name(), message).await;
    }

    pub(crate) async fn error(&self, message: impl AsRef<str>) {
        self.events.error(&self.name(), message).await;
    }

    pub(crate) async fn fail(&self, message: impl AsRef<str>) {
        self.events.fail(&self.name(), message).await;
    }

    /// Count a forwarded connection that reached the copy phase
    pub(crate) fn connection_opened(&self) {
        self.open_connections.fetch_add(1, Ordering::SeqCst);
    }

    /// Returns `true` when this was the last open connection
    pub(crate) fn connection_closed(&self) -> bool {
        self.open_connections.fetch_sub(1, Ordering::SeqCst) == 1
    }

    /// Start the accept loop and health task on an already-bound listener
    pub(crate) async fn launch(
        self: &Arc<Self>,
        listener: TcpListener,
        auth: SshAuth,
        connector: Arc<dyn SshConnector>,
    ) -> Result<()> {
        let mut run = self.run.lock().await;
        match &*run {
            // A cancelled run lost its listener and may be replaced
            RunState::Running { cancel, .. } if !cancel.is_cancelled() => {
                return Err(TunnelError::AlreadyRunning(self.id.clone()))
            }
            RunState::Retired => return Err(TunnelError::Retired(self.id.clone())),
            RunState::Running { .. } | RunState::Idle => {}
        }

        let local_addr = listener.local_addr()?;
        let config = self.config();
        let ctx = Arc::new(RunContext {
            hop: auth.hop.clone(),
            target: config.dial_target(),
            auth,
            connector,
        });

        *self.metrics.lock() = TunnelMetrics::new(Instant::now());
        *self.local_addr.lock() = Some(local_addr);

        let cancel = CancellationToken::new();
        let tracker = TaskTracker::new();

        tracker.spawn(self.clone().accept_loop(
            listener,
            ctx,
            cancel.clone(),
            tracker.clone(),
        ));
        tracker.spawn(self.clone().health_loop(cancel.clone()));

        *run = RunState::Running { cancel, tracker };
        debug!(tunnel = %self.id, "Listening on {}", local_addr);
        Ok(())
    }

    /// Stop every task, release the listener and client, close the queues
    ///
    /// The tunnel is retired afterwards and cannot be started again.
    /// Concurrent callers are serialized; later ones find nothing to do.
    pub(crate) async fn shutdown(&self) {
        let mut run = self.run.lock().await;
        let previous = std::mem::replace(&mut *run, RunState::Retired);

        match previous {
            RunState::Retired => return,
            RunState::Idle => {}
            RunState::Running { cancel, tracker } => {
                cancel.cancel();
                tracker.close();
                if tokio::time::timeout(self.settings.stop_grace, tracker.wait())
                    .await
                    .is_err()
                {
                    warn!(
                        tunnel = %self.id,
                        "{} task(s) still running after {:?}",
                        tracker.len(),
                        self.settings.stop_grace
                    );
                }
            }
        }

        self.client.shutdown().await;
        *self.local_addr.lock() = None;
        self.metrics.lock().set_latency(None);

        self.debug("Tunnel stopped").await;
        self.events.status(TunnelState::Stopped, "tunnel stopped").await;
        self.events.close();
    }

    async fn accept_loop(
        self: Arc<Self>,
        listener: TcpListener,
        ctx: Arc<RunContext>,
        cancel: CancellationToken,
        tracker: TaskTracker,
    ) {
        self.debug(format!(
            "Forwarding :{} to {} via {}",
            listener.local_addr().map(|a| a.port()).unwrap_or_default(),
            ctx.target,
            ctx.hop
        ))
        .await;
        self.events
            .status(TunnelState::Connecting, "waiting for traffic")
            .await;

        let poll = self.settings.accept_poll;
        loop {
            let accepted = tokio::select! {
                _ = cancel.cancelled() => break,
                accepted = tokio::time::timeout(poll, listener.accept()) => accepted,
            };

            match accepted {
                // Deadline only; loop back to re-check cancellation
                Err(_) => continue,
                Ok(Ok((stream, peer))) => {
                    debug!(tunnel = %self.id, "Accepted connection from {}", peer);
                    tracker.spawn(forward::handle_connection(
                        self.clone(),
                        ctx.clone(),
                        stream,
                        peer,
                        cancel.clone(),
                    ));
                }
                Ok(Err(e)) => {
                    self.listener_closed(&cancel, e).await;
                    break;
                }
            }
        }
        debug!(tunnel = %self.id, "Accept loop finished");
    }

    /// The listener failed outside a deadline: end this run as stopped
    ///
    /// Every task of the run is cancelled and the SSH client released. The
    /// tunnel stays registered and may be started again.
    async fn listener_closed(&self, cancel: &CancellationToken, err: std::io::Error) {
        cancel.cancel();
        *self.local_addr.lock() = None;
        if let Some(client) = self.client.current() {
            self.client.invalidate(&client).await;
        }
        self.metrics.lock().set_latency(None);

        self.error(format!("Listener closed: {}", err)).await;
        self.events
            .status(TunnelState::Stopped, "listener closed")
            .await;
    }

    async fn health_loop(self: Arc<Self>, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.settings.health_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }

            let tick = AssertUnwindSafe(self.health_tick()).catch_unwind();
            tokio::select! {
                _ = cancel.cancelled() => break,
                outcome = tick => {
                    if outcome.is_err() {
                        warn!(tunnel = %self.id, "Health check panicked; continuing");
                    }
                }
            }
        }
    }

    /// Refresh rates, then probe the client for latency
    async fn health_tick(&self) {
        self.metrics.lock().update_rates(Instant::now());

        let Some(client) = self.client.current() else {
            self.metrics.lock().set_latency(None);
            return;
        };

        let started = Instant::now();
        let probe = tokio::time::timeout(self.settings.health_timeout, client.probe()).await;
        match probe {
            Ok(Ok(())) => {
                self.metrics.lock().set_latency(Some(started.elapsed()));
            }
            Ok(Err(e)) => {
                self.metrics.lock().set_latency(None);
                if self.client.invalidate(&client).await {
                    self.debug(format!("SSH session unhealthy, dropped it: {}", e))
                        .await;
                }
            }
            Err(_) => {
                self.metrics.lock().set_latency(None);
                if self.client.invalidate(&client).await {
                    self.debug("SSH session probe timed out, dropped it").await;
                }
            }
        }
    }
}
