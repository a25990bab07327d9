// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 sshfwd Contributors

// Tunnel registry and lifecycle

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, RwLock};
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use sshfwd_common::network::DEFAULT_BIND_ADDRESS;
use sshfwd_common::{format_host_port, TunnelConfig, TunnelStatus};

use crate::auth::{AuthResolver, SshConfigResolver};
use crate::error::{Result, TunnelError};
use crate::settings::EngineSettings;
use crate::ssh::RusshConnector;
use crate::transport::SshConnector;
use crate::tunnel::Tunnel;

/// Aggregate event queues fed by every tunnel of a manager
///
/// Both streams end once [`TunnelManager::cleanup`] has finished.
pub struct EventStreams {
    /// `"HH:MM:SS [name] LEVEL message"` lines
    pub logs: mpsc::Receiver<String>,
    pub statuses: mpsc::Receiver<TunnelStatus>,
}

#[derive(Clone)]
struct Sinks {
    logs: mpsc::Sender<String>,
    statuses: mpsc::Sender<TunnelStatus>,
}

/// Owns every tunnel and fans their events into two shared queues
#[derive(Clone)]
pub struct TunnelManager {
    tunnels: Arc<RwLock<HashMap<String, Arc<Tunnel>>>>,
    settings: Arc<EngineSettings>,
    auth: Arc<dyn AuthResolver>,
    connector: Arc<dyn SshConnector>,
    sinks: Arc<Mutex<Option<Sinks>>>,
    streams: Arc<Mutex<Option<EventStreams>>>,
    relays: TaskTracker,
}

impl TunnelManager {
    pub fn new(
        settings: EngineSettings,
        auth: Arc<dyn AuthResolver>,
        connector: Arc<dyn SshConnector>,
    ) -> Self {
        let (log_tx, log_rx) = mpsc::channel(settings.log_capacity.max(1));
        let (status_tx, status_rx) = mpsc::channel(settings.status_capacity.max(1));

        Self {
            tunnels: Arc::new(RwLock::new(HashMap::new())),
            settings: Arc::new(settings),
            auth,
            connector,
            sinks: Arc::new(Mutex::new(Some(Sinks {
                logs: log_tx,
                statuses: status_tx,
            }))),
            streams: Arc::new(Mutex::new(Some(EventStreams {
                logs: log_rx,
                statuses: status_rx,
            }))),
            relays: TaskTracker::new(),
        }
    }

    /// Manager using `~/.ssh/config` for credentials and russh for transport
    pub fn with_defaults(settings: EngineSettings) -> Result<Self> {
        let auth = SshConfigResolver::from_env()?;
        Ok(Self::new(
            settings,
            Arc::new(auth),
            Arc::new(RusshConnector::new()),
        ))
    }

    /// Hand out the aggregate queues; only the first caller gets them
    pub fn take_event_streams(&self) -> Option<EventStreams> {
        self.streams.lock().take()
    }

    /// Register a tunnel, or return the one already registered under `id`
    pub async fn create_tunnel(&self, id: &str, config: TunnelConfig) -> Arc<Tunnel> {
        let mut tunnels = self.tunnels.write().await;
        if let Some(existing) = tunnels.get(id) {
            debug!("Tunnel {} already registered", id);
            return existing.clone();
        }

        let (tunnel, statuses) = Tunnel::new(id, config, self.settings.clone());
        let sink = self.sinks.lock().as_ref().map(|s| s.statuses.clone());
        if let Some(sink) = sink {
            self.relays.spawn(relay(statuses, sink));
        }

        tunnels.insert(id.to_string(), tunnel.clone());
        debug!("Registered tunnel {}", id);
        tunnel
    }

    /// Resolve credentials, bind the local port and begin accepting
    ///
    /// On failure the tunnel stays stopped and may be started again.
    pub async fn start_tunnel(&self, tunnel: &Arc<Tunnel>) -> Result<()> {
        if tunnel.is_retired() {
            return Err(TunnelError::Retired(tunnel.id().to_string()));
        }
        if tunnel.is_running() {
            return Err(TunnelError::AlreadyRunning(tunnel.id().to_string()));
        }

        if let Some(logs) = tunnel.take_log_receiver() {
            let sink = self.sinks.lock().as_ref().map(|s| s.logs.clone());
            if let Some(sink) = sink {
                self.relays.spawn(relay(logs, sink));
            }
        }

        let config = tunnel.config();
        if let Err(e) = config.validate() {
            tunnel.error(format!("Invalid tunnel configuration: {}", e)).await;
            return Err(e.into());
        }

        let resolver = self.auth.clone();
        let resolve_config = config.clone();
        let auth = tokio::task::spawn_blocking(move || resolver.resolve(&resolve_config))
            .await
            .unwrap_or_else(|e| Err(TunnelError::Auth(format!("resolver task failed: {}", e))));
        let auth = match auth {
            Ok(auth) => auth,
            Err(e) => {
                tunnel.error(format!("Failed to get SSH settings: {}", e)).await;
                return Err(e);
            }
        };

        let bind_host = if config.bind_address.is_empty() {
            DEFAULT_BIND_ADDRESS
        } else {
            config.bind_address.as_str()
        };
        let addr = format_host_port(bind_host, config.local_port);
        let listener = match TcpListener::bind(&addr).await {
            Ok(listener) => listener,
            Err(source) => {
                tunnel
                    .error(format!("Failed to listen on {}: {}", addr, source))
                    .await;
                return Err(TunnelError::Bind { addr, source });
            }
        };

        tunnel.launch(listener, auth, self.connector.clone()).await?;
        info!("Started tunnel {} on {}", tunnel.id(), addr);
        Ok(())
    }

    /// Stop and unregister a tunnel; unknown ids are ignored
    ///
    /// Returns once the listener, the SSH client and every task of the
    /// tunnel are gone (bounded by the stop grace period).
    pub async fn stop_tunnel(&self, id: &str) -> Result<()> {
        let tunnel = self.tunnels.read().await.get(id).cloned();
        let Some(tunnel) = tunnel else {
            debug!("Stop requested for unknown tunnel {}", id);
            return Ok(());
        };

        tunnel.shutdown().await;

        let mut tunnels = self.tunnels.write().await;
        if tunnels.get(id).is_some_and(|t| Arc::ptr_eq(t, &tunnel)) {
            tunnels.remove(id);
        }
        info!("Stopped tunnel {}", id);
        Ok(())
    }

    /// Stop every tunnel, then end the aggregate event streams
    pub async fn cleanup(&self) {
        let ids: Vec<String> = self.tunnels.read().await.keys().cloned().collect();
        for id in ids {
            if let Err(e) = self.stop_tunnel(&id).await {
                warn!("Failed to stop tunnel {} during cleanup: {}", id, e);
            }
        }

        self.relays.close();
        if tokio::time::timeout(self.settings.stop_grace, self.relays.wait())
            .await
            .is_err()
        {
            warn!("Event relays still draining after {:?}", self.settings.stop_grace);
        }
        self.sinks.lock().take();
    }

    pub async fn get_tunnel(&self, id: &str) -> Option<Arc<Tunnel>> {
        self.tunnels.read().await.get(id).cloned()
    }

    pub async fn tunnel_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.tunnels.read().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// `"↑<out> ↓<in> [<latency>]"`, or `"--"` for an unknown id
    pub async fn get_metrics_snapshot(&self, id: &str) -> String {
        match self.tunnels.read().await.get(id) {
            Some(tunnel) => tunnel.metrics().to_string(),
            None => "--".to_string(),
        }
    }
}

/// Forward one tunnel queue into a manager queue until either side closes
async fn relay<T: Send>(mut source: mpsc::Receiver<T>, sink: mpsc::Sender<T>) {
    while let Some(item) = source.recv().await {
        if sink.send(item).await.is_err() {
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::SshAuth;
    use crate::transport::SshSession;
    use async_trait::async_trait;
    use sshfwd_common::Endpoint;

    struct RefuseAuth;

    impl AuthResolver for RefuseAuth {
        fn resolve(&self, _: &TunnelConfig) -> Result<SshAuth> {
            Err(TunnelError::Auth("no identities".into()))
        }
    }

    struct RefuseConnect;

    #[async_trait]
    impl SshConnector for RefuseConnect {
        async fn connect(&self, hop: &Endpoint, _: &SshAuth) -> Result<Arc<dyn SshSession>> {
            Err(TunnelError::SshConnect {
                addr: hop.to_string(),
                reason: "connection refused".into(),
            })
        }
    }

    fn manager() -> TunnelManager {
        TunnelManager::new(
            EngineSettings::default(),
            Arc::new(RefuseAuth),
            Arc::new(RefuseConnect),
        )
    }

    fn config(name: &str) -> TunnelConfig {
        TunnelConfig {
            name: name.to_string(),
            local_port: 0,
            remote_port: 5432,
            remote_host: "db".to_string(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_create_is_idempotent() {
        let manager = manager();
        let first = manager.create_tunnel("db", config("db")).await;
        let second = manager.create_tunnel("db", config("other")).await;

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(second.name(), "db");
        assert_eq!(manager.tunnel_ids().await, vec!["db".to_string()]);
    }

    #[tokio::test]
    async fn test_unknown_ids() {
        let manager = manager();
        assert!(manager.stop_tunnel("nope").await.is_ok());
        assert_eq!(manager.get_metrics_snapshot("nope").await, "--");
        assert!(manager.get_tunnel("nope").await.is_none());
    }

    #[tokio::test]
    async fn test_auth_failure_fails_start() {
        let manager = manager();
        let mut streams = manager.take_event_streams().unwrap();
        let tunnel = manager.create_tunnel("db", config("db")).await;

        let err = manager.start_tunnel(&tunnel).await.unwrap_err();
        assert!(matches!(err, TunnelError::Auth(_)));
        assert!(!tunnel.is_running());

        let line = streams.logs.recv().await.unwrap();
        assert!(line.contains("[db] ERROR Failed to get SSH settings"), "{line}");
    }

    #[tokio::test]
    async fn test_invalid_config_fails_start() {
        let manager = manager();
        let mut bad = config("db");
        bad.remote_port = 0;
        let tunnel = manager.create_tunnel("db", bad).await;

        let err = manager.start_tunnel(&tunnel).await.unwrap_err();
        assert!(matches!(err, TunnelError::Config(_)));
    }

    #[tokio::test]
    async fn test_event_streams_taken_once() {
        let manager = manager();
        assert!(manager.take_event_streams().is_some());
        assert!(manager.take_event_streams().is_none());
    }

    #[tokio::test]
    async fn test_stop_removes_and_cleanup_ends_streams() {
        let manager = manager();
        let mut streams = manager.take_event_streams().unwrap();
        manager.create_tunnel("a", config("a")).await;
        manager.create_tunnel("b", config("b")).await;

        let drain = tokio::spawn(async move {
            let mut stopped = Vec::new();
            while let Some(status) = streams.statuses.recv().await {
                stopped.push(status.id);
            }
            stopped.sort();
            stopped
        });

        manager.stop_tunnel("a").await.unwrap();
        assert!(manager.get_tunnel("a").await.is_none());
        manager.cleanup().await;

        assert!(manager.tunnel_ids().await.is_empty());
        assert_eq!(drain.await.unwrap(), vec!["a".to_string(), "b".to_string()]);
    }
}
