// Shared test doubles: an in-process SSH transport that dials local sockets

#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

use sshfwd_common::{Endpoint, TunnelConfig, TunnelState, TunnelStatus};
use sshfwd_engine::{
    AuthResolver, BoxedStream, EngineSettings, HostKeyCheck, HostKeyPolicy, Result, SshAuth,
    SshConnector, SshSession, TunnelError, TunnelManager,
};

/// Echo every byte back until the peer closes
pub async fn echo_server() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        loop {
            let Ok((mut stream, _)) = listener.accept().await else {
                return;
            };
            tokio::spawn(async move {
                let mut buf = [0u8; 1024];
                loop {
                    match stream.read(&mut buf).await {
                        Ok(0) | Err(_) => return,
                        Ok(n) => {
                            if stream.write_all(&buf[..n]).await.is_err() {
                                return;
                            }
                        }
                    }
                }
            });
        }
    });
    addr
}

/// Accept connections and never answer, keeping them open
pub async fn silent_server() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let mut held = Vec::new();
        while let Ok((stream, _)) = listener.accept().await {
            held.push(stream);
        }
    });
    addr
}

pub fn fast_settings() -> EngineSettings {
    EngineSettings {
        accept_poll: Duration::from_millis(50),
        health_interval: Duration::from_millis(50),
        health_timeout: Duration::from_millis(500),
        retry_base_delay: Duration::from_millis(100),
        stop_grace: Duration::from_secs(2),
        ..EngineSettings::default()
    }
}

pub fn tunnel_config(name: &str) -> TunnelConfig {
    TunnelConfig {
        name: name.to_string(),
        local_port: 0,
        remote_port: 5432,
        remote_host: "db.internal".to_string(),
        bind_address: "127.0.0.1".to_string(),
        ..Default::default()
    }
}

pub struct StaticAuth;

impl AuthResolver for StaticAuth {
    fn resolve(&self, config: &TunnelConfig) -> Result<SshAuth> {
        let mut hop = config.ssh_hop();
        hop.user = "tester".to_string();
        Ok(SshAuth {
            hop,
            identities: Vec::new(),
            timeout: Duration::from_secs(1),
            host_keys: HostKeyCheck::new(HostKeyPolicy::AcceptAny, "/nonexistent/known_hosts"),
        })
    }
}

/// What `open_direct` does
#[derive(Clone)]
pub enum DialMode {
    /// Connect to this local address
    Connect(SocketAddr),
    /// Fail every attempt with this reason
    Fail(String),
}

pub struct MockSession {
    mode: Mutex<DialMode>,
    pub healthy: AtomicBool,
    pub closes: AtomicUsize,
    dials: Mutex<Vec<Instant>>,
}

impl MockSession {
    pub fn dial_times(&self) -> Vec<Instant> {
        self.dials.lock().clone()
    }

    pub fn close_count(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SshSession for MockSession {
    async fn probe(&self) -> Result<()> {
        if self.healthy.load(Ordering::SeqCst) && self.closes.load(Ordering::SeqCst) == 0 {
            Ok(())
        } else {
            Err(TunnelError::SshConnect {
                addr: "mock".into(),
                reason: "session channel refused".into(),
            })
        }
    }

    async fn open_direct(&self, target: &Endpoint, _originator: SocketAddr) -> Result<BoxedStream> {
        self.dials.lock().push(Instant::now());
        let mode = self.mode.lock().clone();
        match mode {
            DialMode::Connect(addr) => {
                let stream = TcpStream::connect(addr).await?;
                Ok(Box::new(stream))
            }
            DialMode::Fail(reason) => Err(TunnelError::RemoteDial {
                target: target.to_string(),
                reason,
            }),
        }
    }

    async fn close(&self) {
        self.closes.fetch_add(1, Ordering::SeqCst);
    }

    fn is_closed(&self) -> bool {
        self.closes.load(Ordering::SeqCst) > 0
    }
}

/// Hands out `MockSession`s; the first `fail_first` connects are refused
pub struct MockConnector {
    mode: DialMode,
    fail_first: AtomicUsize,
    connects: AtomicUsize,
    sessions: Mutex<Vec<Arc<MockSession>>>,
    hops: Mutex<Vec<Endpoint>>,
}

impl MockConnector {
    pub fn new(mode: DialMode) -> Arc<Self> {
        Self::failing_first(mode, 0)
    }

    pub fn failing_first(mode: DialMode, failures: usize) -> Arc<Self> {
        Arc::new(Self {
            mode,
            fail_first: AtomicUsize::new(failures),
            connects: AtomicUsize::new(0),
            sessions: Mutex::new(Vec::new()),
            hops: Mutex::new(Vec::new()),
        })
    }

    pub fn connect_count(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    pub fn sessions(&self) -> Vec<Arc<MockSession>> {
        self.sessions.lock().clone()
    }

    pub fn hops(&self) -> Vec<Endpoint> {
        self.hops.lock().clone()
    }
}

#[async_trait]
impl SshConnector for MockConnector {
    async fn connect(&self, hop: &Endpoint, _auth: &SshAuth) -> Result<Arc<dyn SshSession>> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        self.hops.lock().push(hop.clone());

        let refuse = self
            .fail_first
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if refuse {
            return Err(TunnelError::SshConnect {
                addr: hop.to_string(),
                reason: "connection refused".into(),
            });
        }

        let session = Arc::new(MockSession {
            mode: Mutex::new(self.mode.clone()),
            healthy: AtomicBool::new(true),
            closes: AtomicUsize::new(0),
            dials: Mutex::new(Vec::new()),
        });
        self.sessions.lock().push(session.clone());
        Ok(session)
    }
}

/// Drains a manager's aggregate queues so producers never block
pub struct Recorder {
    pub statuses: Arc<Mutex<Vec<TunnelStatus>>>,
    pub logs: Arc<Mutex<Vec<String>>>,
    tasks: Vec<JoinHandle<()>>,
}

impl Recorder {
    pub fn attach(manager: &TunnelManager) -> Self {
        let mut streams = manager.take_event_streams().expect("event streams already taken");
        let statuses = Arc::new(Mutex::new(Vec::new()));
        let logs = Arc::new(Mutex::new(Vec::new()));

        let status_sink = statuses.clone();
        let status_task = tokio::spawn(async move {
            while let Some(status) = streams.statuses.recv().await {
                status_sink.lock().push(status);
            }
        });
        let log_sink = logs.clone();
        let mut log_stream = streams.logs;
        let log_task = tokio::spawn(async move {
            while let Some(line) = log_stream.recv().await {
                log_sink.lock().push(line);
            }
        });

        Self {
            statuses,
            logs,
            tasks: vec![status_task, log_task],
        }
    }

    pub fn states(&self, id: &str) -> Vec<TunnelState> {
        self.statuses
            .lock()
            .iter()
            .filter(|s| s.id == id)
            .map(|s| s.state)
            .collect()
    }

    pub fn count(&self, id: &str, state: TunnelState) -> usize {
        self.states(id).into_iter().filter(|s| *s == state).count()
    }

    /// Wait until `id` has reported `state` at least `times` times
    pub async fn wait_for(&self, id: &str, state: TunnelState, times: usize) {
        wait_until(|| self.count(id, state) >= times).await;
    }

    pub fn has_log(&self, needle: &str) -> bool {
        self.logs.lock().iter().any(|line| line.contains(needle))
    }

    /// Resolves once both aggregate streams have ended
    pub async fn finished(self) {
        for task in self.tasks {
            task.await.unwrap();
        }
    }
}

pub async fn wait_until(mut condition: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !condition() {
        assert!(Instant::now() < deadline, "condition not met within 5s");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

pub fn manager_with(connector: Arc<MockConnector>) -> TunnelManager {
    manager_with_settings(connector, fast_settings())
}

pub fn manager_with_settings(connector: Arc<MockConnector>, settings: EngineSettings) -> TunnelManager {
    TunnelManager::new(settings, Arc::new(StaticAuth), connector)
}
