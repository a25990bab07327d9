// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 sshfwd Contributors

// russh-backed SSH transport

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use russh::client::{self, AuthResult, Config, Handle};
use russh::keys::PrivateKeyWithHashAlg;
use tracing::{debug, info, warn};

use sshfwd_common::{format_host_port, Endpoint};

use crate::auth::SshAuth;
use crate::error::{Result, TunnelError};
use crate::known_hosts::HostKeyCheck;
use crate::transport::{BoxedStream, SshConnector, SshSession};

const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(30);
const KEEPALIVE_MAX: usize = 3;

/// Connects with russh and public-key authentication
#[derive(Debug, Clone, Default)]
pub struct RusshConnector;

impl RusshConnector {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl SshConnector for RusshConnector {
    async fn connect(&self, hop: &Endpoint, auth: &SshAuth) -> Result<Arc<dyn SshSession>> {
        let mut cfg = Config::default();
        cfg.nodelay = true;
        cfg.keepalive_interval = Some(KEEPALIVE_INTERVAL);
        cfg.keepalive_max = KEEPALIVE_MAX;
        let config = Arc::new(cfg);

        let addr = format_host_port(&hop.host, hop.port);
        let handler = ClientHandler {
            host: hop.host.clone(),
            port: hop.port,
            host_keys: auth.host_keys.clone(),
        };

        // One deadline covers the handshake and authentication
        let handshake = async {
            let mut handle = client::connect(config, addr.as_str(), handler)
                .await
                .map_err(|e| TunnelError::SshConnect {
                    addr: addr.clone(),
                    reason: e.to_string(),
                })?;
            authenticate(&mut handle, auth).await?;
            Ok::<_, TunnelError>(handle)
        };
        let handle = match tokio::time::timeout(auth.timeout, handshake).await {
            Ok(handle) => handle?,
            Err(_) => {
                return Err(TunnelError::SshConnect {
                    addr,
                    reason: format!("timed out after {:?}", auth.timeout),
                })
            }
        };

        info!("SSH session established to {} as {}", addr, hop.user);

        Ok(Arc::new(RusshSession {
            handle,
            addr,
            closed: AtomicBool::new(false),
        }))
    }
}

/// Offer each identity in order until the server accepts one
async fn authenticate(handle: &mut Handle<ClientHandler>, auth: &SshAuth) -> Result<()> {
    let user = auth.user();

    for identity in &auth.identities {
        let key = PrivateKeyWithHashAlg::new(
            identity.key.clone(),
            handle.best_supported_rsa_hash().await?.flatten(),
        );

        match handle.authenticate_publickey(user, key).await? {
            AuthResult::Success => {
                debug!("Authenticated as {} with {}", user, identity.path.display());
                return Ok(());
            }
            AuthResult::Failure { .. } => {
                debug!("Server rejected {} for {}", identity.path.display(), user);
            }
        }
    }

    Err(TunnelError::Auth(format!(
        "server rejected all {} identities for user {}",
        auth.identities.len(),
        user
    )))
}

struct ClientHandler {
    host: String,
    port: u16,
    host_keys: HostKeyCheck,
}

impl client::Handler for ClientHandler {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        server_public_key: &russh::keys::PublicKey,
    ) -> std::result::Result<bool, Self::Error> {
        self.host_keys
            .check(&self.host, self.port, server_public_key)
            .map_err(|e| {
                russh::Error::from(std::io::Error::new(
                    std::io::ErrorKind::Other,
                    format!("host key verification failed: {}", e),
                ))
            })
    }
}

/// One authenticated russh client
pub struct RusshSession {
    handle: Handle<ClientHandler>,
    addr: String,
    closed: AtomicBool,
}

#[async_trait]
impl SshSession for RusshSession {
    async fn probe(&self) -> Result<()> {
        let channel = self.handle.channel_open_session().await?;
        channel.close().await?;
        Ok(())
    }

    async fn open_direct(&self, target: &Endpoint, originator: SocketAddr) -> Result<BoxedStream> {
        let channel = self
            .handle
            .channel_open_direct_tcpip(
                target.host.clone(),
                u32::from(target.port),
                originator.ip().to_string(),
                u32::from(originator.port()),
            )
            .await
            .map_err(|e| TunnelError::RemoteDial {
                target: target.to_string(),
                reason: e.to_string(),
            })?;

        Ok(Box::new(channel.into_stream()))
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Err(e) = self
            .handle
            .disconnect(russh::Disconnect::ByApplication, "", "en")
            .await
        {
            warn!("Failed to disconnect from {} gracefully: {}", self.addr, e);
        }
        debug!("Closed SSH session to {}", self.addr);
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst) || self.handle.is_closed()
    }
}
