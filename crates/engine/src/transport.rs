// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 sshfwd Contributors

// SSH transport seam
// The engine only talks to SSH through these traits; `ssh.rs` implements
// them on top of russh.

use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};

use sshfwd_common::Endpoint;

use crate::auth::SshAuth;
use crate::error::Result;

/// Byte stream carried over an SSH channel
pub trait ForwardStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> ForwardStream for T {}

pub type BoxedStream = Box<dyn ForwardStream>;

/// An authenticated SSH client connection
#[async_trait]
pub trait SshSession: Send + Sync {
    /// Open and immediately close a session channel
    ///
    /// Used both as a liveness check and to measure round-trip latency.
    async fn probe(&self) -> Result<()>;

    /// Open a direct-tcpip channel to `target`, as seen from the SSH server
    async fn open_direct(&self, target: &Endpoint, originator: SocketAddr) -> Result<BoxedStream>;

    /// Disconnect; calling this more than once is a no-op
    async fn close(&self);

    fn is_closed(&self) -> bool;
}

/// Dials and authenticates SSH hops
#[async_trait]
pub trait SshConnector: Send + Sync {
    async fn connect(&self, hop: &Endpoint, auth: &SshAuth) -> Result<Arc<dyn SshSession>>;
}
