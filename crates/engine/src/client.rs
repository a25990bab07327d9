// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 sshfwd Contributors

// Shared SSH client slot for one tunnel

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::debug;

use crate::error::{Result, TunnelError};
use crate::transport::SshSession;

/// Result of [`ClientCell::acquire`]
pub struct Acquired {
    pub client: Arc<dyn SshSession>,
    /// `true` when a new connection was dialed for this caller
    pub fresh: bool,
}

/// Holds at most one live SSH client
///
/// Replacement (probe the current client, dial a new one) is serialized by
/// an async lock so concurrent connections never dial twice. The pointer
/// itself sits behind a short synchronous lock that is never held across an
/// await. Invalidation is compare-and-clear: only the caller that actually
/// removes a client closes it. After `shutdown` the cell stays empty and a
/// client dialed by a straggler is closed instead of installed.
pub struct ClientCell {
    slot: Mutex<Slot>,
    replace: tokio::sync::Mutex<()>,
}

#[derive(Default)]
struct Slot {
    client: Option<Arc<dyn SshSession>>,
    closed: bool,
}

impl ClientCell {
    pub fn new() -> Self {
        Self {
            slot: Mutex::new(Slot::default()),
            replace: tokio::sync::Mutex::new(()),
        }
    }

    pub fn current(&self) -> Option<Arc<dyn SshSession>> {
        self.slot.lock().client.clone()
    }

    /// Return a healthy client, dialing one with `connect` if needed
    pub async fn acquire<F, Fut>(&self, probe_timeout: Duration, connect: F) -> Result<Acquired>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Arc<dyn SshSession>>>,
    {
        let _guard = self.replace.lock().await;
        if self.slot.lock().closed {
            return Err(TunnelError::ShuttingDown);
        }

        if let Some(existing) = self.current() {
            match tokio::time::timeout(probe_timeout, existing.probe()).await {
                Ok(Ok(())) => {
                    return Ok(Acquired {
                        client: existing,
                        fresh: false,
                    })
                }
                Ok(Err(e)) => debug!("Discarding unhealthy SSH client: {}", e),
                Err(_) => debug!("Discarding SSH client: probe timed out"),
            }
            self.invalidate(&existing).await;
        }

        let client = connect().await?;
        let installed = {
            let mut slot = self.slot.lock();
            if !slot.closed {
                slot.client = Some(client.clone());
            }
            !slot.closed
        };
        if !installed {
            debug!("Dropping SSH client dialed during shutdown");
            client.close().await;
            return Err(TunnelError::ShuttingDown);
        }
        Ok(Acquired {
            client,
            fresh: true,
        })
    }

    /// Clear the slot if it still holds `client`, then close it
    ///
    /// Returns whether this call did the clearing. A stale pointer (the
    /// slot was already replaced) is left alone.
    pub async fn invalidate(&self, client: &Arc<dyn SshSession>) -> bool {
        let cleared = {
            let mut slot = self.slot.lock();
            match slot.client.as_ref() {
                Some(current) if Arc::ptr_eq(current, client) => {
                    slot.client = None;
                    true
                }
                _ => false,
            }
        };
        if cleared {
            client.close().await;
        }
        cleared
    }

    /// Remove and close whatever client is present, and refuse new ones
    pub async fn shutdown(&self) {
        let taken = {
            let mut slot = self.slot.lock();
            slot.closed = true;
            slot.client.take()
        };
        if let Some(client) = taken {
            client.close().await;
        }
    }
}

impl Default for ClientCell {
    fn default() -> Self {
        Self::new()
    }
}
