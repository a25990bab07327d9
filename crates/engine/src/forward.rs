// Per-connection forwarding through the tunnel's SSH client

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use sshfwd_common::TunnelState;

use crate::error::TunnelError;
use crate::transport::{BoxedStream, SshSession};
use crate::tunnel::{RunContext, Tunnel};

const COPY_BUFFER_SIZE: usize = 32 * 1024;

#[derive(Clone, Copy)]
enum Direction {
    /// local → remote
    Outbound,
    /// remote → local
    Inbound,
}

/// Serve one accepted local connection until either side finishes or the
/// tunnel stops
///
/// Both sockets are owned here and dropped exactly once when this returns.
pub(crate) async fn handle_connection(
    tunnel: Arc<Tunnel>,
    ctx: Arc<RunContext>,
    local: TcpStream,
    peer: SocketAddr,
    cancel: CancellationToken,
) {
    if cancel.is_cancelled() {
        return;
    }

    let (t, c) = (&*tunnel, &*ctx);
    let connect = || async move {
        t.debug(format!("Connecting to SSH server {}", c.hop)).await;
        t.events
            .status(TunnelState::Connecting, "connecting to SSH server")
            .await;
        c.connector.connect(&c.hop, &c.auth).await
    };
    let acquired = tokio::select! {
        _ = cancel.cancelled() => return,
        acquired = tunnel.client.acquire(tunnel.settings.health_timeout, connect) => acquired,
    };
    let client = match acquired {
        Ok(acquired) => {
            if acquired.fresh {
                tunnel.debug(format!("SSH session to {} ready", ctx.hop)).await;
            }
            acquired.client
        }
        Err(TunnelError::ShuttingDown) => return,
        Err(e) => {
            tunnel.fail(format!("SSH connection failed: {}", e)).await;
            return;
        }
    };

    let Some(remote) = dial_remote(&tunnel, &ctx, &client, peer, &cancel).await else {
        return;
    };

    tunnel.connection_opened();
    tunnel
        .events
        .status(TunnelState::Active, "tunnel established")
        .await;

    pipe(&tunnel, local, remote, &cancel).await;

    if tunnel.connection_closed() && !cancel.is_cancelled() {
        tunnel
            .events
            .status(TunnelState::Connecting, "connection closed, waiting for traffic")
            .await;
    }
}

/// Open the direct-tcpip channel, retrying with linear backoff
///
/// Returns `None` when stopped or when the dial is abandoned; in the latter
/// case the shared client has been torn down and the tunnel is in `error`.
async fn dial_remote(
    tunnel: &Tunnel,
    ctx: &RunContext,
    client: &Arc<dyn SshSession>,
    peer: SocketAddr,
    cancel: &CancellationToken,
) -> Option<BoxedStream> {
    let attempts = tunnel.settings.dial_attempts.max(1);
    let mut last_error = String::new();

    for attempt in 1..=attempts {
        if cancel.is_cancelled() {
            return None;
        }
        tunnel
            .debug(format!(
                "Dialing {} (attempt {}/{})",
                ctx.target, attempt, attempts
            ))
            .await;

        let dialed = tokio::select! {
            _ = cancel.cancelled() => return None,
            dialed = client.open_direct(&ctx.target, peer) => dialed,
        };

        match dialed {
            Ok(stream) => return Some(stream),
            Err(e) => {
                last_error = e.to_string();
                if e.is_connection_error() {
                    tunnel
                        .debug(format!("SSH connection lost while dialing: {}", last_error))
                        .await;
                    break;
                }
                if attempt < attempts {
                    tokio::select! {
                        _ = cancel.cancelled() => return None,
                        _ = tokio::time::sleep(tunnel.settings.backoff(attempt)) => {}
                    }
                }
            }
        }
    }

    tunnel.client.invalidate(client).await;
    tunnel
        .fail(format!(
            "Remote connection to {} failed: {}",
            ctx.target, last_error
        ))
        .await;
    None
}

/// Copy both directions until EOF, error, or stop
async fn pipe(tunnel: &Tunnel, local: TcpStream, remote: BoxedStream, cancel: &CancellationToken) {
    let (mut local_read, mut local_write) = local.into_split();
    let (mut remote_read, mut remote_write) = tokio::io::split(remote);

    let outbound = copy_counted(tunnel, &mut local_read, &mut remote_write, Direction::Outbound);
    let inbound = copy_counted(tunnel, &mut remote_read, &mut local_write, Direction::Inbound);

    tokio::select! {
        _ = cancel.cancelled() => {
            debug!(tunnel = %tunnel.id(), "Closing forwarded connection on stop");
        }
        result = async { tokio::try_join!(outbound, inbound) } => {
            match result {
                Ok((sent, received)) => debug!(
                    tunnel = %tunnel.id(),
                    "Connection finished: {} bytes out, {} bytes in",
                    sent,
                    received
                ),
                Err(e) => tunnel.debug(format!("Connection ended: {}", e)).await,
            }
        }
    }
}

async fn copy_counted<R, W>(
    tunnel: &Tunnel,
    reader: &mut R,
    writer: &mut W,
    direction: Direction,
) -> io::Result<u64>
where
    R: AsyncRead + Unpin + ?Sized,
    W: AsyncWrite + Unpin + ?Sized,
{
    let mut buf = vec![0u8; COPY_BUFFER_SIZE];
    let mut total = 0u64;

    loop {
        let n = match reader.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => break,
            Err(e) => return Err(e),
        };

        writer.write_all(&buf[..n]).await?;
        match direction {
            Direction::Outbound => tunnel.record_out(n),
            Direction::Inbound => tunnel.record_in(n),
        }
        total += n as u64;
    }

    // Propagate the half-close; the peer may already be gone
    let _ = writer.shutdown().await;
    Ok(total)
}
