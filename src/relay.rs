//! Per-connection SOCKS5 relay.
//!
//! One [`RelayConnection`] per accepted client socket:
//! `AwaitingGreeting → AwaitingRequest → Relaying → Closed`. Protocol
//! violations drop the socket without a reply; a refused channel gets an
//! echoed failure reply; a successful one becomes a raw byte pipe.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::socks::{self, HandshakeError, ReplyCode};
use crate::transport::{ChannelError, SecureSession};
use crate::tunnel_stats::TunnelStats;

const BUFFER_SIZE: usize = 64 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayState {
    AwaitingGreeting,
    AwaitingRequest,
    Relaying,
    Closed,
}

#[derive(Debug, Error)]
pub enum RelayError {
    #[error(transparent)]
    Handshake(#[from] HandshakeError),

    #[error(transparent)]
    Channel(#[from] ChannelError),

    #[error("client socket: {0}")]
    Io(#[from] io::Error),
}

/// Bytes moved in each direction by one relay.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Transfer {
    pub up: u64,
    pub down: u64,
}

pub struct RelayConnection<S> {
    client: S,
    peer: SocketAddr,
    state: RelayState,
    session: Arc<dyn SecureSession>,
    stats: Arc<TunnelStats>,
}

impl<S> RelayConnection<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    pub fn new(client: S, peer: SocketAddr, session: Arc<dyn SecureSession>, stats: Arc<TunnelStats>) -> Self {
        Self {
            client,
            peer,
            state: RelayState::AwaitingGreeting,
            session,
            stats,
        }
    }

    pub fn state(&self) -> RelayState {
        self.state
    }

    /// Drive the connection to completion and return the state it ended in.
    /// Errors stay local to this connection; the client socket is dropped on
    /// return.
    pub async fn run(mut self) -> RelayState {
        let outcome = self.drive().await;
        let last = self.state;
        self.state = RelayState::Closed;

        match outcome {
            Ok(()) => {}
            Err(RelayError::Handshake(e)) => {
                self.stats.handshake_rejected();
                tracing::debug!(peer = %self.peer, state = ?last, error = %e, "dropping non-SOCKS5 client");
            }
            Err(RelayError::Channel(e)) => {
                self.stats.channel_refused();
                tracing::debug!(peer = %self.peer, error = %e, "channel open failed");
            }
            Err(RelayError::Io(e)) => {
                tracing::debug!(peer = %self.peer, state = ?last, error = %e, "client socket error");
            }
        }
        last
    }

    async fn drive(&mut self) -> Result<(), RelayError> {
        socks::read_greeting(&mut self.client).await?;
        self.client.write_all(&socks::GREETING_REPLY).await?;
        self.state = RelayState::AwaitingRequest;

        let request = socks::read_request(&mut self.client).await?;
        let destination = request.destination().clone();

        let channel = match self.session.open_channel(&destination.host, destination.port).await {
            Ok(channel) => channel,
            Err(e) => {
                self.client.write_all(&request.reply(ReplyCode::Failure)).await?;
                let _ = self.client.shutdown().await;
                return Err(e.into());
            }
        };
        self.client.write_all(&request.reply(ReplyCode::Succeeded)).await?;
        self.state = RelayState::Relaying;

        self.stats.relay_started();
        tracing::debug!(peer = %self.peer, %destination, "relaying");
        let (transfer, result) = pump(&mut self.client, channel).await;
        self.stats.relay_closed(transfer.up, transfer.down);
        tracing::debug!(peer = %self.peer, %destination, up = transfer.up, down = transfer.down, "relay closed");
        result.map_err(RelayError::from)
    }
}

/// Copy bytes both ways until either side closes or fails, then close the
/// other side. Both endpoints are dropped when this returns.
pub async fn pump<A, B>(client: A, channel: B) -> (Transfer, io::Result<()>)
where
    A: AsyncRead + AsyncWrite + Unpin,
    B: AsyncRead + AsyncWrite + Unpin,
{
    let (mut client_read, mut client_write) = tokio::io::split(client);
    let (mut channel_read, mut channel_write) = tokio::io::split(channel);
    let mut transfer = Transfer::default();

    let result = {
        let client_to_channel = copy_until_closed(&mut client_read, &mut channel_write, &mut transfer.up);
        let channel_to_client = copy_until_closed(&mut channel_read, &mut client_write, &mut transfer.down);
        tokio::select! {
            r = client_to_channel => r,
            r = channel_to_client => r,
        }
    };

    // The finished direction already shut its writer; close the other one.
    let _ = client_write.shutdown().await;
    let _ = channel_write.shutdown().await;
    (transfer, result)
}

async fn copy_until_closed<R, W>(reader: &mut R, writer: &mut W, counter: &mut u64) -> io::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; BUFFER_SIZE];
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            return writer.shutdown().await;
        }
        writer.write_all(&buf[..n]).await?;
        *counter += n as u64;
    }
}
