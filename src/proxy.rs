use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::relay::RelayConnection;
use crate::transport::SecureSession;
use crate::tunnel_stats::TunnelStats;

#[derive(Debug, Error)]
pub enum BindError {
    #[error("failed to bind SOCKS5 listener on loopback: {0}")]
    BindFailed(#[source] std::io::Error),
}

/// Loopback SOCKS5 server relaying every connection through one session.
pub struct SocksListener {
    session: Arc<dyn SecureSession>,
    stats: Arc<TunnelStats>,
}

impl SocksListener {
    pub fn new(session: Arc<dyn SecureSession>, stats: Arc<TunnelStats>) -> Self {
        Self { session, stats }
    }

    /// Bind `127.0.0.1` on an OS-assigned port and start accepting.
    pub async fn start(self) -> Result<ListenerHandle, BindError> {
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0))
            .await
            .map_err(BindError::BindFailed)?;
        let local_addr = listener.local_addr().map_err(BindError::BindFailed)?;
        tracing::info!(%local_addr, "SOCKS5 proxy listening");

        let cancel = CancellationToken::new();
        let task = tokio::spawn(self.accept_connections(listener, cancel.clone()));
        Ok(ListenerHandle {
            local_addr,
            cancel,
            task,
        })
    }

    async fn accept_connections(self, listener: TcpListener, cancel: CancellationToken) {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        let _ = stream.set_nodelay(true);
                        let relay = RelayConnection::new(
                            stream,
                            peer,
                            Arc::clone(&self.session),
                            Arc::clone(&self.stats),
                        );
                        tokio::spawn(relay.run());
                    }
                    Err(e) => {
                        // Usually descriptor exhaustion; back off instead of spinning.
                        tracing::warn!(error = %e, "accept failed");
                        tokio::time::sleep(Duration::from_millis(100)).await;
                    }
                },
            }
        }
        tracing::info!("SOCKS5 proxy stopped");
    }
}

/// The bound listener. Its port is what the consuming session is pointed at.
#[derive(Debug)]
pub struct ListenerHandle {
    local_addr: SocketAddr,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl ListenerHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn port(&self) -> u16 {
        self.local_addr.port()
    }

    /// Stop accepting and release the port. In-flight relays keep running
    /// until their own sockets close.
    pub async fn stop(mut self) {
        self.cancel.cancel();
        let _ = (&mut self.task).await;
    }
}

impl Drop for ListenerHandle {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
