use std::net::{Shutdown, SocketAddr, TcpStream, ToSocketAddrs};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use scopeguard::ScopeGuard;
use socket2::{Domain, Protocol, SockAddr, Socket, Type};
use ssh2::Session;
use tokio::sync::{mpsc, oneshot, watch};

use crate::config::{TunnelConfig, TunnelSettings};
use crate::ssh_driver::{is_transport_failure, Driver, DriverCommand};
use crate::transport::{
    ChannelError, ConnectError, Connector, RelayChannel, SecureSession, SessionState,
};

/// Opens SSH sessions authenticated through the local identity agent.
pub struct SshConnector {
    settings: TunnelSettings,
}

impl SshConnector {
    pub fn new(settings: TunnelSettings) -> Self {
        Self { settings }
    }
}

#[async_trait]
impl Connector for SshConnector {
    async fn connect(&self, config: &TunnelConfig) -> Result<Arc<dyn SecureSession>, ConnectError> {
        let settings = self.settings.clone();
        let target = config.clone();
        let limit = settings.connect_timeout;
        let pending = Arc::new(PendingSocket::default());

        // Timing out, failing, or this future being dropped all cut the
        // attempt's socket so the blocked handshake ends at once.
        let cutoff = scopeguard::guard(Arc::clone(&pending), |pending| pending.abandon());
        let attempt = tokio::task::spawn_blocking(move || establish(&target, &settings, &pending));
        let session = match tokio::time::timeout(limit, attempt).await {
            Ok(Ok(result)) => result?,
            Ok(Err(join)) => return Err(ConnectError::Transport(join.to_string())),
            Err(_) => {
                return Err(ConnectError::ConnectionTimedOut {
                    detail: format!("no SSH session after {}s", limit.as_secs()),
                })
            }
        };
        let _ = ScopeGuard::into_inner(cutoff);

        let peer = format!("{}@{}:{}", config.username, config.host, self.settings.ssh_port);
        tracing::info!(%peer, "SSH connected");
        let session: Arc<dyn SecureSession> = SshSession::spawn(session, peer, &self.settings)?;
        Ok(session)
    }
}

/// The socket of an in-flight attempt, kept so the waiting side can shut it
/// down instead of sitting out libssh2's own timeouts.
#[derive(Default)]
struct PendingSocket {
    slot: Mutex<PendingSlot>,
}

#[derive(Default)]
struct PendingSlot {
    socket: Option<TcpStream>,
    abandoned: bool,
}

impl PendingSocket {
    /// Fails when the attempt was given up while the TCP connect was running.
    fn register(&self, tcp: &TcpStream) -> Result<(), ConnectError> {
        let mut slot = self.slot.lock().unwrap_or_else(PoisonError::into_inner);
        if slot.abandoned {
            return Err(ConnectError::ConnectionTimedOut {
                detail: "attempt abandoned".into(),
            });
        }
        slot.socket = tcp.try_clone().ok();
        Ok(())
    }

    fn abandon(&self) {
        let mut slot = self.slot.lock().unwrap_or_else(PoisonError::into_inner);
        slot.abandoned = true;
        if let Some(socket) = slot.socket.take() {
            let _ = socket.shutdown(Shutdown::Both);
        }
    }
}

/// Resolve, connect, handshake and authenticate. Blocking.
fn establish(
    config: &TunnelConfig,
    settings: &TunnelSettings,
    pending: &PendingSocket,
) -> Result<Session, ConnectError> {
    let addrs = resolve(&config.host, settings.ssh_port)?;
    let tcp = connect_any(&addrs, settings.connect_timeout)?;
    pending.register(&tcp)?;

    let mut session = Session::new().map_err(|e| ConnectError::Transport(e.to_string()))?;
    session.set_tcp_stream(tcp);
    session.set_timeout(timeout_millis(settings.connect_timeout));
    session.handshake().map_err(|e| ConnectError::classify(&e.to_string()))?;

    authenticate(&session, &config.username, settings)?;
    session.set_keepalive(true, settings.keepalive_interval.as_secs().max(1) as u32);
    Ok(session)
}

fn resolve(host: &str, port: u16) -> Result<Vec<SocketAddr>, ConnectError> {
    let addrs: Vec<SocketAddr> = (host, port)
        .to_socket_addrs()
        .map_err(|e| ConnectError::DnsResolutionFailed {
            detail: format!("{host}: {e}"),
        })?
        .collect();
    if addrs.is_empty() {
        return Err(ConnectError::DnsResolutionFailed {
            detail: format!("{host}: no addresses"),
        });
    }
    Ok(addrs)
}

/// Try each resolved address in order; a host whose first record is on an
/// unrouted family is still reachable through the next one.
fn connect_any(addrs: &[SocketAddr], timeout: Duration) -> Result<TcpStream, ConnectError> {
    let mut last = None;
    for &addr in addrs {
        match connect_tcp(addr, timeout) {
            Ok(tcp) => return Ok(tcp),
            Err(e) => {
                tracing::debug!(%addr, error = %e.detail(), "address failed");
                last = Some(e);
            }
        }
    }
    Err(last.unwrap_or_else(|| ConnectError::DnsResolutionFailed {
        detail: "no addresses".into(),
    }))
}

fn connect_tcp(addr: SocketAddr, timeout: Duration) -> Result<TcpStream, ConnectError> {
    let io = |e: std::io::Error| ConnectError::from_io(&e);
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP)).map_err(io)?;
    socket.set_nodelay(true).map_err(io)?;
    socket.set_keepalive(true).map_err(io)?;
    socket.connect_timeout(&SockAddr::from(addr), timeout).map_err(io)?;
    Ok(socket.into())
}

fn authenticate(session: &Session, username: &str, settings: &TunnelSettings) -> Result<(), ConnectError> {
    if settings.agent_socket.is_none() {
        return Err(ConnectError::AuthenticationFailed {
            detail: "SSH_AUTH_SOCK is not set; no identity agent to authenticate with".into(),
        });
    }
    // libssh2 locates the agent through SSH_AUTH_SOCK and tries each identity.
    session.userauth_agent(username).map_err(|e| {
        if is_transport_failure(&e) {
            ConnectError::classify(&e.to_string())
        } else {
            ConnectError::AuthenticationFailed {
                detail: e.message().to_string(),
            }
        }
    })?;
    if !session.authenticated() {
        return Err(ConnectError::AuthenticationFailed {
            detail: "All configured authentication methods failed".into(),
        });
    }
    Ok(())
}

fn timeout_millis(timeout: Duration) -> u32 {
    u32::try_from(timeout.as_millis()).unwrap_or(u32::MAX)
}

/// Handle to a connected session; the session itself lives on the driver thread.
pub struct SshSession {
    commands: mpsc::UnboundedSender<DriverCommand>,
    state: watch::Receiver<SessionState>,
    channel_open_timeout: Duration,
}

impl SshSession {
    fn spawn(session: Session, peer: String, settings: &TunnelSettings) -> Result<Arc<Self>, ConnectError> {
        let (commands, command_rx) = mpsc::unbounded_channel();
        let (state_tx, state) = watch::channel(SessionState::Connected);
        let driver = Driver::new(session, peer, command_rx, state_tx, settings.keepalive_interval);

        std::thread::Builder::new()
            .name("ssh-driver".into())
            .spawn(move || driver.run())
            .map_err(|e| ConnectError::Transport(format!("failed to start SSH driver: {e}")))?;

        Ok(Arc::new(Self {
            commands,
            state,
            channel_open_timeout: settings.channel_open_timeout,
        }))
    }
}

#[async_trait]
impl SecureSession for SshSession {
    async fn open_channel(&self, host: &str, port: u16) -> Result<RelayChannel, ChannelError> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(DriverCommand::Open {
                host: host.to_string(),
                port,
                reply,
            })
            .map_err(|_| ChannelError::SessionClosed)?;

        match tokio::time::timeout(self.channel_open_timeout, response).await {
            Ok(Ok(Ok(stream))) => Ok(Box::new(stream)),
            Ok(Ok(Err(e))) => Err(e),
            Ok(Err(_)) => Err(ChannelError::SessionClosed),
            Err(_) => Err(ChannelError::TimedOut {
                destination: format!("{host}:{port}"),
            }),
        }
    }

    fn state(&self) -> watch::Receiver<SessionState> {
        self.state.clone()
    }

    fn close(&self) {
        // A second close finds the driver gone; nothing left to do.
        let _ = self.commands.send(DriverCommand::Shutdown);
    }
}

impl Drop for SshSession {
    fn drop(&mut self) {
        let _ = self.commands.send(DriverCommand::Shutdown);
    }
}
