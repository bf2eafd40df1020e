//! Test doubles for the transport and network session seams.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::net::TcpStream;
use tokio::sync::watch;

use crate::config::TunnelConfig;
use crate::network_session::{NetworkSession, ProxyConfigError, ProxyRules};
use crate::transport::{
    ChannelError, ConnectError, Connector, RelayChannel, SecureSession, SessionState,
};

/// A "remote side" that is this machine: channels are plain TCP connects.
pub struct LoopbackSession {
    state_tx: watch::Sender<SessionState>,
    state: watch::Receiver<SessionState>,
    refuse_channels: AtomicBool,
}

impl LoopbackSession {
    pub fn new() -> Arc<Self> {
        let (state_tx, state) = watch::channel(SessionState::Connected);
        Arc::new(Self {
            state_tx,
            state,
            refuse_channels: AtomicBool::new(false),
        })
    }

    pub fn refuse_channels(&self) {
        self.refuse_channels.store(true, Ordering::SeqCst);
    }

    /// Simulate the transport dying underneath the tunnel.
    pub fn fail(&self, reason: &str) {
        self.state_tx.send_replace(SessionState::Disconnected {
            reason: Some(reason.to_string()),
        });
    }

    pub fn is_closed(&self) -> bool {
        !self.state.borrow().is_connected()
    }
}

#[async_trait]
impl SecureSession for LoopbackSession {
    async fn open_channel(&self, host: &str, port: u16) -> Result<RelayChannel, ChannelError> {
        if self.is_closed() {
            return Err(ChannelError::SessionClosed);
        }
        let destination = format!("{host}:{port}");
        if self.refuse_channels.load(Ordering::SeqCst) {
            return Err(ChannelError::Refused {
                destination,
                reason: "administratively prohibited".into(),
            });
        }
        match TcpStream::connect((host, port)).await {
            Ok(stream) => Ok(Box::new(stream)),
            Err(e) => Err(ChannelError::Refused {
                destination,
                reason: e.to_string(),
            }),
        }
    }

    fn state(&self) -> watch::Receiver<SessionState> {
        self.state.clone()
    }

    fn close(&self) {
        if !self.is_closed() {
            self.state_tx.send_replace(SessionState::Disconnected { reason: None });
        }
    }
}

/// Hands out [`LoopbackSession`]s and remembers every one of them.
#[derive(Default)]
pub struct LoopbackConnector {
    attempts: AtomicUsize,
    delay: Option<Duration>,
    failure: Option<ConnectError>,
    sessions: Mutex<Vec<Arc<LoopbackSession>>>,
}

impl LoopbackConnector {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn with_delay(delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            delay: Some(delay),
            ..Self::default()
        })
    }

    pub fn failing(error: ConnectError) -> Arc<Self> {
        Arc::new(Self {
            failure: Some(error),
            ..Self::default()
        })
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    pub fn sessions(&self) -> Vec<Arc<LoopbackSession>> {
        self.sessions.lock().unwrap().clone()
    }
}

#[async_trait]
impl Connector for LoopbackConnector {
    async fn connect(&self, _config: &TunnelConfig) -> Result<Arc<dyn SecureSession>, ConnectError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if let Some(error) = &self.failure {
            return Err(error.clone());
        }
        let session = LoopbackSession::new();
        self.sessions.lock().unwrap().push(Arc::clone(&session));
        let session: Arc<dyn SecureSession> = session;
        Ok(session)
    }
}

/// Records every rule string it is given.
#[derive(Default)]
pub struct RecordingNetworkSession {
    rules: Mutex<Vec<String>>,
    reject: AtomicBool,
}

impl RecordingNetworkSession {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn rejecting() -> Arc<Self> {
        let session = Self::new();
        session.reject.store(true, Ordering::SeqCst);
        session
    }

    pub fn rules(&self) -> Vec<String> {
        self.rules.lock().unwrap().clone()
    }
}

#[async_trait]
impl NetworkSession for RecordingNetworkSession {
    async fn set_proxy(&self, rules: &ProxyRules) -> Result<(), ProxyConfigError> {
        if self.reject.load(Ordering::SeqCst) {
            return Err(ProxyConfigError {
                rules: rules.to_string(),
                source: std::io::Error::new(std::io::ErrorKind::PermissionDenied, "session is locked"),
            });
        }
        self.rules.lock().unwrap().push(rules.to_string());
        Ok(())
    }
}
