//! Secure transport abstraction.
//!
//! A [`Connector`] produces one authenticated [`SecureSession`]; the session
//! hands out duplex [`RelayChannel`]s to arbitrary `(host, port)` pairs
//! reached from the remote side. The SSH implementation lives in
//! [`crate::ssh_transport`].

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::watch;

use crate::config::TunnelConfig;

/// Duplex byte stream carried over the secure session.
pub trait ChannelStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> ChannelStream for T {}

pub type RelayChannel = Box<dyn ChannelStream>;

/// Lifecycle of one secure session as observed by the controller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionState {
    Connecting,
    Connected,
    /// `reason` is set when the session ended on a transport error rather
    /// than an explicit close.
    Disconnected { reason: Option<String> },
}

impl SessionState {
    pub fn is_connected(&self) -> bool {
        matches!(self, SessionState::Connected)
    }
}

/// Classified failure to establish a secure session.
///
/// The `Display` text is the short, actionable message shown to the user;
/// `detail()` returns the underlying transport message.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConnectError {
    #[error("Authentication failed - check SSH key and username")]
    AuthenticationFailed { detail: String },

    #[error("Host not found - check the SSH host address")]
    DnsResolutionFailed { detail: String },

    #[error("Host unreachable - check the SSH host address")]
    HostUnreachable { detail: String },

    #[error("Connection refused - host is not accepting SSH connections")]
    ConnectionRefused { detail: String },

    #[error("Connection timed out")]
    ConnectionTimedOut { detail: String },

    /// Fallback when the message matches no known category.
    #[error("{0}")]
    Transport(String),
}

impl ConnectError {
    pub fn detail(&self) -> &str {
        match self {
            ConnectError::AuthenticationFailed { detail }
            | ConnectError::DnsResolutionFailed { detail }
            | ConnectError::HostUnreachable { detail }
            | ConnectError::ConnectionRefused { detail }
            | ConnectError::ConnectionTimedOut { detail } => detail,
            ConnectError::Transport(message) => message,
        }
    }

    /// Best-effort classification by message text.
    ///
    /// Underlying error strings are not a stable contract, so anything
    /// unrecognised is passed through verbatim as [`ConnectError::Transport`].
    pub fn classify(message: &str) -> Self {
        let detail = message.to_string();
        let lower = message.to_ascii_lowercase();
        let has = |needles: &[&str]| needles.iter().any(|n| lower.contains(n));

        if has(&[
            "authentication methods failed",
            "authentication failed",
            "username/publickey combination invalid",
            "no identities found",
            "permission denied (publickey",
        ]) {
            ConnectError::AuthenticationFailed { detail }
        } else if has(&[
            "enotfound",
            "getaddrinfo",
            "failed to lookup address",
            "name or service not known",
            "nodename nor servname",
            "no such host",
            "temporary failure in name resolution",
        ]) {
            ConnectError::DnsResolutionFailed { detail }
        } else if has(&["econnrefused", "connection refused"]) {
            ConnectError::ConnectionRefused { detail }
        } else if has(&["ehostunreach", "no route to host", "network is unreachable", "host is unreachable"]) {
            ConnectError::HostUnreachable { detail }
        } else if has(&["etimedout", "timed out", "timeout"]) {
            ConnectError::ConnectionTimedOut { detail }
        } else {
            ConnectError::Transport(detail)
        }
    }

    /// Typed classification from the socket layer, falling back to text.
    pub fn from_io(err: &std::io::Error) -> Self {
        use std::io::ErrorKind;

        let detail = err.to_string();
        match err.kind() {
            ErrorKind::TimedOut => ConnectError::ConnectionTimedOut { detail },
            ErrorKind::ConnectionRefused => ConnectError::ConnectionRefused { detail },
            _ => Self::classify(&detail),
        }
    }
}

/// Per-request failure to open a channel. Never fatal to the session.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ChannelError {
    /// The remote side could not reach the destination.
    #[error("channel to {destination} refused: {reason}")]
    Refused { destination: String, reason: String },

    #[error("timed out opening channel to {destination}")]
    TimedOut { destination: String },

    #[error("secure session is closed")]
    SessionClosed,
}

/// One authenticated secure connection shared by every relay.
///
/// Relays only ever open channels; `close` belongs to the lifecycle
/// controller.
#[async_trait]
pub trait SecureSession: Send + Sync {
    /// Ask the remote side to open a TCP connection to `host:port`.
    async fn open_channel(&self, host: &str, port: u16) -> Result<RelayChannel, ChannelError>;

    /// Current state, updated on every transition.
    fn state(&self) -> watch::Receiver<SessionState>;

    /// Terminate the connection and every channel on it. Idempotent.
    fn close(&self);
}

#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, config: &TunnelConfig) -> Result<Arc<dyn SecureSession>, ConnectError>;
}
