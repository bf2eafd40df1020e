//! Tunnel lifecycle: connect, serve, tear down, reconnect after resume.
//!
//! At most one secure session is alive per controller. Every operation that
//! creates or destroys it runs under one async lock, so `initialize`,
//! `teardown` and a resume reconnect never interleave. The `reconnecting`
//! flag additionally turns overlapping resume notifications into no-ops
//! instead of queueing them behind the lock.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use scopeguard::defer;
use thiserror::Error;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;

use crate::config::{MissingConfiguration, TunnelConfig};
use crate::network_session::{NetworkSession, ProxyConfigError, ProxyRules};
use crate::proxy::{BindError, ListenerHandle, SocksListener};
use crate::transport::{ConnectError, Connector, SecureSession, SessionState};
use crate::tunnel_stats::TunnelStats;

#[derive(Debug, Error)]
pub enum TunnelError {
    #[error(transparent)]
    MissingConfiguration(#[from] MissingConfiguration),

    #[error(transparent)]
    Connect(#[from] ConnectError),

    #[error(transparent)]
    Bind(#[from] BindError),

    #[error(transparent)]
    ProxyConfiguration(#[from] ProxyConfigError),
}

struct ActiveTunnel {
    session: Arc<dyn SecureSession>,
    listener: ListenerHandle,
    watcher: JoinHandle<()>,
}

/// What the last `initialize` was asked to do; replayed on resume.
#[derive(Clone)]
struct LastTarget {
    target: Arc<dyn NetworkSession>,
    config: TunnelConfig,
}

#[derive(Default)]
struct Inner {
    active: Option<ActiveTunnel>,
    last: Option<LastTarget>,
}

pub struct TunnelController {
    connector: Arc<dyn Connector>,
    inner: Mutex<Inner>,
    reconnecting: AtomicBool,
    status: Arc<watch::Sender<bool>>,
    stats: Arc<TunnelStats>,
}

impl TunnelController {
    pub fn new(connector: Arc<dyn Connector>) -> Self {
        let (status, _) = watch::channel(false);
        Self {
            connector,
            inner: Mutex::new(Inner::default()),
            reconnecting: AtomicBool::new(false),
            status: Arc::new(status),
            stats: TunnelStats::new(),
        }
    }

    /// Connect, start the SOCKS5 listener and point `target` at it.
    ///
    /// Returns the listener address. An already running tunnel is torn down
    /// first. On failure nothing started by this call is left running.
    pub async fn initialize(
        &self,
        target: Arc<dyn NetworkSession>,
        config: TunnelConfig,
    ) -> Result<SocketAddr, TunnelError> {
        config.validate()?;

        let mut inner = self.inner.lock().await;
        if inner.active.is_some() {
            let previous = inner.last.as_ref().map(|last| Arc::clone(&last.target));
            self.teardown_locked(&mut inner, previous.as_deref()).await?;
        }
        inner.last = Some(LastTarget {
            target: Arc::clone(&target),
            config: config.clone(),
        });
        self.start_locked(&mut inner, target, config).await
    }

    /// Stop the listener, close the session and, when given, reset `target`
    /// to direct routing. Safe to call when nothing is running.
    pub async fn teardown(&self, target: Option<&dyn NetworkSession>) -> Result<(), TunnelError> {
        let mut inner = self.inner.lock().await;
        self.teardown_locked(&mut inner, target).await?;
        Ok(())
    }

    /// Best-effort reconnect with the last configuration. Failures are
    /// logged, never returned.
    pub async fn on_system_resume(&self) {
        if self.reconnecting.swap(true, Ordering::AcqRel) {
            tracing::debug!("reconnect already in progress");
            return;
        }
        defer! {
            self.reconnecting.store(false, Ordering::Release);
        }

        let mut inner = self.inner.lock().await;
        let Some(LastTarget { target, config }) = inner.last.clone() else {
            tracing::debug!("resume with no tunnel configured");
            return;
        };

        tracing::info!(host = %config.host, "system resumed, reconnecting tunnel");
        if let Err(e) = self.teardown_locked(&mut inner, None).await {
            tracing::warn!(error = %e, "teardown before reconnect failed");
        }
        match self.start_locked(&mut inner, target, config).await {
            Ok(addr) => tracing::info!(%addr, "reconnected after resume"),
            Err(e) => tracing::error!(error = %e, "reconnect after resume failed"),
        }
    }

    /// Pushed on every change of connectivity.
    pub fn status(&self) -> watch::Receiver<bool> {
        self.status.subscribe()
    }

    pub fn is_connected(&self) -> bool {
        *self.status.borrow()
    }

    pub fn stats(&self) -> Arc<TunnelStats> {
        Arc::clone(&self.stats)
    }

    async fn start_locked(
        &self,
        inner: &mut Inner,
        target: Arc<dyn NetworkSession>,
        config: TunnelConfig,
    ) -> Result<SocketAddr, TunnelError> {
        let session = self.connector.connect(&config).await?;

        let listener = match SocksListener::new(Arc::clone(&session), Arc::clone(&self.stats))
            .start()
            .await
        {
            Ok(listener) => listener,
            Err(e) => {
                session.close();
                return Err(e.into());
            }
        };
        let addr = listener.local_addr();

        if let Err(e) = target.set_proxy(&ProxyRules::Socks5(addr)).await {
            listener.stop().await;
            session.close();
            return Err(e.into());
        }

        self.status.send_replace(true);
        let watcher = tokio::spawn(watch_session(session.state(), Arc::clone(&self.status)));
        inner.active = Some(ActiveTunnel {
            session,
            listener,
            watcher,
        });
        tracing::info!(host = %config.host, %addr, "tunnel up");
        Ok(addr)
    }

    async fn teardown_locked(
        &self,
        inner: &mut Inner,
        target: Option<&dyn NetworkSession>,
    ) -> Result<(), ProxyConfigError> {
        if let Some(active) = inner.active.take() {
            active.watcher.abort();
            active.listener.stop().await;
            active.session.close();
            self.stats.log_summary();
        }
        self.status.send_replace(false);

        if let Some(target) = target {
            target.set_proxy(&ProxyRules::Direct).await?;
        }
        tracing::info!("tunnel cleaned up");
        Ok(())
    }
}

/// Clear the published status once the session goes away on its own.
async fn watch_session(mut state: watch::Receiver<SessionState>, status: Arc<watch::Sender<bool>>) {
    loop {
        let current = state.borrow_and_update().clone();
        if let SessionState::Disconnected { reason } = current {
            match reason {
                Some(reason) => tracing::warn!(%reason, "secure session lost"),
                None => tracing::info!("secure session closed"),
            }
            break;
        }
        if state.changed().await.is_err() {
            tracing::info!("secure session closed");
            break;
        }
    }
    status.send_replace(false);
}
