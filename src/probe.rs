//! Diagnostic probe: can we reach and authenticate to the host at all?

use std::time::{Duration, Instant};

use thiserror::Error;

use crate::config::{MissingConfiguration, TunnelConfig};
use crate::transport::{ConnectError, Connector};

pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_millis(10_000);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProbeReport {
    /// Attempt start to authenticated session.
    pub latency_ms: u64,
}

#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("SSH host and user are required")]
    MissingConfiguration(#[from] MissingConfiguration),

    #[error("Connection timed out after {}s", .0.as_secs())]
    TimedOut(Duration),

    #[error(transparent)]
    Connect(#[from] ConnectError),
}

/// Open an independent session, time it, and close it again.
///
/// The session never carries channels and is closed before returning. On
/// timeout the pending attempt is dropped, which shuts down its connection.
pub async fn test(
    connector: &dyn Connector,
    config: &TunnelConfig,
    timeout: Duration,
) -> Result<ProbeReport, ProbeError> {
    config.validate()?;

    let start = Instant::now();
    let session = match tokio::time::timeout(timeout, connector.connect(config)).await {
        Ok(result) => result?,
        Err(_) => {
            tracing::debug!(host = %config.host, ?timeout, "probe timed out");
            return Err(ProbeError::TimedOut(timeout));
        }
    };
    let latency = start.elapsed();
    session.close();

    let latency_ms = u64::try_from(latency.as_millis()).unwrap_or(u64::MAX);
    tracing::info!(host = %config.host, latency_ms, "probe succeeded");
    Ok(ProbeReport { latency_ms })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_transport::LoopbackConnector;

    fn config() -> TunnelConfig {
        TunnelConfig::new("good.host", "alice")
    }

    #[tokio::test]
    async fn success_reports_latency_and_closes_session() {
        let connector = LoopbackConnector::with_delay(Duration::from_millis(20));
        let report = test(connector.as_ref(), &config(), DEFAULT_PROBE_TIMEOUT).await.unwrap();

        assert!(report.latency_ms >= 20);
        let sessions = connector.sessions();
        assert_eq!(sessions.len(), 1);
        assert!(sessions[0].is_closed());
    }

    #[tokio::test]
    async fn slow_host_times_out() {
        let connector = LoopbackConnector::with_delay(Duration::from_secs(5));
        let err = test(connector.as_ref(), &config(), Duration::from_millis(20))
            .await
            .unwrap_err();

        assert!(matches!(err, ProbeError::TimedOut(_)));
        assert!(connector.sessions().is_empty());
    }

    #[tokio::test]
    async fn failures_keep_their_classification() {
        let connector = LoopbackConnector::failing(ConnectError::AuthenticationFailed {
            detail: "All configured authentication methods failed".into(),
        });
        let err = test(connector.as_ref(), &config(), DEFAULT_PROBE_TIMEOUT)
            .await
            .unwrap_err();

        assert_eq!(err.to_string(), "Authentication failed - check SSH key and username");
    }

    #[tokio::test]
    async fn missing_user_is_rejected_before_connecting() {
        let connector = LoopbackConnector::new();
        let err = test(connector.as_ref(), &TunnelConfig::new("good.host", ""), DEFAULT_PROBE_TIMEOUT)
            .await
            .unwrap_err();

        assert!(matches!(err, ProbeError::MissingConfiguration(_)));
        assert_eq!(connector.attempts(), 0);
    }

    #[tokio::test]
    async fn timed_out_ssh_attempt_releases_its_connection() {
        use std::io::Read;

        use crate::config::TunnelSettings;
        use crate::ssh_transport::SshConnector;

        // Accepts and never speaks SSH, so the handshake blocks.
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let (closed_tx, closed_rx) = std::sync::mpsc::channel();
        std::thread::spawn(move || {
            if let Ok((mut stream, _)) = listener.accept() {
                let mut buf = [0u8; 256];
                while matches!(stream.read(&mut buf), Ok(n) if n > 0) {}
                let _ = closed_tx.send(Instant::now());
            }
        });

        let connector = SshConnector::new(TunnelSettings {
            ssh_port: port,
            connect_timeout: Duration::from_secs(10),
            agent_socket: None,
            ..TunnelSettings::default()
        });
        let err = test(&connector, &TunnelConfig::new("127.0.0.1", "alice"), Duration::from_millis(300))
            .await
            .unwrap_err();
        assert!(matches!(err, ProbeError::TimedOut(_)));
        let returned = Instant::now();

        let closed = tokio::task::spawn_blocking(move || closed_rx.recv_timeout(Duration::from_secs(3)))
            .await
            .unwrap()
            .expect("connection still open after the timeout");
        assert!(closed.saturating_duration_since(returned) < Duration::from_secs(2));
    }

    #[test]
    fn timeout_message_names_the_bound() {
        assert_eq!(
            ProbeError::TimedOut(DEFAULT_PROBE_TIMEOUT).to_string(),
            "Connection timed out after 10s"
        );
    }
}
