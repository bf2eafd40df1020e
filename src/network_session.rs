//! The consuming network session whose traffic is routed through the tunnel.

use std::fmt;
use std::net::SocketAddr;
use std::path::PathBuf;

use async_trait::async_trait;
use thiserror::Error;

/// Routing rule handed to the consuming session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProxyRules {
    /// Everything through the local SOCKS5 listener.
    Socks5(SocketAddr),
    /// No proxy.
    Direct,
}

impl fmt::Display for ProxyRules {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProxyRules::Socks5(addr) => write!(f, "socks5://{addr}"),
            ProxyRules::Direct => f.write_str("direct://"),
        }
    }
}

#[derive(Debug, Error)]
#[error("failed to apply proxy rules {rules}: {source}")]
pub struct ProxyConfigError {
    pub rules: String,
    #[source]
    pub source: std::io::Error,
}

#[async_trait]
pub trait NetworkSession: Send + Sync {
    async fn set_proxy(&self, rules: &ProxyRules) -> Result<(), ProxyConfigError>;
}

/// Reports the rules in the log and nowhere else.
#[derive(Debug, Default)]
pub struct LogOnly;

#[async_trait]
impl NetworkSession for LogOnly {
    async fn set_proxy(&self, rules: &ProxyRules) -> Result<(), ProxyConfigError> {
        tracing::info!(%rules, "proxy rules");
        Ok(())
    }
}

/// Keeps the current rule string in a file for a browser launcher to pick up.
#[derive(Debug, Clone)]
pub struct RulesFile {
    path: PathBuf,
}

impl RulesFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl NetworkSession for RulesFile {
    async fn set_proxy(&self, rules: &ProxyRules) -> Result<(), ProxyConfigError> {
        let rendered = rules.to_string();
        let err = |source: std::io::Error| ProxyConfigError {
            rules: rendered.clone(),
            source,
        };

        // Readers must never see a half-written rule.
        let tmp = self.path.with_extension("tmp");
        tokio::fs::write(&tmp, format!("{rendered}\n")).await.map_err(err)?;
        tokio::fs::rename(&tmp, &self.path).await.map_err(err)?;
        tracing::info!(%rules, path = %self.path.display(), "proxy rules written");
        Ok(())
    }
}
