use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

/// Relay counters shared by every connection on a tunnel.
#[derive(Debug, Default)]
pub struct TunnelStats {
    active_relays: AtomicU32,
    total_relays: AtomicU64,
    handshakes_rejected: AtomicU64,
    channels_refused: AtomicU64,
    bytes_up: AtomicU64,
    bytes_down: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub active_relays: u32,
    pub total_relays: u64,
    pub handshakes_rejected: u64,
    pub channels_refused: u64,
    /// Client to remote.
    pub bytes_up: u64,
    /// Remote to client.
    pub bytes_down: u64,
}

impl TunnelStats {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn relay_started(&self) {
        self.active_relays.fetch_add(1, Ordering::Relaxed);
        self.total_relays.fetch_add(1, Ordering::Relaxed);
    }

    pub fn relay_closed(&self, bytes_up: u64, bytes_down: u64) {
        self.active_relays.fetch_sub(1, Ordering::Relaxed);
        self.bytes_up.fetch_add(bytes_up, Ordering::Relaxed);
        self.bytes_down.fetch_add(bytes_down, Ordering::Relaxed);
    }

    pub fn handshake_rejected(&self) {
        self.handshakes_rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn channel_refused(&self) {
        self.channels_refused.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            active_relays: self.active_relays.load(Ordering::Relaxed),
            total_relays: self.total_relays.load(Ordering::Relaxed),
            handshakes_rejected: self.handshakes_rejected.load(Ordering::Relaxed),
            channels_refused: self.channels_refused.load(Ordering::Relaxed),
            bytes_up: self.bytes_up.load(Ordering::Relaxed),
            bytes_down: self.bytes_down.load(Ordering::Relaxed),
        }
    }

    pub fn log_summary(&self) {
        let s = self.snapshot();
        tracing::info!(
            active = s.active_relays,
            total = s.total_relays,
            rejected = s.handshakes_rejected,
            refused = s.channels_refused,
            up_mb = format_args!("{:.1}", s.bytes_up as f64 / 1_048_576.0),
            down_mb = format_args!("{:.1}", s.bytes_down as f64 / 1_048_576.0),
            "relay stats"
        );
    }
}
