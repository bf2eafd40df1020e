//! Turns system wake-ups into [`TunnelController::on_system_resume`] calls.
//!
//! Two sources: a clock-gap check (wall time that ran ahead of monotonic
//! time means the machine was suspended in between), and on Unix `SIGUSR1`
//! for wake hooks that want to say so explicitly.

use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::controller::TunnelController;

#[derive(Debug, Clone, Copy)]
pub struct ResumeMonitor {
    tick: Duration,
    threshold: Duration,
}

impl Default for ResumeMonitor {
    fn default() -> Self {
        Self {
            tick: Duration::from_secs(5),
            threshold: Duration::from_secs(10),
        }
    }
}

impl ResumeMonitor {
    pub fn new(tick: Duration, threshold: Duration) -> Self {
        Self { tick, threshold }
    }

    pub fn spawn(self, controller: Arc<TunnelController>, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(self.run(controller, cancel))
    }

    async fn run(self, controller: Arc<TunnelController>, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.tick);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut wake_signal = ResumeSignal::new();

        let mut wall = SystemTime::now();
        let mut mono = Instant::now();

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    let (now_wall, now_mono) = (SystemTime::now(), Instant::now());
                    let wall_elapsed = now_wall.duration_since(wall).unwrap_or_default();
                    if let Some(gap) = suspended_for(wall_elapsed, now_mono - mono, self.threshold) {
                        tracing::info!(suspended_secs = gap.as_secs(), "clock gap detected");
                        trigger(&controller);
                    }
                    wall = now_wall;
                    mono = now_mono;
                }
                _ = wake_signal.recv() => {
                    tracing::info!("resume signal received");
                    trigger(&controller);
                }
            }
        }
    }
}

fn trigger(controller: &Arc<TunnelController>) {
    let controller = Arc::clone(controller);
    tokio::spawn(async move { controller.on_system_resume().await });
}

/// How long the machine was suspended, if longer than `threshold`.
pub fn suspended_for(wall_elapsed: Duration, mono_elapsed: Duration, threshold: Duration) -> Option<Duration> {
    let gap = wall_elapsed.saturating_sub(mono_elapsed);
    (gap > threshold).then_some(gap)
}

#[cfg(unix)]
struct ResumeSignal(Option<tokio::signal::unix::Signal>);

#[cfg(unix)]
impl ResumeSignal {
    fn new() -> Self {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::user_defined1()) {
            Ok(signal) => Self(Some(signal)),
            Err(e) => {
                tracing::warn!(error = %e, "SIGUSR1 resume notifications unavailable");
                Self(None)
            }
        }
    }

    async fn recv(&mut self) {
        if let Some(signal) = &mut self.0 {
            if signal.recv().await.is_some() {
                return;
            }
            self.0 = None;
        }
        std::future::pending().await
    }
}

#[cfg(not(unix))]
struct ResumeSignal;

#[cfg(not(unix))]
impl ResumeSignal {
    fn new() -> Self {
        Self
    }

    async fn recv(&mut self) {
        std::future::pending().await
    }
}
