//! Device-level escalation: liveness signals, dependent-service restarts and reboot.
//!
//! Signals are millisecond wall-clock stamps that only ever move forward, so
//! any thread may refresh them without coordination.

pub mod messaging;
pub mod monitor;
pub mod restart;

use std::{
    sync::atomic::{AtomicU64, Ordering},
    time::{SystemTime, UNIX_EPOCH},
};

use tracing::trace;

pub use messaging::{MessagingChannel, MqttChannel};
pub use monitor::{HealthMonitor, HealthVerdict, HostRebooter, Rebooter};
pub use restart::{ControlChannel, ControlError, RestartChain, RestartOutcome};

/// Last observed progress and messaging-channel liveness, in epoch milliseconds.
pub struct HealthSignals {
    last_progress: AtomicU64,
    last_channel_ok: AtomicU64,
}

impl HealthSignals {
    /// Start both signals at `now_ms`, so escalation waits a full grace period.
    pub fn new(now_ms: u64) -> Self {
        Self {
            last_progress: AtomicU64::new(now_ms),
            last_channel_ok: AtomicU64::new(now_ms),
        }
    }

    pub fn starting_now() -> Self {
        Self::new(current_millis())
    }

    /// Record that some subsystem made progress.
    pub fn mark_progress(&self, source: &str) {
        self.progress_at(current_millis());
        trace!(source, "progress");
    }

    pub fn progress_at(&self, now_ms: u64) {
        self.last_progress.fetch_max(now_ms, Ordering::Relaxed);
    }

    pub fn channel_ok_at(&self, now_ms: u64) {
        self.last_channel_ok.fetch_max(now_ms, Ordering::Relaxed);
    }

    pub fn last_progress_ms(&self) -> u64 {
        self.last_progress.load(Ordering::Relaxed)
    }

    pub fn last_channel_ok_ms(&self) -> u64 {
        self.last_channel_ok.load(Ordering::Relaxed)
    }
}

pub fn current_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signals_never_move_backwards() {
        let signals = HealthSignals::new(1_000);
        signals.progress_at(5_000);
        signals.progress_at(2_000);
        signals.channel_ok_at(900);
        assert_eq!(signals.last_progress_ms(), 5_000);
        assert_eq!(signals.last_channel_ok_ms(), 1_000);
    }

    #[test]
    fn mark_progress_uses_wall_clock() {
        let signals = HealthSignals::new(0);
        signals.mark_progress("heartbeat");
        assert!(signals.last_progress_ms() >= current_millis() - 60_000);
    }
}
