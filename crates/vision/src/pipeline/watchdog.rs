//! Watchdog responsible for detecting streams that are connected but dead.
//!
//! A producer can keep its session open while emitting nothing. The watchdog
//! compares the age of the newest frame against the stale-reconnect age and
//! tears the link down so the reconnect loop starts from a clean slate.

use std::{
    io,
    sync::Arc,
    thread,
    time::{Duration, Instant},
};

use tracing::{debug, debug_span};

use crate::pipeline::{
    connection::{ConnectionManager, DisconnectReason},
    supervisor::ShutdownListener,
    telemetry,
};

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
/// Outcome of a single watchdog evaluation.
pub enum WatchdogVerdict {
    /// The last connect attempt is too recent to judge.
    InGrace,
    /// Nothing to do: healthy, or not connected at all.
    Healthy,
    /// The link must be torn down.
    Reconnect(DisconnectReason),
}

pub struct StalenessWatchdog {
    manager: Arc<ConnectionManager>,
}

impl StalenessWatchdog {
    pub fn new(manager: Arc<ConnectionManager>) -> Self {
        Self { manager }
    }

    /// Judge the link at `now` without mutating it.
    pub fn evaluate(&self, now: Instant) -> WatchdogVerdict {
        if self.manager.within_connect_grace(now) {
            return WatchdogVerdict::InGrace;
        }
        if !self.manager.is_connected() {
            return WatchdogVerdict::Healthy;
        }

        let stale_after = self.manager.config().stale_reconnect_age;
        // No frame at all counts as infinitely old.
        let stale = self
            .manager
            .frames()
            .age(now)
            .is_none_or(|age| age > stale_after);
        if stale {
            return WatchdogVerdict::Reconnect(DisconnectReason::StaleFrames);
        }
        if !self.manager.session_alive() {
            return WatchdogVerdict::Reconnect(DisconnectReason::SessionLost);
        }
        WatchdogVerdict::Healthy
    }

    /// Evaluate and act on the verdict.
    pub fn tick(&self, now: Instant) -> WatchdogVerdict {
        let _tick = debug_span!("stream.watchdog_tick").entered();
        let generation = self.manager.generation();
        let verdict = self.evaluate(now);
        match verdict {
            WatchdogVerdict::Reconnect(reason) => {
                self.manager.force_disconnect(generation, now, reason);
            }
            WatchdogVerdict::InGrace => debug!("watchdog skipped: connect attempt within grace"),
            WatchdogVerdict::Healthy => {}
        }
        verdict
    }
}

/// Spawn the watchdog thread evaluating the link every `tick`.
pub fn spawn_watchdog(
    manager: Arc<ConnectionManager>,
    shutdown: ShutdownListener,
) -> io::Result<thread::JoinHandle<()>> {
    let tick: Duration = manager.config().watchdog_tick;
    let watchdog = StalenessWatchdog::new(manager);
    telemetry::spawn_thread("stream-watchdog", move || {
        while !shutdown.wait(tick) {
            watchdog.tick(Instant::now());
        }
    })
}
