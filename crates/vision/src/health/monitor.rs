//! Periodic health evaluation and the escalation ladder above stream reconnects.
//!
//! Each tick refreshes or repairs the messaging channel, restarts the
//! producer's service when the stream has been silent too long, and reboots
//! the device when liveness is lost while the channel is down.

use std::{
    io,
    process::{self, Command},
    sync::{Arc, Mutex},
    thread,
    time::{Duration, Instant},
};

use tracing::{debug, debug_span, error, info, warn};

use crate::{
    health::{
        HealthSignals, current_millis,
        messaging::{MessagingChannel, StatusTopic},
        restart::RestartChain,
    },
    pipeline::{config::HealthConfig, supervisor::ShutdownListener, telemetry},
};

/// Reports how long the stream has gone without a frame at a given instant.
pub type SilenceProbe = Arc<dyn Fn(Instant) -> Duration + Send + Sync>;

/// Last-resort recovery of the whole device.
pub trait Rebooter: Send + Sync {
    /// Reboot the host. Real implementations do not return.
    fn reboot(&self, reason: &str);
}

/// Flushes filesystems and reboots the host, exiting with failure if the reboot doesn't land.
pub struct HostRebooter {
    reboot_command: String,
    exit_after: Duration,
}

impl HostRebooter {
    pub fn new() -> Self {
        Self {
            reboot_command: "reboot".into(),
            exit_after: Duration::from_secs(5),
        }
    }
}

impl Default for HostRebooter {
    fn default() -> Self {
        Self::new()
    }
}

impl Rebooter for HostRebooter {
    fn reboot(&self, reason: &str) {
        error!(reason, "rebooting device");
        if let Err(err) = Command::new("sync").status() {
            warn!("filesystem sync failed: {err}");
        }
        match Command::new(&self.reboot_command).status() {
            Ok(status) if !status.success() => warn!("`{}` exited with {status}", self.reboot_command),
            Err(err) => warn!("`{}` failed: {err}", self.reboot_command),
            Ok(_) => {}
        }
        thread::sleep(self.exit_after);
        // Still running: let the process supervisor restart us instead.
        process::exit(1);
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum HealthVerdict {
    Healthy,
    /// A signal is stale, but the channel is up (or there is none), so no reboot.
    Stale,
    Reboot(String),
}

struct ChannelWatch {
    channel: Arc<dyn MessagingChannel>,
    status: StatusTopic,
}

struct ServiceWatch {
    chain: RestartChain,
    silence: SilenceProbe,
    last_restart: Mutex<Option<Instant>>,
}

pub struct HealthMonitor {
    config: HealthConfig,
    signals: Arc<HealthSignals>,
    rebooter: Arc<dyn Rebooter>,
    channel: Option<ChannelWatch>,
    service: Option<ServiceWatch>,
}

impl HealthMonitor {
    pub fn new(config: HealthConfig, signals: Arc<HealthSignals>, rebooter: Arc<dyn Rebooter>) -> Self {
        Self {
            config,
            signals,
            rebooter,
            channel: None,
            service: None,
        }
    }

    /// Track `channel` and announce `offline` on `status` before rebooting.
    pub fn with_channel(mut self, channel: Arc<dyn MessagingChannel>, status: StatusTopic) -> Self {
        self.channel = Some(ChannelWatch { channel, status });
        self
    }

    /// Restart the producer's service through `chain` when `silence` exceeds the threshold.
    pub fn with_service_restart(mut self, chain: RestartChain, silence: SilenceProbe) -> Self {
        self.service = Some(ServiceWatch {
            chain,
            silence,
            last_restart: Mutex::new(None),
        });
        self
    }

    pub fn signals(&self) -> &Arc<HealthSignals> {
        &self.signals
    }

    /// Pure escalation rule at `now_ms` given the channel state.
    pub fn evaluate(&self, now_ms: u64, channel_up: bool) -> HealthVerdict {
        let grace_ms = self.config.grace.as_millis() as u64;
        let progress_age = now_ms.saturating_sub(self.signals.last_progress_ms());
        let channel_age = now_ms.saturating_sub(self.signals.last_channel_ok_ms());
        if progress_age < grace_ms && channel_age < grace_ms {
            return HealthVerdict::Healthy;
        }
        if self.channel.is_none() || channel_up {
            return HealthVerdict::Stale;
        }
        HealthVerdict::Reboot(format!(
            "no-progress-for-{}s-and-channel-down-{}s",
            progress_age / 1_000,
            channel_age / 1_000
        ))
    }

    /// One monitoring pass.
    pub fn tick(&self, now: Instant, now_ms: u64) -> HealthVerdict {
        let _tick = debug_span!("health.tick").entered();
        let channel_up = self.check_channel(now_ms);
        self.escalate_service(now);

        let verdict = self.evaluate(now_ms, channel_up);
        match &verdict {
            HealthVerdict::Reboot(reason) => self.reboot(reason),
            HealthVerdict::Stale if self.channel.is_some() => warn!(
                progress_age_ms = now_ms.saturating_sub(self.signals.last_progress_ms()),
                "device quiet but messaging channel is up"
            ),
            HealthVerdict::Stale => debug!("device quiet; no messaging channel to confirm an outage"),
            HealthVerdict::Healthy => {}
        }
        verdict
    }

    fn check_channel(&self, now_ms: u64) -> bool {
        let Some(watch) = &self.channel else {
            return false;
        };
        if watch.channel.is_connected() {
            self.signals.channel_ok_at(now_ms);
            return true;
        }
        warn!("messaging channel down; attempting reconnect");
        metrics::counter!("health_channel_reconnects_total").increment(1);
        watch.channel.connect_with_retry(
            self.config.channel_retry_attempts,
            self.config.channel_retry_backoff,
        );
        watch.channel.is_connected()
    }

    /// Restart the producer's service if the stream is silent and the cooldown passed.
    pub fn escalate_service(&self, now: Instant) -> bool {
        let Some(watch) = &self.service else {
            return false;
        };
        let silence = (watch.silence)(now);
        if silence < self.config.service_restart_after {
            return false;
        }
        let Ok(mut last) = watch.last_restart.lock() else {
            return false;
        };
        if last.is_some_and(|at| now.saturating_duration_since(at) < self.config.service_restart_cooldown) {
            return false;
        }
        *last = Some(now);
        drop(last);

        error!(
            silence_secs = silence.as_secs(),
            service = watch.chain.service(),
            "stream silent; escalating to service restart"
        );
        watch.chain.restart()
    }

    fn reboot(&self, reason: &str) {
        if let Some(watch) = &self.channel {
            let payload = watch.status.payload("offline");
            if let Err(err) = watch.channel.publish(&watch.status.topic, &payload, true) {
                warn!("offline announcement failed: {err}");
            }
        }
        self.rebooter.reboot(reason);
    }
}

/// Spawn the health monitor thread ticking every `config.tick`.
pub fn spawn_health_monitor(
    monitor: Arc<HealthMonitor>,
    shutdown: ShutdownListener,
) -> io::Result<thread::JoinHandle<()>> {
    let tick = monitor.config.tick;
    telemetry::spawn_thread("health-monitor", move || {
        info!(interval_secs = tick.as_secs(), "health monitor running");
        while !shutdown.wait(tick) {
            monitor.tick(Instant::now(), current_millis());
        }
    })
}
