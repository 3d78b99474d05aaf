use std::{
    sync::{Arc, Once},
    time::Instant,
};

use anyhow::{Context, Result};
use stream_ingest::PollingTransport;
use tracing::{debug, info, info_span, warn};
use vision::{
    FrameStore, HealthMonitor, HealthSignals, MessagingChannel, MqttChannel, RestartChain,
    StreamSupervisor,
    health::{
        HostRebooter,
        messaging::{StatusPayload, StatusTopic},
        monitor::spawn_health_monitor,
    },
    pipeline::{HealthConfig, ShutdownTrigger, StreamConfig, supervisor::shutdown_channel},
};

use crate::cli::RunArgs;

/// Periodic `online` status carrying the current frame age.
struct Heartbeat {
    channel: Option<(Arc<dyn MessagingChannel>, StatusTopic)>,
    signals: Arc<HealthSignals>,
    frames: Arc<FrameStore>,
}

impl Heartbeat {
    fn beat(&self, now: Instant) -> bool {
        let Some((channel, status)) = &self.channel else {
            debug!("no messaging channel; heartbeat skipped");
            return false;
        };
        let published = self.frames.published();
        metrics::gauge!("stream_frames_published").set(published as f64);
        let payload = StatusPayload {
            timestamp: Some(chrono::Utc::now().to_rfc3339()),
            frame_age_secs: self.frames.age(now).map(|age| age.as_secs_f64()),
            frames_published: Some(published),
            ..StatusPayload::new(&status.device, "online")
        };
        match channel.publish(&status.topic, &payload.to_json(), true) {
            Ok(()) => {
                self.signals.mark_progress("heartbeat");
                true
            }
            Err(err) => {
                warn!("heartbeat failed: {err}");
                false
            }
        }
    }
}

fn install_ctrlc(trigger: Arc<ShutdownTrigger>) {
    static CTRL_HANDLER: Once = Once::new();
    CTRL_HANDLER.call_once(move || {
        if let Err(err) = ctrlc::set_handler(move || trigger.trigger()) {
            warn!("Failed to install Ctrl+C handler: {err}");
        }
    });
}

pub fn run(args: RunArgs) -> Result<()> {
    let stream_config = StreamConfig::try_from(args.stream)?;
    let health_config = HealthConfig::try_from(args.health)?;

    let span = info_span!(
        "sentinel.run",
        host = %stream_config.endpoints.host,
        port = stream_config.endpoints.port
    );
    let _span = span.enter();

    let (trigger, shutdown) = shutdown_channel();
    install_ctrlc(Arc::new(trigger));

    let transport = PollingTransport::new()?;
    let mut supervisor = StreamSupervisor::new(stream_config, Arc::new(transport));
    supervisor.start().context("failed to start stream supervisor")?;

    let signals = Arc::new(HealthSignals::starting_now());
    let mqtt = match &health_config.messaging {
        Some(mqtt_config) => {
            let channel = Arc::new(MqttChannel::start(mqtt_config)?);
            if !channel.connect_with_retry(
                health_config.channel_retry_attempts,
                health_config.channel_retry_backoff,
            ) {
                warn!("mqtt broker unreachable at startup; health monitor will keep retrying");
            }
            Some(channel)
        }
        None => {
            info!("no mqtt broker configured; device reboot escalation disabled");
            None
        }
    };

    let mut monitor = HealthMonitor::new(
        health_config.clone(),
        Arc::clone(&signals),
        Arc::new(HostRebooter::new()),
    );
    let channel = mqtt.as_ref().map(|mqtt| {
        (
            Arc::clone(mqtt) as Arc<dyn MessagingChannel>,
            mqtt.status().clone(),
        )
    });
    if let Some((channel, status)) = &channel {
        monitor = monitor.with_channel(Arc::clone(channel), status.clone());
    }
    monitor = monitor.with_service_restart(
        RestartChain::from_config(&health_config.restart)?,
        supervisor.silence_probe(),
    );
    let monitor_thread = spawn_health_monitor(Arc::new(monitor), supervisor.shutdown_listener())
        .context("failed to spawn health monitor")?;

    let heartbeat = Heartbeat {
        channel,
        signals,
        frames: Arc::clone(supervisor.manager().frames()),
    };
    info!(
        heartbeat_secs = health_config.heartbeat_interval.as_secs(),
        "sentinel running; Ctrl+C to stop"
    );
    loop {
        heartbeat.beat(Instant::now());
        if shutdown.wait(health_config.heartbeat_interval) {
            break;
        }
    }

    info!("shutting down");
    if let Some(mqtt) = &mqtt {
        mqtt.shutdown();
    }
    supervisor.shutdown();
    if monitor_thread.join().is_err() {
        warn!("health monitor panicked during shutdown");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::{sync::Mutex, time::Duration};

    use image::RgbImage;
    use vision::health::messaging::MessagingError;

    use super::*;

    #[derive(Default)]
    struct RecordingChannel {
        fail: bool,
        published: Mutex<Vec<(String, String, bool)>>,
    }

    impl MessagingChannel for RecordingChannel {
        fn publish(&self, topic: &str, payload: &str, retain: bool) -> Result<(), MessagingError> {
            if self.fail {
                return Err(MessagingError {
                    topic: topic.into(),
                    detail: "queue full".into(),
                });
            }
            self.published
                .lock()
                .unwrap()
                .push((topic.into(), payload.into(), retain));
            Ok(())
        }

        fn is_connected(&self) -> bool {
            !self.fail
        }

        fn connect_with_retry(&self, _max_attempts: u32, _backoff: Duration) -> bool {
            !self.fail
        }
    }

    fn heartbeat(channel: Arc<RecordingChannel>) -> Heartbeat {
        Heartbeat {
            channel: Some((
                channel as Arc<dyn MessagingChannel>,
                StatusTopic {
                    topic: "devices/cam-1/status".into(),
                    device: "cam-1".into(),
                },
            )),
            signals: Arc::new(HealthSignals::new(0)),
            frames: Arc::new(FrameStore::new()),
        }
    }

    #[test]
    fn heartbeat_reports_frame_age_and_marks_progress() {
        let channel = Arc::new(RecordingChannel::default());
        let beat = heartbeat(Arc::clone(&channel));
        let now = Instant::now();
        beat.frames
            .publish(RgbImage::new(2, 2), now - Duration::from_secs(3));

        assert!(beat.beat(now));
        assert!(beat.signals.last_progress_ms() > 0);

        let published = channel.published.lock().unwrap();
        let (topic, payload, retain) = &published[0];
        assert_eq!(topic, "devices/cam-1/status");
        assert!(*retain);
        let json: serde_json::Value = serde_json::from_str(payload).unwrap();
        assert_eq!(json["status"], "online");
        assert_eq!(json["device"], "cam-1");
        assert!((json["frame_age_secs"].as_f64().unwrap() - 3.0).abs() < 0.01);
        assert!(json["timestamp"].is_string());
        assert_eq!(json["frames_published"], 1);
    }

    #[test]
    fn failed_or_missing_channel_does_not_mark_progress() {
        let beat = heartbeat(Arc::new(RecordingChannel {
            fail: true,
            ..Default::default()
        }));
        assert!(!beat.beat(Instant::now()));
        assert_eq!(beat.signals.last_progress_ms(), 0);

        let silent = Heartbeat {
            channel: None,
            ..beat
        };
        assert!(!silent.beat(Instant::now()));
    }
}
