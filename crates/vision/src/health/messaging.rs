//! Status publication channel and its MQTT implementation.

use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    thread,
    time::{Duration, Instant},
};

use anyhow::Context;
use rumqttc::{Client, Event, LastWill, MqttOptions, Packet, QoS};
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::pipeline::{config::MqttConfig, telemetry};

const KEEP_ALIVE: Duration = Duration::from_secs(60);
const EVENT_LOOP_RETRY: Duration = Duration::from_secs(5);
const MAX_BACKOFF: Duration = Duration::from_secs(30);

#[derive(Debug, Error)]
#[error("publish to {topic} failed: {detail}")]
pub struct MessagingError {
    pub topic: String,
    pub detail: String,
}

/// Channel used for status publication and as a device liveness signal.
pub trait MessagingChannel: Send + Sync {
    fn publish(&self, topic: &str, payload: &str, retain: bool) -> Result<(), MessagingError>;

    fn is_connected(&self) -> bool;

    /// Wait for the channel to come up, backing off between attempts.
    fn connect_with_retry(&self, max_attempts: u32, backoff: Duration) -> bool;
}

/// JSON document published on the status topic.
#[derive(Debug, Serialize)]
pub struct StatusPayload<'a> {
    pub device: &'a str,
    pub status: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub frame_age_secs: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub frames_published: Option<u64>,
}

impl<'a> StatusPayload<'a> {
    pub fn new(device: &'a str, status: &'a str) -> Self {
        Self {
            device,
            status,
            timestamp: None,
            frame_age_secs: None,
            frames_published: None,
        }
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| {
            format!(r#"{{"device":{:?},"status":{:?}}}"#, self.device, self.status)
        })
    }
}

/// Where and as whom status documents are published.
#[derive(Clone, Debug)]
pub struct StatusTopic {
    pub topic: String,
    pub device: String,
}

impl StatusTopic {
    pub fn payload(&self, status: &str) -> String {
        StatusPayload::new(&self.device, status).to_json()
    }
}

/// MQTT session kept alive by a background event-loop thread.
///
/// The broker holds a retained `offline` last will; every ConnAck publishes
/// `online` over it.
pub struct MqttChannel {
    client: Client,
    connected: Arc<AtomicBool>,
    closing: Arc<AtomicBool>,
    status: StatusTopic,
}

impl MqttChannel {
    pub fn start(config: &MqttConfig) -> anyhow::Result<Self> {
        let status = StatusTopic {
            topic: config.status_topic.clone(),
            device: config.device_id.clone(),
        };
        let mut options = MqttOptions::new(&config.device_id, &config.host, config.port);
        options.set_keep_alive(KEEP_ALIVE);
        if let Some(username) = &config.username {
            options.set_credentials(username, config.password.as_deref().unwrap_or_default());
        }
        options.set_last_will(LastWill::new(
            &status.topic,
            status.payload("offline"),
            QoS::AtLeastOnce,
            true,
        ));

        let (client, mut connection) = Client::new(options, 16);
        let connected = Arc::new(AtomicBool::new(false));
        let closing = Arc::new(AtomicBool::new(false));

        let loop_client = client.clone();
        let loop_connected = Arc::clone(&connected);
        let loop_closing = Arc::clone(&closing);
        let online = (status.topic.clone(), status.payload("online"));
        let broker = format!("{}:{}", config.host, config.port);
        telemetry::spawn_thread("mqtt-eventloop", move || {
            for notification in connection.iter() {
                match notification {
                    Ok(Event::Incoming(Packet::ConnAck(_))) => {
                        loop_connected.store(true, Ordering::SeqCst);
                        info!(%broker, "mqtt connected");
                        if let Err(err) =
                            loop_client.try_publish(&online.0, QoS::AtLeastOnce, true, online.1.clone())
                        {
                            warn!("failed to queue online status: {err}");
                        }
                    }
                    Ok(Event::Incoming(Packet::Disconnect)) => {
                        loop_connected.store(false, Ordering::SeqCst);
                        warn!(%broker, "mqtt broker closed the session");
                    }
                    Ok(_) => {}
                    Err(err) => {
                        let was_connected = loop_connected.swap(false, Ordering::SeqCst);
                        if loop_closing.load(Ordering::SeqCst) {
                            break;
                        }
                        if was_connected {
                            warn!(%broker, "mqtt disconnected: {err}");
                        } else {
                            debug!(%broker, "mqtt connect failed: {err}");
                        }
                        thread::sleep(EVENT_LOOP_RETRY);
                    }
                }
            }
        })
        .context("failed to spawn mqtt event loop")?;

        Ok(Self {
            client,
            connected,
            closing,
            status,
        })
    }

    pub fn status(&self) -> &StatusTopic {
        &self.status
    }

    /// Publish `offline` and close the session.
    pub fn shutdown(&self) {
        self.closing.store(true, Ordering::SeqCst);
        if let Err(err) = self.publish(&self.status.topic, &self.status.payload("offline"), true) {
            debug!("{err}");
        }
        if let Err(err) = self.client.try_disconnect() {
            debug!("mqtt disconnect failed: {err}");
        }
    }
}

impl MessagingChannel for MqttChannel {
    fn publish(&self, topic: &str, payload: &str, retain: bool) -> Result<(), MessagingError> {
        self.client
            .try_publish(topic, QoS::AtLeastOnce, retain, payload.as_bytes().to_vec())
            .map_err(|err| MessagingError {
                topic: topic.to_string(),
                detail: err.to_string(),
            })
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn connect_with_retry(&self, max_attempts: u32, backoff: Duration) -> bool {
        wait_with_backoff(max_attempts, backoff, || self.is_connected())
    }
}

/// Poll `ready` across `max_attempts` windows, doubling the window up to 30 s.
pub(crate) fn wait_with_backoff(
    max_attempts: u32,
    backoff: Duration,
    ready: impl Fn() -> bool,
) -> bool {
    let mut window = backoff;
    for attempt in 1..=max_attempts {
        let deadline = Instant::now() + window;
        loop {
            if ready() {
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            thread::sleep(Duration::from_millis(100).min(deadline - now));
        }
        debug!(attempt, max_attempts, "messaging channel still down");
        window = (window * 2).min(MAX_BACKOFF);
    }
    warn!("messaging channel down after {max_attempts} attempts");
    false
}
