//! Configuration parsing for the stream supervisor and health escalation.
//!
//! This module owns translation of CLI arguments (and their environment
//! fallbacks) into validated runtime structs that downstream loops use
//! without re-parsing flags.

use std::{path::PathBuf, time::Duration};

use anyhow::{Context, Result, anyhow, bail};
use clap::Args;
use stream_ingest::EndpointPlan;

/// YOLO input dimension used by the upstream detector.
pub const DEFAULT_MODEL_INPUT_SIZE: f64 = 416.0;

#[derive(Clone, Debug)]
/// Timing and addressing for the stream acquisition loops.
pub struct StreamConfig {
    /// Candidate addresses of the producer.
    pub endpoints: EndpointPlan,
    /// Minimum spacing between reconnect attempts.
    pub reconnect_interval: Duration,
    /// Reconnect loop tick.
    pub reconnect_tick: Duration,
    /// Bound on a single candidate's connect attempt.
    pub connect_timeout: Duration,
    /// Staleness watchdog tick.
    pub watchdog_tick: Duration,
    /// Age of the last connect attempt below which the watchdog stays quiet.
    pub connect_grace: Duration,
    /// Frame age that makes a "connected" stream count as dead.
    pub stale_reconnect_age: Duration,
    /// Frames younger than this are served as fresh.
    pub fresh_age: Duration,
    /// Frames up to this age are still served, with a staleness log.
    pub stale_tolerance: Duration,
    /// Frames older than this force a disconnect from the read path.
    pub extreme_staleness: Duration,
    /// Total wait budget of `get_fresh_frame` when callers don't pass one.
    pub fresh_poll_timeout: Duration,
    /// Sleep between `get_fresh_frame` polls.
    pub fresh_poll_step: Duration,
    /// Square detector input size used to undo letterboxing.
    pub model_input_size: f64,
    /// Events emitted after connecting to wake a passive producer.
    pub wake_events: Vec<String>,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            endpoints: EndpointPlan {
                host: "ei-video-obj-detection-runner".into(),
                port: 4912,
                known_good: Vec::new(),
                fallbacks: vec!["172.17.0.1".into(), "host.docker.internal".into()],
                include_loopback: true,
                include_local_ip: true,
            },
            reconnect_interval: Duration::from_secs(5),
            reconnect_tick: Duration::from_secs(1),
            connect_timeout: Duration::from_secs(20),
            watchdog_tick: Duration::from_secs(5),
            connect_grace: Duration::from_secs(30),
            stale_reconnect_age: Duration::from_secs(30),
            fresh_age: Duration::from_secs(1),
            stale_tolerance: Duration::from_secs(20),
            extreme_staleness: Duration::from_secs(30),
            fresh_poll_timeout: Duration::from_millis(750),
            fresh_poll_step: Duration::from_millis(50),
            model_input_size: DEFAULT_MODEL_INPUT_SIZE,
            wake_events: vec!["start".into(), "start-stream".into()],
        }
    }
}

#[derive(Clone, Debug)]
/// Escalation thresholds and the collaborators used to act on them.
pub struct HealthConfig {
    pub tick: Duration,
    /// Shared staleness limit for both the progress and channel signals.
    pub grace: Duration,
    pub channel_retry_attempts: u32,
    pub channel_retry_backoff: Duration,
    /// Stream silence that triggers a dependent-service restart.
    pub service_restart_after: Duration,
    pub service_restart_cooldown: Duration,
    pub heartbeat_interval: Duration,
    pub restart: RestartConfig,
    pub messaging: Option<MqttConfig>,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            tick: Duration::from_secs(30),
            grace: Duration::from_secs(5 * 60),
            channel_retry_attempts: 2,
            channel_retry_backoff: Duration::from_secs(2),
            service_restart_after: Duration::from_secs(120),
            service_restart_cooldown: Duration::from_secs(300),
            heartbeat_interval: Duration::from_secs(60),
            restart: RestartConfig::default(),
            messaging: None,
        }
    }
}

#[derive(Clone, Debug)]
/// Control channels used to restart the producer's service.
pub struct RestartConfig {
    pub service_name: String,
    pub control_socket: PathBuf,
    pub control_endpoints: Vec<(String, u16)>,
    pub control_command: String,
    pub timeout: Duration,
}

impl Default for RestartConfig {
    fn default() -> Self {
        Self {
            service_name: "detect-objects-on-camera-modified-ei-video-obj-detection-runner-1"
                .into(),
            control_socket: PathBuf::from("/var/run/docker.sock"),
            control_endpoints: vec![
                ("172.17.0.1".into(), 2375),
                ("host.docker.internal".into(), 2375),
            ],
            control_command: "docker".into(),
            timeout: Duration::from_secs(30),
        }
    }
}

#[derive(Clone, Debug)]
/// Broker used for status publication and liveness.
pub struct MqttConfig {
    pub host: String,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
    pub device_id: String,
    pub status_topic: String,
}

#[derive(Clone, Debug, Default)]
/// Optional telemetry knobs for tracing and metrics export.
pub struct TelemetryOptions {
    /// Write a Chrome trace JSON file capturing loop spans.
    pub chrome_trace_path: Option<PathBuf>,
    /// Periodically render Prometheus metrics into this file.
    pub metrics_textfile: Option<PathBuf>,
}

/// Stream acquisition flags.
#[derive(Clone, Debug, Args)]
pub struct StreamArgs {
    /// Hostname of the stream producer.
    #[arg(long = "stream-host", env = "VIDEO_RUNNER_HOST", default_value = "ei-video-obj-detection-runner")]
    pub host: String,
    /// Port of the stream producer.
    #[arg(long = "stream-port", env = "VIDEO_RUNNER_PORT", default_value_t = 4912)]
    pub port: u16,
    /// Address that served frames before (repeatable).
    #[arg(long = "known-host", env = "VIDEO_RUNNER_KNOWN_HOSTS", value_delimiter = ',')]
    pub known_hosts: Vec<String>,
    /// Last-resort producer hostnames (repeatable).
    #[arg(
        long = "fallback-host",
        env = "VIDEO_RUNNER_FALLBACK_HOSTS",
        value_delimiter = ',',
        default_values = ["172.17.0.1", "host.docker.internal"]
    )]
    pub fallback_hosts: Vec<String>,
    /// Skip loopback candidates.
    #[arg(long = "no-loopback", action = clap::ArgAction::SetTrue)]
    pub no_loopback: bool,
    /// Skip the locally resolved outbound address.
    #[arg(long = "no-local-ip", action = clap::ArgAction::SetTrue)]
    pub no_local_ip: bool,
    /// Seconds between reconnect attempts.
    #[arg(long = "reconnect-interval", env = "STREAM_RECONNECT_INTERVAL", default_value_t = 5.0)]
    pub reconnect_interval: f64,
    /// Seconds allowed per candidate connect.
    #[arg(long = "connect-timeout", default_value_t = 20.0)]
    pub connect_timeout: f64,
    /// Seconds without frames before a connected stream is torn down.
    #[arg(long = "stale-reconnect-age", env = "STREAM_STALE_RECONNECT_AGE", default_value_t = 30.0)]
    pub stale_reconnect_age: f64,
    /// Seconds after a connect attempt during which the watchdog waits.
    #[arg(long = "connect-grace", default_value_t = 30.0)]
    pub connect_grace: f64,
    /// Seconds a frame is served as fresh.
    #[arg(long = "fresh-age", default_value_t = 1.0)]
    pub fresh_age: f64,
    /// Seconds a stale frame is still served.
    #[arg(long = "stale-tolerance", env = "STREAM_STALE_TOLERANCE", default_value_t = 20.0)]
    pub stale_tolerance: f64,
    /// Seconds after which a frame forces a disconnect from the read path.
    #[arg(long = "extreme-staleness", default_value_t = 30.0)]
    pub extreme_staleness: f64,
    /// Square detector input size in pixels.
    #[arg(long = "model-input-size", default_value_t = DEFAULT_MODEL_INPUT_SIZE)]
    pub model_input_size: f64,
}

/// Health escalation flags.
#[derive(Debug, Args)]
pub struct HealthArgs {
    /// Seconds between health evaluations.
    #[arg(long = "health-interval", default_value_t = 30.0)]
    pub interval: f64,
    /// Seconds of missing progress or channel outage before rebooting.
    #[arg(long = "reboot-grace", env = "HEALTH_REBOOT_GRACE", default_value_t = 300.0)]
    pub reboot_grace: f64,
    /// Seconds of stream silence before restarting the producer service.
    #[arg(long = "service-restart-after", default_value_t = 120.0)]
    pub service_restart_after: f64,
    /// Minimum seconds between producer service restarts.
    #[arg(long = "service-restart-cooldown", default_value_t = 300.0)]
    pub service_restart_cooldown: f64,
    /// Seconds between heartbeat publications.
    #[arg(long = "heartbeat-interval", default_value_t = 60.0)]
    pub heartbeat_interval: f64,
    /// Name of the producer's service/container.
    #[arg(
        long = "service-name",
        env = "VIDEO_RUNNER_CONTAINER",
        default_value = "detect-objects-on-camera-modified-ei-video-obj-detection-runner-1"
    )]
    pub service_name: String,
    /// Local control socket.
    #[arg(long = "control-socket", default_value = "/var/run/docker.sock")]
    pub control_socket: PathBuf,
    /// Network control API address as host:port (repeatable).
    #[arg(
        long = "control-endpoint",
        value_delimiter = ',',
        default_values = ["172.17.0.1:2375", "host.docker.internal:2375"]
    )]
    pub control_endpoints: Vec<String>,
    /// Command-line tool used as the last restart resort.
    #[arg(long = "control-command", default_value = "docker")]
    pub control_command: String,
    /// MQTT broker host; health reboots are disabled without one.
    #[arg(long = "mqtt-host", env = "MQTT_HOST")]
    pub mqtt_host: Option<String>,
    #[arg(long = "mqtt-port", env = "MQTT_PORT", default_value_t = 1883)]
    pub mqtt_port: u16,
    #[arg(long = "mqtt-username", env = "MQTT_USERNAME")]
    pub mqtt_username: Option<String>,
    #[arg(long = "mqtt-password", env = "MQTT_PASSWORD", hide_env_values = true)]
    pub mqtt_password: Option<String>,
    /// Client id and device name used in status payloads.
    #[arg(long = "device-id", env = "MQTT_CLIENT_ID", default_value = "unoq")]
    pub device_id: String,
    #[arg(long = "status-topic", default_value = "unoq/status")]
    pub status_topic: String,
}

/// Telemetry flags.
#[derive(Debug, Args)]
pub struct TelemetryArgs {
    /// Emit Chrome trace JSON for post-mortem analysis.
    #[arg(long = "chrome-trace", value_name = "PATH")]
    pub chrome_trace: Option<PathBuf>,
    /// Render Prometheus metrics to a textfile collector path.
    #[arg(long = "metrics-textfile", value_name = "PATH")]
    pub metrics_textfile: Option<PathBuf>,
}

/// Upper bound for any interval flag; larger values would overflow deadline arithmetic.
const MAX_INTERVAL_SECS: f64 = 7.0 * 24.0 * 3600.0;

fn seconds(flag: &str, value: f64) -> Result<Duration> {
    if !value.is_finite() || value <= 0.0 {
        bail!("{flag} must be a positive number of seconds");
    }
    if value > MAX_INTERVAL_SECS {
        bail!("{flag} must be at most {MAX_INTERVAL_SECS} seconds");
    }
    Duration::try_from_secs_f64(value).with_context(|| format!("{flag} is not a valid duration"))
}

fn parse_host_port(raw: &str) -> Result<(String, u16)> {
    let (host, port) = raw
        .rsplit_once(':')
        .ok_or_else(|| anyhow!("control endpoint {raw:?} must be host:port"))?;
    if host.is_empty() {
        bail!("control endpoint {raw:?} has an empty host");
    }
    let port = port
        .parse::<u16>()
        .with_context(|| format!("control endpoint {raw:?} has an invalid port"))?;
    Ok((host.to_string(), port))
}

impl TryFrom<StreamArgs> for StreamConfig {
    type Error = anyhow::Error;

    fn try_from(args: StreamArgs) -> Result<Self> {
        if args.host.trim().is_empty() {
            bail!("--stream-host must not be empty");
        }
        if args.port == 0 {
            bail!("--stream-port must be non-zero");
        }

        // Reconnect attempts closer than a second apart only hammer the producer.
        let reconnect_interval = seconds("--reconnect-interval", args.reconnect_interval)?
            .max(Duration::from_secs(1));
        let fresh_age = seconds("--fresh-age", args.fresh_age)?;
        let stale_tolerance = seconds("--stale-tolerance", args.stale_tolerance)?;
        let extreme_staleness = seconds("--extreme-staleness", args.extreme_staleness)?;
        if stale_tolerance <= fresh_age {
            bail!("--stale-tolerance must exceed --fresh-age");
        }
        if extreme_staleness < stale_tolerance {
            bail!("--extreme-staleness must be at least --stale-tolerance");
        }
        if !args.model_input_size.is_finite() || args.model_input_size <= 0.0 {
            bail!("--model-input-size must be positive");
        }

        let defaults = StreamConfig::default();
        Ok(Self {
            endpoints: EndpointPlan {
                host: args.host.trim().to_string(),
                port: args.port,
                known_good: args.known_hosts,
                fallbacks: args.fallback_hosts,
                include_loopback: !args.no_loopback,
                include_local_ip: !args.no_local_ip,
            },
            reconnect_interval,
            connect_timeout: seconds("--connect-timeout", args.connect_timeout)?,
            connect_grace: seconds("--connect-grace", args.connect_grace)?,
            stale_reconnect_age: seconds("--stale-reconnect-age", args.stale_reconnect_age)?,
            fresh_age,
            stale_tolerance,
            extreme_staleness,
            model_input_size: args.model_input_size,
            ..defaults
        })
    }
}

impl TryFrom<HealthArgs> for HealthConfig {
    type Error = anyhow::Error;

    fn try_from(args: HealthArgs) -> Result<Self> {
        if args.service_name.trim().is_empty() {
            bail!("--service-name must not be empty");
        }
        let control_endpoints = args
            .control_endpoints
            .iter()
            .map(|raw| parse_host_port(raw))
            .collect::<Result<Vec<_>>>()?;

        let messaging = args.mqtt_host.map(|host| MqttConfig {
            host,
            port: args.mqtt_port,
            username: args.mqtt_username,
            password: args.mqtt_password,
            device_id: args.device_id,
            status_topic: args.status_topic,
        });

        let defaults = HealthConfig::default();
        Ok(Self {
            tick: seconds("--health-interval", args.interval)?,
            grace: seconds("--reboot-grace", args.reboot_grace)?,
            service_restart_after: seconds("--service-restart-after", args.service_restart_after)?,
            service_restart_cooldown: seconds(
                "--service-restart-cooldown",
                args.service_restart_cooldown,
            )?,
            heartbeat_interval: seconds("--heartbeat-interval", args.heartbeat_interval)?,
            restart: RestartConfig {
                service_name: args.service_name,
                control_socket: args.control_socket,
                control_endpoints,
                control_command: args.control_command,
                ..defaults.restart.clone()
            },
            messaging,
            ..defaults
        })
    }
}

impl From<TelemetryArgs> for TelemetryOptions {
    fn from(args: TelemetryArgs) -> Self {
        Self {
            chrome_trace_path: args.chrome_trace,
            metrics_textfile: args.metrics_textfile,
        }
    }
}
