//! Resilient frame acquisition from an independently restartable stream
//! producer, with a layered escalation ladder for the device around it.
//!
//! - [`pipeline`]: connection state machine, reconnect loop, staleness
//!   watchdog, and the capture read path.
//! - [`geometry`]: mapping detector boxes onto frame pixels.
//! - [`detection`]: annotating detections and handing them to persistence.
//! - [`health`]: liveness signals, dependent-service restarts, and reboot.

pub mod detection;
pub mod geometry;
pub mod health;
pub mod pipeline;

pub use detection::{AnnotatedDetection, DetectionRecorder, DetectionSink, RecordError};
pub use geometry::{FrameShape, scale_bbox};
pub use health::{HealthMonitor, HealthSignals, MessagingChannel, MqttChannel, RestartChain};
pub use pipeline::{
    CaptureFacade, ConnectionManager, FrameStore, HealthConfig, StreamConfig, StreamSupervisor,
    TelemetryOptions,
};
