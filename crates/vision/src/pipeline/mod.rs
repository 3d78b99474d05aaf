//! Stream acquisition: connection state machine, supervisor loops and the read path.

pub mod capture;
pub mod config;
pub mod connection;
pub mod frame_store;
pub mod supervisor;
pub mod telemetry;
pub mod watchdog;

pub use capture::CaptureFacade;
pub use config::{HealthConfig, StreamConfig, TelemetryOptions};
pub use connection::{ConnectionManager, DisconnectReason, LinkPhase};
pub use frame_store::FrameStore;
pub use supervisor::{ReconnectLoop, ShutdownListener, ShutdownTrigger, StreamSupervisor};
pub use watchdog::{StalenessWatchdog, WatchdogVerdict};
