//! Stream producer ingress: endpoints, transport sessions, and payload decoding.
//!
//! - `endpoints`: ordered candidate addresses for the producer.
//! - `transport`: the session seam the connection manager drives.
//! - `socketio`: Socket.IO over Engine.IO long-polling.
//! - `payload`: locating and decoding images inside inbound events.

pub mod endpoints;
pub mod payload;
pub mod socketio;
pub mod transport;
pub mod types;

pub use endpoints::EndpointPlan;
pub use payload::decode_payload;
pub use socketio::PollingTransport;
pub use transport::{EventSink, SessionEvent, StreamSession, StreamTransport};
pub use types::{DecodeError, Endpoint, Frame, Payload, StreamError, StreamEvent};
