use std::{sync::Arc, time::Duration};

use crate::types::{Endpoint, StreamError, StreamEvent};

/// Notification delivered from a session's dispatch thread.
#[derive(Clone, Debug, PartialEq)]
pub enum SessionEvent {
    Message(StreamEvent),
    /// The session ended on its own (remote close, transport failure).
    Closed,
}

/// Callback invoked on the session's dispatch thread for every inbound event.
pub type EventSink = Arc<dyn Fn(SessionEvent) + Send + Sync>;

/// Factory for live sessions with the stream producer.
pub trait StreamTransport: Send + Sync {
    /// Open a session against `endpoint`, returning once the producer has
    /// acknowledged it or `timeout` elapsed. Failed attempts leave nothing open.
    fn open(
        &self,
        endpoint: &Endpoint,
        sink: EventSink,
        timeout: Duration,
    ) -> Result<Box<dyn StreamSession>, StreamError>;
}

/// Handle to one open session.
pub trait StreamSession: Send + Sync {
    /// Whether the transport still considers the session open.
    fn is_alive(&self) -> bool;

    fn emit(&self, event: &str) -> Result<(), StreamError>;

    /// Close the session. Idempotent.
    fn disconnect(&self) -> Result<(), StreamError>;
}
