//! Ownership of the single logical session with the stream producer.
//!
//! The link moves through `Disconnected -> Connecting -> Connected` and back
//! to `Disconnected` on any anomaly. Every transition happens under the link
//! lock; the current phase is mirrored into an atomic so hot paths can read
//! it without contending with a connect attempt that may take a while.

use std::{
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, AtomicU8, AtomicU64, Ordering},
    },
    time::{Duration, Instant},
};

use stream_ingest::{
    DecodeError, Endpoint, EventSink, SessionEvent, StreamEvent, StreamSession, StreamTransport,
    decode_payload,
};
use tracing::{debug, error, info, info_span, trace, warn};

use crate::pipeline::{config::StreamConfig, frame_store::FrameStore};

/// Hosts remembered from successful connects, most recent first.
const REMEMBERED_HOSTS: usize = 4;

/// Externally visible phase of the link.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum LinkPhase {
    Disconnected,
    Connecting,
    Connected,
}

impl LinkPhase {
    fn from_u8(raw: u8) -> Self {
        match raw {
            1 => LinkPhase::Connecting,
            2 => LinkPhase::Connected,
            _ => LinkPhase::Disconnected,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            LinkPhase::Disconnected => 0,
            LinkPhase::Connecting => 1,
            LinkPhase::Connected => 2,
        }
    }
}

/// Why a live link was torn down from the outside.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum DisconnectReason {
    /// Connected, but no frame within the stale-reconnect age.
    StaleFrames,
    /// The session reports itself closed while the link still says connected.
    SessionLost,
    /// A reader found a frame past the extreme staleness bound.
    ExtremeStaleness,
    /// Deliberate teardown at shutdown.
    Shutdown,
}

impl DisconnectReason {
    /// Human readable label used in log messages and metrics.
    pub fn label(self) -> &'static str {
        match self {
            DisconnectReason::StaleFrames => "stale_frames",
            DisconnectReason::SessionLost => "session_lost",
            DisconnectReason::ExtremeStaleness => "extreme_staleness",
            DisconnectReason::Shutdown => "shutdown",
        }
    }
}

enum LinkState {
    Disconnected,
    Connecting,
    Connected {
        session: Box<dyn StreamSession>,
        endpoint: Endpoint,
    },
}

/// Lock-free view of the link shared with session dispatch threads.
struct LinkSignals {
    phase: AtomicU8,
    /// Bumped for every session opened; events from older sessions are ignored.
    generation: AtomicU64,
    awaiting_first_frame: AtomicBool,
}

impl LinkSignals {
    fn phase(&self) -> LinkPhase {
        LinkPhase::from_u8(self.phase.load(Ordering::Acquire))
    }

    fn set_phase(&self, phase: LinkPhase) {
        self.phase.store(phase.as_u8(), Ordering::Release);
        metrics::gauge!("stream_connected").set(if phase == LinkPhase::Connected {
            1.0
        } else {
            0.0
        });
    }

    fn is_current(&self, generation: u64) -> bool {
        self.generation.load(Ordering::Acquire) == generation
    }
}

/// Decodes inbound events of one session generation into the frame store.
struct Inbound {
    signals: Arc<LinkSignals>,
    frames: Arc<FrameStore>,
    generation: u64,
}

impl Inbound {
    fn handle(&self, event: SessionEvent) {
        match event {
            SessionEvent::Message(event) => self.ingest(&event),
            SessionEvent::Closed => self.closed(),
        }
    }

    fn ingest(&self, event: &StreamEvent) {
        if !self.signals.is_current(self.generation) {
            return;
        }
        let mut last_err = None;
        for payload in &event.payloads {
            match decode_payload(payload) {
                Ok(pixels) => {
                    let frame = self.frames.publish(pixels, Instant::now());
                    metrics::counter!("stream_frames_decoded_total").increment(1);
                    if self.signals.awaiting_first_frame.swap(false, Ordering::AcqRel) {
                        info!(
                            event = %event.name,
                            width = frame.width(),
                            height = frame.height(),
                            "first frame received"
                        );
                    } else {
                        trace!(event = %event.name, sequence = frame.sequence, "frame decoded");
                    }
                    return;
                }
                Err(err) => last_err = Some(err),
            }
        }
        match last_err {
            None | Some(DecodeError::NoImage) => {
                trace!(event = %event.name, "event carried no image")
            }
            Some(err) => {
                metrics::counter!("stream_decode_failures_total").increment(1);
                debug!(event = %event.name, "dropping undecodable frame: {err}");
            }
        }
    }

    /// Only a Connected link is flipped here. A close racing the connect
    /// attempt is caught by the liveness check in `connect_at`.
    fn closed(&self) {
        if !self.signals.is_current(self.generation) {
            return;
        }
        let connected = LinkPhase::Connected.as_u8();
        let disconnected = LinkPhase::Disconnected.as_u8();
        if self
            .signals
            .phase
            .compare_exchange(connected, disconnected, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            metrics::gauge!("stream_connected").set(0.0);
            warn!("stream session closed by transport");
        }
    }
}

/// Owns the producer session and the transitions around it.
pub struct ConnectionManager {
    config: StreamConfig,
    transport: Arc<dyn StreamTransport>,
    frames: Arc<FrameStore>,
    link: Mutex<LinkState>,
    signals: Arc<LinkSignals>,
    last_connect_attempt: Mutex<Option<Instant>>,
    remembered: Mutex<Vec<String>>,
}

impl ConnectionManager {
    pub fn new(
        config: StreamConfig,
        transport: Arc<dyn StreamTransport>,
        frames: Arc<FrameStore>,
    ) -> Self {
        metrics::gauge!("stream_connected").set(0.0);
        Self {
            config,
            transport,
            frames,
            link: Mutex::new(LinkState::Disconnected),
            signals: Arc::new(LinkSignals {
                phase: AtomicU8::new(LinkPhase::Disconnected.as_u8()),
                generation: AtomicU64::new(0),
                awaiting_first_frame: AtomicBool::new(true),
            }),
            last_connect_attempt: Mutex::new(None),
            remembered: Mutex::new(Vec::new()),
        }
    }

    pub fn config(&self) -> &StreamConfig {
        &self.config
    }

    pub fn frames(&self) -> &Arc<FrameStore> {
        &self.frames
    }

    /// Eventually-consistent connected flag; never blocks.
    pub fn is_connected(&self) -> bool {
        self.signals.phase() == LinkPhase::Connected
    }

    pub fn phase(&self) -> LinkPhase {
        self.signals.phase()
    }

    /// Identifier of the most recently opened session.
    pub fn generation(&self) -> u64 {
        self.signals.generation.load(Ordering::Acquire)
    }

    pub fn last_connect_attempt(&self) -> Option<Instant> {
        self.last_connect_attempt.lock().ok().and_then(|guard| *guard)
    }

    /// Whether enough time passed since the last attempt for another one.
    pub fn reconnect_due(&self, now: Instant) -> bool {
        self.last_connect_attempt()
            .is_none_or(|last| now.saturating_duration_since(last) >= self.config.reconnect_interval)
    }

    /// Whether the last connect attempt is younger than the watchdog grace window.
    pub fn within_connect_grace(&self, now: Instant) -> bool {
        self.last_connect_attempt()
            .is_some_and(|last| now.saturating_duration_since(last) < self.config.connect_grace)
    }

    /// Endpoint of the live session, if any.
    pub fn endpoint(&self) -> Option<Endpoint> {
        match &*self.link.lock().ok()? {
            LinkState::Connected { endpoint, .. } => Some(endpoint.clone()),
            _ => None,
        }
    }

    /// Whether the held session still reports itself open.
    pub fn session_alive(&self) -> bool {
        match self.link.lock() {
            Ok(link) => match &*link {
                LinkState::Connected { session, .. } => session.is_alive(),
                _ => false,
            },
            Err(_) => false,
        }
    }

    /// Hosts that connected during this process lifetime, most recent first.
    pub fn remembered_hosts(&self) -> Vec<String> {
        self.remembered
            .lock()
            .map(|hosts| hosts.clone())
            .unwrap_or_default()
    }

    /// Establish the producer session. Never fails past this boundary.
    pub fn connect(&self) -> bool {
        self.connect_at(Instant::now())
    }

    /// Same as [`connect`](Self::connect) with the attempt stamped at `now`.
    pub fn connect_at(&self, now: Instant) -> bool {
        if self.is_connected() {
            return true;
        }
        let Ok(mut link) = self.link.lock() else {
            error!("connection lock poisoned; skipping connect");
            return false;
        };
        if self.is_connected() {
            return true;
        }
        if let Ok(mut last) = self.last_connect_attempt.lock() {
            *last = Some(now);
        }

        // A session the transport closed under us is still held here.
        if let LinkState::Connected { session, endpoint } =
            std::mem::replace(&mut *link, LinkState::Connecting)
        {
            debug!(%endpoint, "discarding closed session before reconnecting");
            if let Err(err) = session.disconnect() {
                debug!(%endpoint, "closing stale session failed: {err}");
            }
        }
        self.signals.set_phase(LinkPhase::Connecting);

        let candidates = self.config.endpoints.candidates(&self.remembered_hosts());
        for endpoint in candidates {
            let generation = self.signals.generation.fetch_add(1, Ordering::AcqRel) + 1;
            let _attempt =
                info_span!("stream.connect_attempt", %endpoint, generation).entered();
            metrics::counter!("stream_connect_attempts_total").increment(1);
            self.signals.awaiting_first_frame.store(true, Ordering::Release);
            debug!(%endpoint, generation, "trying stream endpoint");

            match self
                .transport
                .open(&endpoint, self.sink_for(generation), self.config.connect_timeout)
            {
                Ok(session) if !session.is_alive() => {
                    metrics::counter!("stream_connect_failures_total").increment(1);
                    debug!(%endpoint, "session closed while connecting");
                }
                Ok(session) => {
                    for event in &self.config.wake_events {
                        if let Err(err) = session.emit(event) {
                            debug!(%endpoint, event = %event, "wake-up emit failed: {err}");
                        }
                    }
                    self.remember(&endpoint.host);
                    info!(%endpoint, "stream connected");
                    *link = LinkState::Connected { session, endpoint };
                    self.signals.set_phase(LinkPhase::Connected);
                    return true;
                }
                Err(err) if err.is_desync() => {
                    metrics::counter!("stream_connect_failures_total").increment(1);
                    warn!(%endpoint, "stream client out of sync, rebuilding on next attempt: {err}");
                    self.retire_attempts();
                    *link = LinkState::Disconnected;
                    self.signals.set_phase(LinkPhase::Disconnected);
                    return false;
                }
                Err(err) => {
                    metrics::counter!("stream_connect_failures_total").increment(1);
                    debug!(%endpoint, "stream endpoint failed: {err}");
                }
            }
        }

        warn!("no stream endpoint reachable");
        self.retire_attempts();
        *link = LinkState::Disconnected;
        self.signals.set_phase(LinkPhase::Disconnected);
        false
    }

    /// Tear down the session opened as `generation` and make the next reconnect tick fire.
    ///
    /// Returns `false` without touching anything when a newer session has
    /// replaced the one the caller judged.
    pub fn force_disconnect(&self, generation: u64, now: Instant, reason: DisconnectReason) -> bool {
        let Ok(mut link) = self.link.lock() else {
            error!("connection lock poisoned; cannot force disconnect");
            return false;
        };
        if !self.signals.is_current(generation) {
            debug!(generation, "skipping disconnect of superseded session");
            return false;
        }

        self.signals.set_phase(LinkPhase::Disconnected);
        if let LinkState::Connected { session, endpoint } =
            std::mem::replace(&mut *link, LinkState::Disconnected)
        {
            if let Err(err) = session.disconnect() {
                debug!(%endpoint, "disconnect failed: {err}");
            }
        }
        self.frames.clear();
        if let Ok(mut last) = self.last_connect_attempt.lock() {
            *last = now.checked_sub(self.config.reconnect_interval);
        }

        metrics::counter!("stream_forced_disconnects_total", "reason" => reason.label())
            .increment(1);
        if reason != DisconnectReason::Shutdown {
            error!(reason = reason.label(), "forced stream disconnect");
        }
        true
    }

    fn sink_for(&self, generation: u64) -> EventSink {
        let inbound = Inbound {
            signals: Arc::clone(&self.signals),
            frames: Arc::clone(&self.frames),
            generation,
        };
        Arc::new(move |event| inbound.handle(event))
    }

    /// Invalidate sinks handed to failed attempts.
    fn retire_attempts(&self) {
        self.signals.generation.fetch_add(1, Ordering::AcqRel);
    }

    fn remember(&self, host: &str) {
        if let Ok(mut hosts) = self.remembered.lock() {
            hosts.retain(|known| !known.eq_ignore_ascii_case(host));
            hosts.insert(0, host.to_string());
            hosts.truncate(REMEMBERED_HOSTS);
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! Scripted transport used by the pipeline tests.

    use std::{collections::VecDeque, sync::atomic::AtomicUsize};

    use stream_ingest::StreamError;

    use super::*;

    #[derive(Default)]
    pub(crate) struct SessionProbe {
        pub alive: AtomicBool,
        pub disconnects: AtomicUsize,
        pub emitted: Mutex<Vec<String>>,
    }

    struct ScriptedSession(Arc<SessionProbe>);

    impl StreamSession for ScriptedSession {
        fn is_alive(&self) -> bool {
            self.0.alive.load(Ordering::SeqCst)
        }

        fn emit(&self, event: &str) -> Result<(), StreamError> {
            self.0.emitted.lock().unwrap().push(event.to_string());
            Ok(())
        }

        fn disconnect(&self) -> Result<(), StreamError> {
            self.0.alive.store(false, Ordering::SeqCst);
            self.0.disconnects.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    pub(crate) enum Step {
        Accept,
        /// Session reports closed before `open` returns.
        CloseDuringOpen,
        Refuse,
        Desync,
    }

    /// Transport answering each `open` with the next scripted step; refuses when exhausted.
    #[derive(Default)]
    pub(crate) struct ScriptedTransport {
        steps: Mutex<VecDeque<Step>>,
        pub opened: Mutex<Vec<Endpoint>>,
        pub sessions: Mutex<Vec<Arc<SessionProbe>>>,
        pub sinks: Mutex<Vec<EventSink>>,
    }

    impl ScriptedTransport {
        pub(crate) fn new(steps: impl IntoIterator<Item = Step>) -> Arc<Self> {
            Arc::new(Self {
                steps: Mutex::new(steps.into_iter().collect()),
                ..Self::default()
            })
        }

        pub(crate) fn push(&self, step: Step) {
            self.steps.lock().unwrap().push_back(step);
        }

        pub(crate) fn last_sink(&self) -> EventSink {
            Arc::clone(self.sinks.lock().unwrap().last().unwrap())
        }

        pub(crate) fn last_session(&self) -> Arc<SessionProbe> {
            Arc::clone(self.sessions.lock().unwrap().last().unwrap())
        }
    }

    impl StreamTransport for ScriptedTransport {
        fn open(
            &self,
            endpoint: &Endpoint,
            sink: EventSink,
            _timeout: Duration,
        ) -> Result<Box<dyn StreamSession>, StreamError> {
            self.opened.lock().unwrap().push(endpoint.clone());
            self.sinks.lock().unwrap().push(Arc::clone(&sink));
            let step = self.steps.lock().unwrap().pop_front();
            match step {
                Some(Step::Accept) => {
                    let probe = Arc::new(SessionProbe::default());
                    probe.alive.store(true, Ordering::SeqCst);
                    self.sessions.lock().unwrap().push(Arc::clone(&probe));
                    Ok(Box::new(ScriptedSession(probe)))
                }
                Some(Step::CloseDuringOpen) => {
                    let probe = Arc::new(SessionProbe::default());
                    self.sessions.lock().unwrap().push(Arc::clone(&probe));
                    sink(SessionEvent::Closed);
                    Ok(Box::new(ScriptedSession(probe)))
                }
                Some(Step::Desync) => Err(StreamError::Desync {
                    endpoint: endpoint.to_string(),
                    detail: "Session ID unknown".into(),
                }),
                Some(Step::Refuse) | None => Err(StreamError::Protocol {
                    endpoint: endpoint.to_string(),
                    detail: "connection refused".into(),
                }),
            }
        }
    }

    pub(crate) fn config(hosts: &[&str]) -> StreamConfig {
        let mut config = StreamConfig::default();
        config.endpoints.host = hosts[0].to_string();
        config.endpoints.fallbacks = hosts[1..].iter().map(|h| h.to_string()).collect();
        config.endpoints.include_loopback = false;
        config.endpoints.include_local_ip = false;
        config
    }

    pub(crate) fn png_event() -> StreamEvent {
        use base64::Engine as _;
        let mut bytes = Vec::new();
        image::RgbImage::from_pixel(4, 3, image::Rgb([10, 20, 30]))
            .write_to(&mut std::io::Cursor::new(&mut bytes), image::ImageFormat::Png)
            .unwrap();
        let encoded = base64::engine::general_purpose::STANDARD.encode(bytes);
        StreamEvent {
            name: "image".into(),
            payloads: vec![stream_ingest::Payload::Json(serde_json::json!({
                "img": format!("data:image/png;base64,{encoded}")
            }))],
        }
    }
}
