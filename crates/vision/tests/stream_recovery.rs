use std::{
    io::Cursor,
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, Ordering},
    },
    time::{Duration, Instant},
};

use image::{ImageFormat, Rgb, RgbImage};
use stream_ingest::{
    Endpoint, EventSink, Payload, SessionEvent, StreamError, StreamEvent, StreamSession,
    StreamTransport,
};
use vision::{
    CaptureFacade, ConnectionManager, FrameStore, StreamConfig,
    pipeline::{DisconnectReason, ReconnectLoop, StalenessWatchdog, WatchdogVerdict},
};

struct SilentSession {
    alive: Arc<AtomicBool>,
}

impl StreamSession for SilentSession {
    fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    fn emit(&self, _event: &str) -> Result<(), StreamError> {
        Ok(())
    }

    fn disconnect(&self) -> Result<(), StreamError> {
        self.alive.store(false, Ordering::SeqCst);
        Ok(())
    }
}

/// Accepts every connection and never sends a frame.
#[derive(Default)]
struct SilentProducer {
    opened: Mutex<Vec<Endpoint>>,
}

/// Accepts every connection and hands the test each session's sink to drive.
#[derive(Default)]
struct SteeredProducer {
    sinks: Mutex<Vec<EventSink>>,
}

impl SteeredProducer {
    fn sink(&self, index: usize) -> EventSink {
        Arc::clone(&self.sinks.lock().unwrap()[index])
    }
}

impl StreamTransport for SteeredProducer {
    fn open(
        &self,
        _endpoint: &Endpoint,
        sink: EventSink,
        _timeout: Duration,
    ) -> Result<Box<dyn StreamSession>, StreamError> {
        self.sinks.lock().unwrap().push(sink);
        Ok(Box::new(SilentSession {
            alive: Arc::new(AtomicBool::new(true)),
        }))
    }
}

fn frame_event(shade: u8) -> SessionEvent {
    let mut bytes = Cursor::new(Vec::new());
    RgbImage::from_pixel(8, 6, Rgb([shade, shade, shade]))
        .write_to(&mut bytes, ImageFormat::Png)
        .unwrap();
    SessionEvent::Message(StreamEvent {
        name: "frame".into(),
        payloads: vec![Payload::Binary(bytes.into_inner())],
    })
}

impl StreamTransport for SilentProducer {
    fn open(
        &self,
        endpoint: &Endpoint,
        _sink: EventSink,
        _timeout: Duration,
    ) -> Result<Box<dyn StreamSession>, StreamError> {
        self.opened.lock().unwrap().push(endpoint.clone());
        Ok(Box::new(SilentSession {
            alive: Arc::new(AtomicBool::new(true)),
        }))
    }
}

fn config() -> StreamConfig {
    let mut config = StreamConfig::default();
    config.endpoints.host = "runner".into();
    config.endpoints.include_loopback = false;
    config.endpoints.include_local_ip = false;
    config.reconnect_interval = Duration::from_secs(5);
    config.stale_reconnect_age = Duration::from_secs(30);
    config
}

fn setup() -> (Arc<SilentProducer>, Arc<ConnectionManager>) {
    let producer = Arc::new(SilentProducer::default());
    let manager = Arc::new(ConnectionManager::new(
        config(),
        Arc::clone(&producer) as Arc<dyn StreamTransport>,
        Arc::new(FrameStore::new()),
    ));
    (producer, manager)
}

#[test]
fn silent_stream_is_recycled_on_the_next_reconnect_tick() {
    let (producer, manager) = setup();
    let reconnect = ReconnectLoop::new(Arc::clone(&manager));
    let watchdog = StalenessWatchdog::new(Arc::clone(&manager));
    let t0 = Instant::now();
    let at = |secs: u64| t0 + Duration::from_secs(secs);

    assert_eq!(reconnect.tick(at(0)), Some(true));
    for secs in 1..35 {
        assert_eq!(reconnect.tick(at(secs)), None);
        if secs % 5 == 0 && secs < 30 {
            assert_ne!(
                watchdog.tick(at(secs)),
                WatchdogVerdict::Reconnect(DisconnectReason::StaleFrames)
            );
        }
    }
    assert!(manager.is_connected());

    assert_eq!(
        watchdog.tick(at(35)),
        WatchdogVerdict::Reconnect(DisconnectReason::StaleFrames)
    );
    assert!(!manager.is_connected());
    assert!(manager.frames().latest().is_none());
    // The attempt clock was rewound, so reconnecting is due at once.
    assert!(manager.reconnect_due(at(35)));

    assert_eq!(reconnect.tick(at(36)), Some(true));
    assert_eq!(producer.opened.lock().unwrap().len(), 2);
    // The new connection gets its own grace window.
    assert_eq!(watchdog.tick(at(40)), WatchdogVerdict::InGrace);
}

#[test]
fn capture_serves_fresh_then_stale_then_forces_disconnect() {
    let (_producer, manager) = setup();
    let capture = CaptureFacade::new(Arc::clone(&manager));
    let t = Instant::now();
    assert!(manager.connect_at(t));
    let stored = manager.frames().publish(RgbImage::new(640, 480), t);

    let fresh = capture.capture_frame_at(t + Duration::from_millis(500)).unwrap();
    assert!(Arc::ptr_eq(&fresh, &stored));
    let stale = capture.capture_frame_at(t + Duration::from_secs(15)).unwrap();
    assert_eq!(stale.sequence, stored.sequence);

    assert!(capture.capture_frame_at(t + Duration::from_secs(40)).is_none());
    assert!(!manager.is_connected());
    assert!(capture.capture_frame_at(t + Duration::from_secs(41)).is_none());
}

#[test]
fn disconnected_capture_ignores_buffered_frame() {
    let (_producer, manager) = setup();
    let capture = CaptureFacade::new(Arc::clone(&manager));
    manager.frames().publish(RgbImage::new(2, 2), Instant::now());
    assert!(capture.capture_frame().is_none());
}

#[test]
fn transport_close_is_recovered_and_old_session_stays_quiet() {
    let producer = Arc::new(SteeredProducer::default());
    let manager = Arc::new(ConnectionManager::new(
        config(),
        Arc::clone(&producer) as Arc<dyn StreamTransport>,
        Arc::new(FrameStore::new()),
    ));
    let capture = CaptureFacade::new(Arc::clone(&manager));
    let reconnect = ReconnectLoop::new(Arc::clone(&manager));
    let t0 = Instant::now();

    assert_eq!(reconnect.tick(t0), Some(true));
    producer.sink(0)(frame_event(10));
    let first = capture.capture_frame().unwrap();
    assert_eq!(first.pixels.get_pixel(0, 0), &Rgb([10, 10, 10]));

    producer.sink(0)(SessionEvent::Closed);
    assert!(!manager.is_connected());
    assert!(capture.capture_frame().is_none());
    assert_eq!(reconnect.tick(t0 + Duration::from_secs(1)), None);
    assert_eq!(reconnect.tick(t0 + Duration::from_secs(5)), Some(true));

    producer.sink(0)(frame_event(99));
    assert_eq!(manager.frames().latest().unwrap().sequence, first.sequence);
    producer.sink(1)(frame_event(200));
    let second = capture.capture_frame().unwrap();
    assert_eq!(second.pixels.get_pixel(0, 0), &Rgb([200, 200, 200]));
    assert!(second.sequence > first.sequence);
}
