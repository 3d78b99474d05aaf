//! Read path used by every frame consumer.
//!
//! Reads never connect synchronously; they only judge the frame already held
//! and, at worst, hand the link back to the reconnect loop.

use std::{
    sync::Arc,
    thread,
    time::{Duration, Instant},
};

use stream_ingest::Frame;
use tracing::{debug, warn};

use crate::pipeline::connection::{ConnectionManager, DisconnectReason};

#[derive(Clone)]
pub struct CaptureFacade {
    manager: Arc<ConnectionManager>,
}

impl CaptureFacade {
    pub fn new(manager: Arc<ConnectionManager>) -> Self {
        Self { manager }
    }

    pub fn capture_frame(&self) -> Option<Arc<Frame>> {
        self.capture_frame_at(Instant::now())
    }

    /// Frame judged against `now`: fresh, tolerably stale, or nothing.
    pub fn capture_frame_at(&self, now: Instant) -> Option<Arc<Frame>> {
        if !self.manager.is_connected() {
            return None;
        }
        let generation = self.manager.generation();
        let frame = self.manager.frames().latest()?;
        let age = now.saturating_duration_since(frame.captured_at);
        let config = self.manager.config();

        if age < config.fresh_age {
            return Some(frame);
        }
        if age <= config.stale_tolerance {
            metrics::counter!("capture_stale_frames_total").increment(1);
            warn!(age_secs = age.as_secs_f64(), "serving stale frame");
            return Some(frame);
        }
        if age > config.extreme_staleness {
            self.manager
                .force_disconnect(generation, now, DisconnectReason::ExtremeStaleness);
        } else {
            debug!(age_secs = age.as_secs_f64(), "frame too stale to serve");
        }
        None
    }

    /// Poll for a frame until one is available or `timeout` elapses.
    pub fn get_fresh_frame(&self, timeout: Duration) -> Option<Arc<Frame>> {
        let step = self.manager.config().fresh_poll_step;
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(frame) = self.capture_frame() {
                return Some(frame);
            }
            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            thread::sleep(step.min(deadline - now));
        }
    }

    /// [`get_fresh_frame`](Self::get_fresh_frame) with the configured budget.
    pub fn get_fresh_frame_default(&self) -> Option<Arc<Frame>> {
        self.get_fresh_frame(self.manager.config().fresh_poll_timeout)
    }
}

#[cfg(test)]
mod tests {
    use image::RgbImage;

    use super::*;
    use crate::pipeline::{
        connection::testing::{ScriptedTransport, Step, config},
        frame_store::FrameStore,
    };

    fn setup() -> (Arc<ConnectionManager>, CaptureFacade) {
        let transport = ScriptedTransport::new([Step::Accept]);
        let manager = Arc::new(ConnectionManager::new(
            config(&["runner"]),
            transport,
            Arc::new(FrameStore::new()),
        ));
        let capture = CaptureFacade::new(Arc::clone(&manager));
        (manager, capture)
    }

    #[test]
    fn nothing_is_served_while_disconnected() {
        let (manager, capture) = setup();
        let t0 = Instant::now();
        manager.frames().publish(RgbImage::new(2, 2), t0);
        assert!(capture.capture_frame_at(t0).is_none());
        assert_eq!(manager.generation(), 0);
    }

    #[test]
    fn fresh_and_stale_frames_are_served_then_dropped() {
        let (manager, capture) = setup();
        let t = Instant::now();
        assert!(manager.connect_at(t));
        let stored = manager.frames().publish(RgbImage::new(2, 2), t);

        let fresh = capture.capture_frame_at(t + Duration::from_millis(500)).unwrap();
        assert!(Arc::ptr_eq(&fresh, &stored));
        assert!(capture.capture_frame_at(t + Duration::from_secs(15)).is_some());

        // Past tolerance but not extreme: unavailable, link untouched.
        assert!(capture.capture_frame_at(t + Duration::from_secs(25)).is_none());
        assert!(manager.is_connected());

        assert!(capture.capture_frame_at(t + Duration::from_secs(40)).is_none());
        assert!(!manager.is_connected());
        assert!(manager.frames().latest().is_none());
        assert!(manager.reconnect_due(t + Duration::from_secs(40)));
    }

    #[test]
    fn get_fresh_frame_gives_up_after_timeout() {
        let (manager, capture) = setup();
        assert!(manager.connect());
        let started = Instant::now();
        assert!(capture.get_fresh_frame(Duration::from_millis(120)).is_none());
        assert!(started.elapsed() >= Duration::from_millis(120));

        manager.frames().publish(RgbImage::new(3, 3), Instant::now());
        assert!(capture.get_fresh_frame_default().is_some());
    }
}
