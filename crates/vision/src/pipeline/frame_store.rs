//! Single-slot holder for the most recently decoded frame.

use std::{
    sync::{
        Arc, Mutex,
        atomic::{AtomicU64, Ordering},
    },
    time::{Duration, Instant},
};

use image::RgbImage;
use stream_ingest::Frame;

/// Latest frame published by the stream dispatch thread.
///
/// Frames are stored behind an `Arc` and swapped whole, so a reader either
/// sees the previous frame or the new one, never a mix.
pub struct FrameStore {
    slot: Mutex<Option<Arc<Frame>>>,
    sequence: AtomicU64,
    /// Arrival of the newest frame, kept across `clear`.
    last_arrival: Mutex<Option<Instant>>,
}

impl FrameStore {
    pub fn new() -> Self {
        Self {
            slot: Mutex::new(None),
            sequence: AtomicU64::new(0),
            last_arrival: Mutex::new(None),
        }
    }

    /// Replace the current frame, stamping it with `captured_at`.
    pub fn publish(&self, pixels: RgbImage, captured_at: Instant) -> Arc<Frame> {
        let sequence = self.sequence.fetch_add(1, Ordering::Relaxed) + 1;
        let frame = Arc::new(Frame::new(pixels, captured_at, sequence));
        if let Ok(mut slot) = self.slot.lock() {
            *slot = Some(Arc::clone(&frame));
        }
        if let Ok(mut last) = self.last_arrival.lock() {
            *last = Some(captured_at);
        }
        frame
    }

    pub fn latest(&self) -> Option<Arc<Frame>> {
        self.slot.lock().ok().and_then(|slot| slot.clone())
    }

    pub fn clear(&self) {
        if let Ok(mut slot) = self.slot.lock() {
            *slot = None;
        }
    }

    /// Age of the current frame at `now`, `None` when no frame is held.
    pub fn age(&self, now: Instant) -> Option<Duration> {
        self.latest()
            .map(|frame| now.saturating_duration_since(frame.captured_at))
    }

    /// When the newest frame arrived, even if it has since been cleared.
    pub fn last_arrival(&self) -> Option<Instant> {
        self.last_arrival.lock().ok().and_then(|last| *last)
    }

    /// Number of frames published since startup.
    pub fn published(&self) -> u64 {
        self.sequence.load(Ordering::Relaxed)
    }
}

impl Default for FrameStore {
    fn default() -> Self {
        Self::new()
    }
}
