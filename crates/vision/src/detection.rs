//! Hand-off of a detection, with its frame, to the persistence collaborator.

use std::sync::Arc;

use image::{Rgb, RgbImage};
use stream_ingest::Frame;
use thiserror::Error;
use tracing::{debug, info};

use crate::{
    geometry::{FrameShape, scale_bbox},
    health::HealthSignals,
    pipeline::capture::CaptureFacade,
};

const BOX_COLOR: Rgb<u8> = Rgb([0, 255, 0]);

/// Detection ready to be stored: frame copy with the box drawn in.
#[derive(Clone, Debug)]
pub struct AnnotatedDetection {
    pub label: String,
    pub confidence: f32,
    /// Box in frame pixels, absent when the detector box could not be mapped.
    pub bbox: Option<[f64; 4]>,
    pub frame: RgbImage,
    pub frame_sequence: u64,
}

/// Stores annotated detections. File naming, logging and rotation live behind this.
pub trait DetectionSink: Send + Sync {
    fn persist(&self, detection: &AnnotatedDetection) -> anyhow::Result<()>;
}

#[derive(Debug, Error)]
pub enum RecordError {
    #[error("no fresh frame within the capture poll budget")]
    NoFrame,
    #[error("detection sink failed")]
    Sink(#[source] anyhow::Error),
}

pub struct DetectionRecorder {
    capture: CaptureFacade,
    sink: Arc<dyn DetectionSink>,
    signals: Arc<HealthSignals>,
    model_input_size: f64,
}

impl DetectionRecorder {
    pub fn new(
        capture: CaptureFacade,
        sink: Arc<dyn DetectionSink>,
        signals: Arc<HealthSignals>,
        model_input_size: f64,
    ) -> Self {
        Self {
            capture,
            sink,
            signals,
            model_input_size,
        }
    }

    /// Annotate and persist one detection.
    ///
    /// Uses `frame` when given, otherwise polls for a fresh one within the
    /// configured `fresh_poll_timeout`. A box
    /// that cannot be mapped onto the frame is dropped; the frame is still stored.
    pub fn record(
        &self,
        label: &str,
        confidence: f32,
        bbox: Option<&[f64]>,
        frame: Option<Arc<Frame>>,
    ) -> Result<AnnotatedDetection, RecordError> {
        let frame = frame
            .or_else(|| self.capture.get_fresh_frame_default())
            .ok_or(RecordError::NoFrame)?;

        let scaled = bbox.and_then(|bbox| {
            let scaled = scale_bbox(bbox, FrameShape::from(frame.as_ref()), self.model_input_size);
            if scaled.is_none() {
                debug!(?bbox, "detection box rejected");
            }
            scaled
        });

        let mut pixels = frame.pixels.clone();
        if let Some(bbox) = scaled {
            draw_box(&mut pixels, bbox, BOX_COLOR);
        }
        let detection = AnnotatedDetection {
            label: label.to_string(),
            confidence,
            bbox: scaled,
            frame: pixels,
            frame_sequence: frame.sequence,
        };

        self.sink.persist(&detection).map_err(RecordError::Sink)?;
        self.signals.mark_progress("detection");
        info!(label, confidence, "detection recorded");
        Ok(detection)
    }
}

/// Draw a 1-px rectangle outline, clipped to the image.
pub fn draw_box(image: &mut RgbImage, [x1, y1, x2, y2]: [f64; 4], color: Rgb<u8>) {
    if image.width() == 0 || image.height() == 0 {
        return;
    }
    let max_x = image.width() as i64 - 1;
    let max_y = image.height() as i64 - 1;
    let left = (x1 as i64).clamp(0, max_x) as u32;
    let right = (x2 as i64).clamp(0, max_x) as u32;
    let top = (y1 as i64).clamp(0, max_y) as u32;
    let bottom = (y2 as i64).clamp(0, max_y) as u32;

    for x in left..=right {
        image.put_pixel(x, top, color);
        image.put_pixel(x, bottom, color);
    }
    for y in top..=bottom {
        image.put_pixel(left, y, color);
        image.put_pixel(right, y, color);
    }
}
