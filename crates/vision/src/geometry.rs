//! Mapping detector boxes onto frame pixel coordinates.
//!
//! The detector does not say which space its boxes are in. The space is
//! inferred from the largest coordinate, checked in this order:
//!
//! 1. `max <= 1 + EPS`: normalized, multiplied by the frame size.
//! 2. `max <= model_input_size + EPS`: square model input with letterbox
//!    padding, mapped back through the inverse letterbox transform.
//! 3. anything larger: already frame pixels.
//!
//! The result is clamped to the frame and rejected if it collapses.

use stream_ingest::Frame;

const EPS: f64 = 1e-6;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct FrameShape {
    pub width: u32,
    pub height: u32,
}

impl FrameShape {
    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }
}

impl From<&Frame> for FrameShape {
    fn from(frame: &Frame) -> Self {
        Self::new(frame.width(), frame.height())
    }
}

/// Letterbox parameters of a frame resized into a square model input.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct Letterbox {
    pub scale: f64,
    pub pad_x: f64,
    pub pad_y: f64,
}

impl Letterbox {
    pub fn new(frame: FrameShape, model_input_size: f64) -> Self {
        let (w, h) = (f64::from(frame.width), f64::from(frame.height));
        let scale = (model_input_size / w).min(model_input_size / h);
        Self {
            scale,
            pad_x: (model_input_size - w * scale) / 2.0,
            pad_y: (model_input_size - h * scale) / 2.0,
        }
    }

    /// Frame pixels to model input space.
    pub fn forward(&self, [x1, y1, x2, y2]: [f64; 4]) -> [f64; 4] {
        [
            x1 * self.scale + self.pad_x,
            y1 * self.scale + self.pad_y,
            x2 * self.scale + self.pad_x,
            y2 * self.scale + self.pad_y,
        ]
    }

    /// Model input space to frame pixels.
    pub fn inverse(&self, [x1, y1, x2, y2]: [f64; 4]) -> [f64; 4] {
        [
            (x1 - self.pad_x) / self.scale,
            (y1 - self.pad_y) / self.scale,
            (x2 - self.pad_x) / self.scale,
            (y2 - self.pad_y) / self.scale,
        ]
    }
}

/// Map `bbox` (`[x1, y1, x2, y2]`) onto `frame` pixel coordinates.
///
/// Returns `None` for anything but four finite coordinates, an empty frame,
/// a non-positive model size, or a box that is empty after clamping.
pub fn scale_bbox(bbox: &[f64], frame: FrameShape, model_input_size: f64) -> Option<[f64; 4]> {
    let coords: [f64; 4] = bbox.try_into().ok()?;
    if coords.iter().any(|c| !c.is_finite()) {
        return None;
    }
    if frame.width == 0 || frame.height == 0 {
        return None;
    }
    if !model_input_size.is_finite() || model_input_size <= 0.0 {
        return None;
    }

    let (w, h) = (f64::from(frame.width), f64::from(frame.height));
    let max_coord = coords.iter().copied().fold(f64::NEG_INFINITY, f64::max);

    let [x1, y1, x2, y2] = if (0.0..=1.0 + EPS).contains(&max_coord) {
        let [x1, y1, x2, y2] = coords;
        [x1 * w, y1 * h, x2 * w, y2 * h]
    } else if max_coord <= model_input_size + EPS {
        Letterbox::new(frame, model_input_size).inverse(coords)
    } else {
        coords
    };

    let clamp_x = |v: f64| v.clamp(0.0, w - 1.0);
    let clamp_y = |v: f64| v.clamp(0.0, h - 1.0);
    let scaled = [clamp_x(x1), clamp_y(y1), clamp_x(x2), clamp_y(y2)];
    if scaled[2] <= scaled[0] || scaled[3] <= scaled[1] {
        return None;
    }
    Some(scaled)
}
