use std::{
    fs,
    path::{Path, PathBuf},
    sync::Arc,
    time::{Duration, Instant},
};

use anyhow::{Context, Result, anyhow, bail};
use chrono::{Local, Utc};
use image::ImageFormat;
use serde_json::json;
use stream_ingest::PollingTransport;
use tracing::info;
use vision::{
    AnnotatedDetection, CaptureFacade, ConnectionManager, DetectionRecorder, DetectionSink,
    FrameStore, HealthSignals, StreamConfig, pipeline::DisconnectReason,
};

use crate::cli::ProbeArgs;

/// Writes each detection as a timestamped JPEG plus a JSON sidecar.
pub struct JpegDirectorySink {
    dir: PathBuf,
}

impl JpegDirectorySink {
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)
            .with_context(|| format!("failed to create output directory {}", dir.display()))?;
        Ok(Self { dir })
    }

    fn stem(detection: &AnnotatedDetection) -> String {
        format!(
            "detection_{}_{:06}",
            Local::now().format("%Y%m%d_%H%M%S"),
            detection.frame_sequence
        )
    }
}

impl DetectionSink for JpegDirectorySink {
    fn persist(&self, detection: &AnnotatedDetection) -> Result<()> {
        let stem = Self::stem(detection);
        let image_path = self.dir.join(format!("{stem}.jpg"));
        detection
            .frame
            .save_with_format(&image_path, ImageFormat::Jpeg)
            .with_context(|| format!("failed to write {}", image_path.display()))?;

        let sidecar = json!({
            "label": detection.label,
            "confidence": detection.confidence,
            "bbox": detection.bbox,
            "frame_sequence": detection.frame_sequence,
            "timestamp": Utc::now().timestamp_millis(),
            "image": image_path.file_name().and_then(|name| name.to_str()),
        });
        let sidecar_path = self.dir.join(format!("{stem}.json"));
        fs::write(&sidecar_path, serde_json::to_vec_pretty(&sidecar)?)
            .with_context(|| format!("failed to write {}", sidecar_path.display()))?;

        info!(path = %image_path.display(), label = %detection.label, "detection saved");
        Ok(())
    }
}

fn save_detection(
    capture: CaptureFacade,
    dir: &Path,
    args: &ProbeArgs,
    model_input_size: f64,
    frame: Arc<stream_ingest::Frame>,
) -> Result<AnnotatedDetection> {
    let recorder = DetectionRecorder::new(
        capture,
        Arc::new(JpegDirectorySink::new(dir)?),
        Arc::new(HealthSignals::starting_now()),
        model_input_size,
    );
    let bbox = args.bbox.as_ref().map(|bbox| &bbox.0[..]);
    Ok(recorder.record(&args.label, args.confidence, bbox, Some(frame))?)
}

pub fn run(args: ProbeArgs) -> Result<()> {
    let config = StreamConfig::try_from(args.stream.clone())?;
    let wait = Duration::try_from_secs_f64(args.wait_secs)
        .map_err(|_| anyhow!("--wait must be a non-negative number of seconds"))?;
    let model_input_size = config.model_input_size;

    let transport = PollingTransport::new()?;
    let manager = Arc::new(ConnectionManager::new(
        config,
        Arc::new(transport),
        Arc::new(FrameStore::new()),
    ));
    if !manager.connect() {
        bail!("no stream endpoint accepted a connection");
    }
    let endpoint = manager.endpoint();
    info!(?endpoint, wait_secs = wait.as_secs_f64(), "connected; waiting for a frame");

    let capture = CaptureFacade::new(Arc::clone(&manager));
    let result = capture
        .get_fresh_frame(wait)
        .ok_or_else(|| anyhow!("no fresh frame within {wait:?}"))
        .and_then(|frame| {
            info!(
                width = frame.width(),
                height = frame.height(),
                sequence = frame.sequence,
                "frame received"
            );
            match &args.output_dir {
                Some(dir) => {
                    save_detection(capture.clone(), dir, &args, model_input_size, frame)
                        .map(|_| ())
                }
                None => Ok(()),
            }
        });

    manager.force_disconnect(
        manager.generation(),
        Instant::now(),
        DisconnectReason::Shutdown,
    );
    result
}
