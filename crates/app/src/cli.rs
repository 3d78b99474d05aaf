use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};
use vision::pipeline::config::{HealthArgs, StreamArgs, TelemetryArgs};

/// Keeps a fresh camera frame flowing from the detection runner and escalates
/// when the stream, its service, or the device stop making progress.
#[derive(Debug, Parser)]
#[command(name = "stream-sentinel", version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    #[command(flatten)]
    pub telemetry: TelemetryArgs,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run the stream supervisor, health monitor and heartbeat until interrupted.
    Run(RunArgs),
    /// Connect once, wait for a frame and optionally save it annotated.
    Probe(ProbeArgs),
    /// Restart the producer's service through the control channels and exit.
    RestartService(RestartArgs),
}

#[derive(Debug, Args)]
pub struct RunArgs {
    #[command(flatten)]
    pub stream: StreamArgs,

    #[command(flatten)]
    pub health: HealthArgs,
}

#[derive(Debug, Args)]
pub struct ProbeArgs {
    #[command(flatten)]
    pub stream: StreamArgs,

    /// Seconds to wait for the first frame.
    #[arg(long = "wait", default_value_t = 30.0)]
    pub wait_secs: f64,

    /// Directory to save the frame into, as a timestamped JPEG with a JSON sidecar.
    #[arg(long = "output-dir", value_name = "DIR")]
    pub output_dir: Option<PathBuf>,

    /// Label recorded alongside the saved frame.
    #[arg(long, default_value = "probe")]
    pub label: String,

    #[arg(long, default_value_t = 1.0)]
    pub confidence: f32,

    /// Detector box to draw, as x1,y1,x2,y2 in any supported coordinate space.
    #[arg(long, value_parser = parse_bbox, allow_hyphen_values = true)]
    pub bbox: Option<BoxArg>,
}

/// Four box coordinates given on the command line.
#[derive(Clone, Debug, PartialEq)]
pub struct BoxArg(pub [f64; 4]);

fn parse_bbox(raw: &str) -> Result<BoxArg, String> {
    let coords = raw
        .split(',')
        .map(|part| part.trim().parse::<f64>().map_err(|err| format!("{part:?}: {err}")))
        .collect::<Result<Vec<_>, _>>()?;
    let coords: [f64; 4] = coords
        .try_into()
        .map_err(|coords: Vec<f64>| format!("expected 4 coordinates, got {}", coords.len()))?;
    Ok(BoxArg(coords))
}

#[derive(Debug, Args)]
pub struct RestartArgs {
    #[command(flatten)]
    pub health: HealthArgs,
}
