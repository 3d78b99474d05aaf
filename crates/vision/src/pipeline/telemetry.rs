//! Telemetry helpers for tracing spans, Prometheus metrics, and daemon threads.
//!
//! The Chrome trace only records spans. The ones worth looking at are
//! `stream.connect_attempt` (one per endpoint tried), `stream.watchdog_tick`,
//! `health.tick` and `health.service_restart`.

use std::{
    fs, io,
    path::{Path, PathBuf},
    sync::OnceLock,
    thread,
    time::Duration,
};

use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use tracing_chrome::{ChromeLayer, ChromeLayerBuilder, FlushGuard, TraceStyle};
use tracing_subscriber::{
    Registry,
    filter::{EnvFilter, filter_fn},
    fmt,
    prelude::*,
};

use crate::pipeline::config::TelemetryOptions;

static PROM_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();
static PROM_UPKEEP_THREAD: OnceLock<thread::JoinHandle<()>> = OnceLock::new();

const UPKEEP_INTERVAL: Duration = Duration::from_secs(5);

/// Keeps the thread-default subscriber installed and flushes the Chrome trace on drop.
pub struct TelemetryGuard {
    _default_guard: tracing::subscriber::DefaultGuard,
    chrome_guard: Option<FlushGuard>,
}

/// Install the global Prometheus recorder once and start its upkeep thread.
///
/// The upkeep thread also renders the registry into `opts.metrics_textfile`
/// when one is configured.
pub fn init_metrics_recorder(opts: &TelemetryOptions) -> &'static PrometheusHandle {
    PROM_HANDLE.get_or_init(|| {
        let recorder = PrometheusBuilder::new().build_recorder();
        let handle = recorder.handle();

        if let Err(err) = metrics::set_global_recorder(recorder) {
            tracing::warn!("metrics recorder already installed: {err}");
        }

        let upkeep_handle = handle.clone();
        let textfile = opts.metrics_textfile.clone();
        let upkeep = spawn_thread("metrics-upkeep", move || {
            loop {
                thread::sleep(UPKEEP_INTERVAL);
                upkeep_handle.run_upkeep();
                if let Some(path) = textfile.as_deref() {
                    if let Err(err) = write_textfile(path, &upkeep_handle.render()) {
                        tracing::warn!(
                            "failed to write metrics textfile {}: {err}",
                            path.display()
                        );
                    }
                }
            }
        });
        match upkeep {
            Ok(thread) => {
                let _ = PROM_UPKEEP_THREAD.set(thread);
            }
            Err(err) => tracing::warn!("metrics upkeep thread not started: {err}"),
        }

        handle
    })
}

/// Install the console subscriber, plus a span-only Chrome trace when requested.
pub fn enter_runtime(opts: &TelemetryOptions) -> TelemetryGuard {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let (chrome, chrome_guard, chrome_error) = match opts.chrome_trace_path.as_deref() {
        Some(path) => match chrome_trace(path) {
            Ok((layer, guard)) => (Some(layer), Some(guard), None),
            Err(err) => (None, None, Some((path.to_path_buf(), err))),
        },
        None => (None, None, None),
    };

    let subscriber = tracing_subscriber::registry()
        .with(chrome.map(|layer| layer.with_filter(filter_fn(|metadata| metadata.is_span()))))
        .with(
            fmt::layer()
                .with_target(false)
                .with_timer(fmt::time::uptime())
                .with_filter(env_filter),
        )
        .with(tracing_error::ErrorLayer::default());
    let default_guard = tracing::subscriber::set_default(subscriber);

    if let Some((path, err)) = chrome_error {
        tracing::warn!("chrome trace disabled, cannot create {}: {err}", path.display());
    }

    TelemetryGuard {
        _default_guard: default_guard,
        chrome_guard,
    }
}

/// Spawn a thread that inherits the current tracing dispatcher.
pub fn spawn_thread<F, T>(name: impl Into<String>, f: F) -> io::Result<thread::JoinHandle<T>>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    let dispatch = tracing::dispatcher::get_default(|current| current.clone());
    thread::Builder::new()
        .name(name.into())
        .spawn(move || tracing::dispatcher::with_default(&dispatch, f))
}

fn chrome_trace(path: &Path) -> io::Result<(ChromeLayer<Registry>, FlushGuard)> {
    let file = fs::File::create(path)?;
    // Reconnect, watchdog and health loops each own a thread, so one track per thread.
    Ok(ChromeLayerBuilder::new()
        .writer(file)
        .include_args(true)
        .trace_style(TraceStyle::Threaded)
        .build())
}

/// Replace `path` with `contents` without exposing a half-written file to the collector.
fn write_textfile(path: &Path, contents: &str) -> io::Result<()> {
    let tmp_path: PathBuf = path.with_extension("prom.tmp");
    fs::write(&tmp_path, contents)?;
    fs::rename(tmp_path, path)
}

impl Drop for TelemetryGuard {
    fn drop(&mut self) {
        if let Some(guard) = self.chrome_guard.take() {
            guard.flush();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use super::*;

    fn scratch_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("sentinel-{name}-{}", std::process::id()));
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn textfile_write_replaces_previous_contents() {
        let dir = scratch_dir("metrics");
        let path = dir.join("stream.prom");

        write_textfile(&path, "stream_connected 0\n").unwrap();
        write_textfile(&path, "stream_connected 1\n").unwrap();

        assert_eq!(fs::read_to_string(&path).unwrap(), "stream_connected 1\n");
        assert!(!path.with_extension("prom.tmp").exists());
        fs::remove_dir_all(dir).unwrap();
    }

    #[test]
    fn chrome_trace_records_spans_from_worker_threads() {
        let dir = scratch_dir("chrome");
        let path = dir.join("trace.json");
        let guard = enter_runtime(&TelemetryOptions {
            chrome_trace_path: Some(path.clone()),
            ..TelemetryOptions::default()
        });

        tracing::info_span!("health.tick").in_scope(|| tracing::info!("tick"));
        spawn_thread("stream-watchdog", || {
            let _tick = tracing::debug_span!("stream.watchdog_tick").entered();
        })
        .unwrap()
        .join()
        .unwrap();
        drop(guard);

        let trace = fs::read_to_string(&path).unwrap();
        assert!(trace.contains("health.tick"));
        assert!(trace.contains("stream.watchdog_tick"));
        fs::remove_dir_all(dir).unwrap();
    }

    #[test]
    fn unwritable_chrome_path_still_installs_console_logging() {
        let guard = enter_runtime(&TelemetryOptions {
            chrome_trace_path: Some(PathBuf::from("/nonexistent-dir/trace.json")),
            ..TelemetryOptions::default()
        });
        assert!(guard.chrome_guard.is_none());
        tracing::info!("console logging still works");
    }

    #[test]
    fn spawned_threads_carry_their_name() {
        let seen = Arc::new(Mutex::new(None));
        let sink = Arc::clone(&seen);
        spawn_thread("stream-reconnect", move || {
            *sink.lock().unwrap() = thread::current().name().map(str::to_owned);
        })
        .unwrap()
        .join()
        .unwrap();
        assert_eq!(seen.lock().unwrap().as_deref(), Some("stream-reconnect"));
    }
}
