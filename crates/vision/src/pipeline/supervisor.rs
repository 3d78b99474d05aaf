//! Long-lived owner of the stream subsystem and its daemon loops.

use std::{
    io,
    sync::{Arc, Mutex},
    thread,
    time::{Duration, Instant},
};

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, bounded};
use stream_ingest::StreamTransport;
use tracing::{debug, info, warn};

use crate::pipeline::{
    capture::CaptureFacade,
    config::StreamConfig,
    connection::{ConnectionManager, DisconnectReason},
    frame_store::FrameStore,
    telemetry,
    watchdog::spawn_watchdog,
};

/// Wakes every [`ShutdownListener`] once triggered or dropped.
pub struct ShutdownTrigger {
    tx: Mutex<Option<Sender<()>>>,
}

impl ShutdownTrigger {
    pub fn trigger(&self) {
        if let Ok(mut tx) = self.tx.lock() {
            tx.take();
        }
    }
}

#[derive(Clone)]
pub struct ShutdownListener {
    rx: Receiver<()>,
}

impl ShutdownListener {
    /// Sleep for up to `timeout`; returns `true` once shutdown was requested.
    pub fn wait(&self, timeout: Duration) -> bool {
        !matches!(self.rx.recv_timeout(timeout), Err(RecvTimeoutError::Timeout))
    }

    pub fn is_triggered(&self) -> bool {
        self.wait(Duration::ZERO)
    }
}

pub fn shutdown_channel() -> (ShutdownTrigger, ShutdownListener) {
    let (tx, rx) = bounded(0);
    (
        ShutdownTrigger {
            tx: Mutex::new(Some(tx)),
        },
        ShutdownListener { rx },
    )
}

/// The only place that reconnects opportunistically after startup.
pub struct ReconnectLoop {
    manager: Arc<ConnectionManager>,
}

impl ReconnectLoop {
    pub fn new(manager: Arc<ConnectionManager>) -> Self {
        Self { manager }
    }

    /// Attempt a connect when disconnected and due. Returns the attempt result, if any.
    pub fn tick(&self, now: Instant) -> Option<bool> {
        if self.manager.is_connected() || !self.manager.reconnect_due(now) {
            return None;
        }
        debug!("reconnect loop attempting stream connect");
        Some(self.manager.connect_at(now))
    }
}

fn spawn_reconnect_loop(
    manager: Arc<ConnectionManager>,
    shutdown: ShutdownListener,
) -> io::Result<thread::JoinHandle<()>> {
    let tick = manager.config().reconnect_tick;
    let reconnect = ReconnectLoop::new(manager);
    telemetry::spawn_thread("stream-reconnect", move || {
        while !shutdown.wait(tick) {
            reconnect.tick(Instant::now());
        }
    })
}

fn silence_since(frames: &FrameStore, started_at: Instant, now: Instant) -> Duration {
    now.saturating_duration_since(frames.last_arrival().unwrap_or(started_at))
}

/// Owns connection state and frame store, and hands shared handles to each loop.
pub struct StreamSupervisor {
    manager: Arc<ConnectionManager>,
    started_at: Instant,
    trigger: ShutdownTrigger,
    listener: ShutdownListener,
    threads: Vec<thread::JoinHandle<()>>,
}

impl StreamSupervisor {
    pub fn new(config: StreamConfig, transport: Arc<dyn StreamTransport>) -> Self {
        let frames = Arc::new(FrameStore::new());
        let manager = Arc::new(ConnectionManager::new(config, transport, frames));
        let (trigger, listener) = shutdown_channel();
        Self {
            manager,
            started_at: Instant::now(),
            trigger,
            listener,
            threads: Vec::new(),
        }
    }

    pub fn manager(&self) -> &Arc<ConnectionManager> {
        &self.manager
    }

    pub fn capture(&self) -> CaptureFacade {
        CaptureFacade::new(Arc::clone(&self.manager))
    }

    /// A listener tied to this supervisor's shutdown, for sibling loops.
    pub fn shutdown_listener(&self) -> ShutdownListener {
        self.listener.clone()
    }

    /// Time since the last frame arrived, or since start if none ever did.
    pub fn silence(&self, now: Instant) -> Duration {
        silence_since(self.manager.frames(), self.started_at, now)
    }

    /// [`silence`](Self::silence) as a shareable probe for other loops.
    pub fn silence_probe(&self) -> Arc<dyn Fn(Instant) -> Duration + Send + Sync> {
        let frames = Arc::clone(self.manager.frames());
        let started_at = self.started_at;
        Arc::new(move |now| silence_since(&frames, started_at, now))
    }

    /// Try one connect inline, then start the reconnect loop and watchdog.
    pub fn start(&mut self) -> io::Result<()> {
        if !self.manager.connect() {
            warn!("initial stream connect failed; reconnect loop will keep trying");
        }
        self.threads.push(spawn_reconnect_loop(
            Arc::clone(&self.manager),
            self.listener.clone(),
        )?);
        self.threads
            .push(spawn_watchdog(Arc::clone(&self.manager), self.listener.clone())?);
        info!("stream supervisor started");
        Ok(())
    }

    /// Stop the loops and close the session.
    pub fn shutdown(mut self) {
        self.trigger.trigger();
        for handle in self.threads.drain(..) {
            if handle.join().is_err() {
                warn!("stream loop panicked during shutdown");
            }
        }
        if self.manager.is_connected() {
            self.manager.force_disconnect(
                self.manager.generation(),
                Instant::now(),
                DisconnectReason::Shutdown,
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::connection::testing::{ScriptedTransport, Step, config};

    #[test]
    fn listeners_wake_on_trigger() {
        let (trigger, listener) = shutdown_channel();
        let other = listener.clone();
        assert!(!listener.wait(Duration::from_millis(5)));
        trigger.trigger();
        assert!(listener.wait(Duration::from_secs(5)));
        assert!(other.is_triggered());
    }

    #[test]
    fn reconnect_tick_respects_interval_and_connection() {
        let transport = ScriptedTransport::new([Step::Refuse, Step::Accept]);
        let manager = Arc::new(ConnectionManager::new(
            config(&["runner"]),
            Arc::clone(&transport) as _,
            Arc::new(FrameStore::new()),
        ));
        let reconnect = ReconnectLoop::new(Arc::clone(&manager));
        let t0 = Instant::now();

        assert_eq!(reconnect.tick(t0), Some(false));
        assert_eq!(reconnect.tick(t0 + Duration::from_secs(1)), None);
        assert_eq!(reconnect.tick(t0 + Duration::from_secs(5)), Some(true));
        assert_eq!(reconnect.tick(t0 + Duration::from_secs(20)), None);
        assert_eq!(transport.opened.lock().unwrap().len(), 2);
    }

    #[test]
    fn silence_counts_from_start_until_first_frame() {
        let transport = ScriptedTransport::new([]);
        let supervisor = StreamSupervisor::new(config(&["runner"]), transport);
        let start = supervisor.started_at;
        assert_eq!(
            supervisor.silence(start + Duration::from_secs(7)),
            Duration::from_secs(7)
        );

        let frames = Arc::clone(supervisor.manager().frames());
        frames.publish(image::RgbImage::new(1, 1), start + Duration::from_secs(10));
        frames.clear();
        assert_eq!(
            supervisor.silence(start + Duration::from_secs(12)),
            Duration::from_secs(2)
        );
        let probe = supervisor.silence_probe();
        assert_eq!(probe(start + Duration::from_secs(15)), Duration::from_secs(5));
    }
}
