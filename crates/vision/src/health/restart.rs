//! Restarting the producer's service through whichever control channel answers.
//!
//! Channels are tried in order: the local control socket, the network control
//! API on a short list of addresses, then the command-line tool. The chain
//! stops at the first restart that succeeds.

use std::{
    io::{self, BufRead, BufReader, Read, Write},
    path::PathBuf,
    process::{Command, Stdio},
    thread,
    time::{Duration, Instant},
};

use anyhow::Context;
use thiserror::Error;
use tracing::{debug, debug_span, info, info_span, warn};

use crate::pipeline::config::RestartConfig;

/// Seconds the control API waits for the service to stop before killing it.
const STOP_GRACE_SECS: u32 = 10;

#[derive(Debug, Error)]
pub enum ControlError {
    #[error("control socket {} not present", path.display())]
    SocketMissing { path: PathBuf },
    #[error("i/o error talking to {target}")]
    Io {
        target: String,
        #[source]
        source: io::Error,
    },
    #[error("http error talking to {target}")]
    Http {
        target: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("malformed response from {target}: {detail}")]
    Malformed { target: String, detail: String },
    #[error("`{command}` failed: {detail}")]
    Command { command: String, detail: String },
    #[error("`{command}` did not finish within {timeout:?}")]
    CommandTimeout { command: String, timeout: Duration },
    #[error("no address of {tier} accepted the restart")]
    Exhausted { tier: &'static str },
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum RestartOutcome {
    Restarted,
    /// The channel does not know the service.
    NotFound,
    /// Any other HTTP status.
    Rejected(u16),
}

impl RestartOutcome {
    fn from_status(status: u16) -> Self {
        match status {
            200 | 204 => RestartOutcome::Restarted,
            404 => RestartOutcome::NotFound,
            other => RestartOutcome::Rejected(other),
        }
    }
}

/// One way of asking the host to restart a service.
pub trait ControlChannel: Send + Sync {
    /// Short label for logs and metrics.
    fn tier(&self) -> &'static str;

    fn restart(&self, service: &str) -> Result<RestartOutcome, ControlError>;
}

fn restart_path(service: &str) -> String {
    format!("/containers/{service}/restart?t={STOP_GRACE_SECS}")
}

/// Status code from the first line of an HTTP/1.x response.
fn read_status(reader: impl Read, target: &str) -> Result<u16, ControlError> {
    let mut line = String::new();
    BufReader::new(reader)
        .read_line(&mut line)
        .map_err(|source| ControlError::Io {
            target: target.to_string(),
            source,
        })?;
    let malformed = || ControlError::Malformed {
        target: target.to_string(),
        detail: format!("status line {:?}", line.trim_end()),
    };
    let mut parts = line.split_whitespace();
    match parts.next() {
        Some(version) if version.starts_with("HTTP/1.") => {}
        _ => return Err(malformed()),
    }
    parts
        .next()
        .and_then(|code| code.parse::<u16>().ok())
        .ok_or_else(malformed)
}

/// Control API reached through a local Unix socket.
pub struct UnixSocketControl {
    path: PathBuf,
    timeout: Duration,
}

impl UnixSocketControl {
    pub fn new(path: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            path: path.into(),
            timeout,
        }
    }
}

impl ControlChannel for UnixSocketControl {
    fn tier(&self) -> &'static str {
        "socket"
    }

    #[cfg(unix)]
    fn restart(&self, service: &str) -> Result<RestartOutcome, ControlError> {
        use std::os::unix::net::UnixStream;

        if !self.path.exists() {
            return Err(ControlError::SocketMissing {
                path: self.path.clone(),
            });
        }
        let target = self.path.display().to_string();
        let io_err = |source| ControlError::Io {
            target: target.clone(),
            source,
        };

        let mut stream = UnixStream::connect(&self.path).map_err(io_err)?;
        stream.set_read_timeout(Some(self.timeout)).map_err(io_err)?;
        stream.set_write_timeout(Some(self.timeout)).map_err(io_err)?;
        let request = format!(
            "POST {} HTTP/1.1\r\nHost: localhost\r\nContent-Length: 0\r\nConnection: close\r\n\r\n",
            restart_path(service)
        );
        stream.write_all(request.as_bytes()).map_err(io_err)?;
        let status = read_status(&stream, &target)?;
        Ok(RestartOutcome::from_status(status))
    }

    #[cfg(not(unix))]
    fn restart(&self, _service: &str) -> Result<RestartOutcome, ControlError> {
        Err(ControlError::SocketMissing {
            path: self.path.clone(),
        })
    }
}

/// Control API reached over TCP, tried across a fixed address list.
pub struct HttpControl {
    client: reqwest::blocking::Client,
    addresses: Vec<(String, u16)>,
}

impl HttpControl {
    pub fn new(addresses: Vec<(String, u16)>, timeout: Duration) -> anyhow::Result<Self> {
        let client = reqwest::blocking::Client::builder()
            .timeout(timeout)
            .connect_timeout(timeout)
            .build()
            .context("failed to build control API client")?;
        Ok(Self { client, addresses })
    }
}

impl ControlChannel for HttpControl {
    fn tier(&self) -> &'static str {
        "network"
    }

    fn restart(&self, service: &str) -> Result<RestartOutcome, ControlError> {
        let mut last = Err(ControlError::Exhausted { tier: self.tier() });
        for (host, port) in &self.addresses {
            let target = format!("{host}:{port}");
            let url = format!("http://{target}{}", restart_path(service));
            match self.client.post(&url).send() {
                Ok(response) => match RestartOutcome::from_status(response.status().as_u16()) {
                    RestartOutcome::Restarted => return Ok(RestartOutcome::Restarted),
                    // The API is there and says the service is not; other addresses won't differ.
                    RestartOutcome::NotFound => return Ok(RestartOutcome::NotFound),
                    rejected => {
                        debug!(%target, ?rejected, "control API refused restart");
                        last = Ok(rejected);
                    }
                },
                Err(source) => {
                    debug!(%target, "control API unreachable: {source}");
                    last = Err(ControlError::Http { target, source });
                }
            }
        }
        last
    }
}

/// The control command-line tool, e.g. `docker restart <service>`.
pub struct CommandControl {
    program: String,
    timeout: Duration,
}

impl CommandControl {
    pub fn new(program: impl Into<String>, timeout: Duration) -> Self {
        Self {
            program: program.into(),
            timeout,
        }
    }
}

impl ControlChannel for CommandControl {
    fn tier(&self) -> &'static str {
        "command"
    }

    fn restart(&self, service: &str) -> Result<RestartOutcome, ControlError> {
        let command = format!("{} restart {service}", self.program);
        let mut child = Command::new(&self.program)
            .args(["restart", service])
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|err| ControlError::Command {
                command: command.clone(),
                detail: err.to_string(),
            })?;

        let deadline = Instant::now() + self.timeout;
        loop {
            match child.try_wait() {
                Ok(Some(status)) if status.success() => return Ok(RestartOutcome::Restarted),
                Ok(Some(status)) => {
                    return Err(ControlError::Command {
                        command,
                        detail: status.to_string(),
                    });
                }
                Ok(None) if Instant::now() >= deadline => {
                    let _ = child.kill();
                    let _ = child.wait();
                    return Err(ControlError::CommandTimeout {
                        command,
                        timeout: self.timeout,
                    });
                }
                Ok(None) => thread::sleep(Duration::from_millis(100)),
                Err(err) => {
                    return Err(ControlError::Command {
                        command,
                        detail: err.to_string(),
                    });
                }
            }
        }
    }
}

/// Ordered control channels for one named service.
pub struct RestartChain {
    service: String,
    channels: Vec<Box<dyn ControlChannel>>,
}

impl RestartChain {
    pub fn new(service: impl Into<String>, channels: Vec<Box<dyn ControlChannel>>) -> Self {
        Self {
            service: service.into(),
            channels,
        }
    }

    pub fn from_config(config: &RestartConfig) -> anyhow::Result<Self> {
        let channels: Vec<Box<dyn ControlChannel>> = vec![
            Box::new(UnixSocketControl::new(&config.control_socket, config.timeout)),
            Box::new(HttpControl::new(
                config.control_endpoints.clone(),
                config.timeout,
            )?),
            Box::new(CommandControl::new(&config.control_command, config.timeout)),
        ];
        Ok(Self::new(&config.service_name, channels))
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    /// Restart the service through the first channel that manages it. Never fails past here.
    pub fn restart(&self) -> bool {
        let _restart = info_span!("health.service_restart", service = %self.service).entered();
        info!("restarting dependent service");
        for channel in &self.channels {
            let attempt = debug_span!("restart_channel", tier = channel.tier());
            match attempt.in_scope(|| channel.restart(&self.service)) {
                Ok(RestartOutcome::Restarted) => {
                    metrics::counter!("health_service_restarts_total", "outcome" => "restarted")
                        .increment(1);
                    info!(service = %self.service, tier = channel.tier(), "service restarted");
                    return true;
                }
                Ok(RestartOutcome::NotFound) => {
                    warn!(service = %self.service, tier = channel.tier(), "service not found");
                }
                Ok(RestartOutcome::Rejected(status)) => {
                    warn!(service = %self.service, tier = channel.tier(), status, "restart refused");
                }
                Err(err) => {
                    warn!(service = %self.service, tier = channel.tier(), "restart failed: {err}");
                }
            }
        }
        metrics::counter!("health_service_restarts_total", "outcome" => "failed").increment(1);
        warn!(service = %self.service, "every restart channel failed");
        false
    }
}

#[cfg(test)]
mod tests {
    use std::{
        net::TcpListener,
        sync::{
            Arc, Mutex,
            atomic::{AtomicUsize, Ordering},
        },
    };

    use super::*;

    /// Read a request head from `stream` and answer with `status`, returning the head.
    fn respond(mut stream: impl Read + Write, status: &str) -> String {
        let mut head = Vec::new();
        let mut byte = [0u8; 1];
        while !head.ends_with(b"\r\n\r\n") {
            match stream.read(&mut byte) {
                Ok(0) | Err(_) => break,
                Ok(_) => head.push(byte[0]),
            }
        }
        let response = format!("HTTP/1.1 {status}\r\nContent-Length: 0\r\nConnection: close\r\n\r\n");
        let _ = stream.write_all(response.as_bytes());
        String::from_utf8_lossy(&head).into_owned()
    }

    fn http_responder(status: &'static str) -> (u16, Arc<AtomicUsize>) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&hits);
        thread::spawn(move || {
            for stream in listener.incoming().flatten() {
                counter.fetch_add(1, Ordering::SeqCst);
                respond(stream, status);
            }
        });
        (port, hits)
    }

    fn closed_port() -> u16 {
        TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port()
    }

    #[test]
    fn status_line_parsing() {
        assert_eq!(read_status(&b"HTTP/1.1 204 No Content\r\n"[..], "t").unwrap(), 204);
        assert_eq!(read_status(&b"HTTP/1.0 404 Not Found\r\n"[..], "t").unwrap(), 404);
        assert!(matches!(
            read_status(&b"SSH-2.0-OpenSSH\r\n"[..], "t"),
            Err(ControlError::Malformed { .. })
        ));
    }

    #[cfg(unix)]
    #[test]
    fn unix_socket_restart_posts_to_container_endpoint() {
        use std::os::unix::net::UnixListener;

        let dir = std::env::temp_dir().join(format!("sentinel-ctl-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("control.sock");
        let _ = std::fs::remove_file(&path);
        let listener = UnixListener::bind(&path).unwrap();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let heads = Arc::clone(&seen);
        thread::spawn(move || {
            for (stream, status) in listener.incoming().flatten().zip(["204 No Content", "404 Not Found"]) {
                heads.lock().unwrap().push(respond(stream, status));
            }
        });

        let control = UnixSocketControl::new(&path, Duration::from_secs(5));
        assert_eq!(control.restart("runner").unwrap(), RestartOutcome::Restarted);
        assert_eq!(control.restart("runner").unwrap(), RestartOutcome::NotFound);
        assert!(seen.lock().unwrap()[0].starts_with("POST /containers/runner/restart?t=10 HTTP/1.1"));
        std::fs::remove_dir_all(dir).unwrap();
    }

    #[test]
    fn missing_socket_is_reported() {
        let control = UnixSocketControl::new("/nonexistent/control.sock", Duration::from_secs(1));
        assert!(matches!(
            control.restart("runner"),
            Err(ControlError::SocketMissing { .. })
        ));
    }

    #[test]
    fn network_tier_fails_over_unreachable_addresses() {
        let (port, hits) = http_responder("204 No Content");
        let control = HttpControl::new(
            vec![("127.0.0.1".into(), closed_port()), ("127.0.0.1".into(), port)],
            Duration::from_secs(5),
        )
        .unwrap();
        assert_eq!(control.restart("runner").unwrap(), RestartOutcome::Restarted);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn not_found_short_circuits_network_tier() {
        let (missing, _) = http_responder("404 Not Found");
        let (healthy, hits) = http_responder("204 No Content");
        let control = HttpControl::new(
            vec![("127.0.0.1".into(), missing), ("127.0.0.1".into(), healthy)],
            Duration::from_secs(5),
        )
        .unwrap();
        assert_eq!(control.restart("runner").unwrap(), RestartOutcome::NotFound);
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[cfg(unix)]
    #[test]
    fn command_tier_maps_exit_status() {
        let ok = CommandControl::new("true", Duration::from_secs(5));
        assert_eq!(ok.restart("runner").unwrap(), RestartOutcome::Restarted);
        let failing = CommandControl::new("false", Duration::from_secs(5));
        assert!(matches!(failing.restart("runner"), Err(ControlError::Command { .. })));
        let missing = CommandControl::new("/nonexistent/docker", Duration::from_secs(5));
        assert!(matches!(missing.restart("runner"), Err(ControlError::Command { .. })));
    }

    struct Scripted {
        result: fn() -> Result<RestartOutcome, ControlError>,
        calls: Arc<AtomicUsize>,
    }

    impl ControlChannel for Scripted {
        fn tier(&self) -> &'static str {
            "scripted"
        }

        fn restart(&self, _service: &str) -> Result<RestartOutcome, ControlError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            (self.result)()
        }
    }

    fn scripted(
        result: fn() -> Result<RestartOutcome, ControlError>,
    ) -> (Box<dyn ControlChannel>, Arc<AtomicUsize>) {
        let calls = Arc::new(AtomicUsize::new(0));
        (
            Box::new(Scripted {
                result,
                calls: Arc::clone(&calls),
            }),
            calls,
        )
    }

    #[test]
    fn chain_stops_at_first_success() {
        let (socket, socket_calls) = scripted(|| Err(ControlError::SocketMissing { path: "/x".into() }));
        let (network, network_calls) = scripted(|| Ok(RestartOutcome::Restarted));
        let (command, command_calls) = scripted(|| Ok(RestartOutcome::Restarted));
        let chain = RestartChain::new("runner", vec![socket, network, command]);

        assert!(chain.restart());
        assert_eq!(socket_calls.load(Ordering::SeqCst), 1);
        assert_eq!(network_calls.load(Ordering::SeqCst), 1);
        assert_eq!(command_calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn chain_reports_failure_when_every_channel_fails() {
        let (socket, _) = scripted(|| Ok(RestartOutcome::NotFound));
        let (network, _) = scripted(|| Ok(RestartOutcome::Rejected(500)));
        let (command, command_calls) = scripted(|| {
            Err(ControlError::CommandTimeout {
                command: "docker restart runner".into(),
                timeout: Duration::from_secs(1),
            })
        });
        let chain = RestartChain::new("runner", vec![socket, network, command]);
        assert!(!chain.restart());
        assert_eq!(command_calls.load(Ordering::SeqCst), 1);
    }
}
