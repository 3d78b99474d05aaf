//! Socket.IO client speaking Engine.IO v4 over HTTP long-polling.
//!
//! Only what the producer needs is implemented: the open handshake, the
//! default namespace, inbound (binary) events, ping/pong and close. The
//! polling transport keeps every exchange a plain bounded HTTP request.

use std::{
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, Ordering},
    },
    thread,
    time::{Duration, Instant},
};

use base64::{Engine as _, engine::general_purpose::STANDARD};
use crossbeam_channel::{Sender, bounded};
use reqwest::{
    StatusCode,
    blocking::{Client, Response},
    header::CONTENT_TYPE,
};
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, trace, warn};

use crate::{
    transport::{EventSink, SessionEvent, StreamSession, StreamTransport},
    types::{Endpoint, Payload, StreamError, StreamEvent},
};

const RECORD_SEPARATOR: char = '\x1e';
const CLOSE_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, PartialEq, Eq)]
enum EnginePacket<'a> {
    Open(&'a str),
    Close,
    Ping,
    Pong,
    Message(&'a str),
    Binary(&'a str),
    Noop,
    Unknown,
}

fn parse_engine(packet: &str) -> EnginePacket<'_> {
    if let Some(body) = packet.strip_prefix('b') {
        return EnginePacket::Binary(body);
    }
    let Some(kind) = packet.chars().next() else {
        return EnginePacket::Unknown;
    };
    let rest = &packet[kind.len_utf8()..];
    match kind {
        '0' => EnginePacket::Open(rest),
        '1' => EnginePacket::Close,
        '2' => EnginePacket::Ping,
        '3' => EnginePacket::Pong,
        '4' => EnginePacket::Message(rest),
        '6' => EnginePacket::Noop,
        _ => EnginePacket::Unknown,
    }
}

fn split_packets(body: &str) -> impl Iterator<Item = &str> {
    body.split(RECORD_SEPARATOR).filter(|packet| !packet.is_empty())
}

#[derive(Debug, PartialEq)]
enum SocketPacket {
    Connect,
    Disconnect,
    Event {
        name: String,
        args: Vec<Value>,
    },
    BinaryEvent {
        name: String,
        args: Vec<Value>,
        attachments: usize,
    },
    ConnectError(String),
    Other,
}

/// Skip an optional `/namespace,` prefix and ack id, leaving the JSON body.
fn packet_body(rest: &str) -> &str {
    let rest = if rest.starts_with('/') {
        rest.split_once(',').map(|(_, body)| body).unwrap_or("")
    } else {
        rest
    };
    rest.trim_start_matches(|c: char| c.is_ascii_digit())
}

fn parse_event_body(body: &str) -> Option<(String, Vec<Value>)> {
    let Ok(Value::Array(mut items)) = serde_json::from_str::<Value>(body) else {
        return None;
    };
    if items.is_empty() {
        return None;
    }
    let name = match items.remove(0) {
        Value::String(name) => name,
        _ => return None,
    };
    Some((name, items))
}

fn parse_socket(message: &str) -> SocketPacket {
    let Some(kind) = message.chars().next() else {
        return SocketPacket::Other;
    };
    let rest = &message[kind.len_utf8()..];
    match kind {
        '0' => SocketPacket::Connect,
        '1' => SocketPacket::Disconnect,
        '2' => match parse_event_body(packet_body(rest)) {
            Some((name, args)) => SocketPacket::Event { name, args },
            None => SocketPacket::Other,
        },
        '4' => SocketPacket::ConnectError(rest.to_string()),
        '5' => {
            let Some((count, body)) = rest.split_once('-') else {
                return SocketPacket::Other;
            };
            let Ok(attachments) = count.parse::<usize>() else {
                return SocketPacket::Other;
            };
            match parse_event_body(packet_body(body)) {
                Some((name, args)) => SocketPacket::BinaryEvent {
                    name,
                    args,
                    attachments,
                },
                None => SocketPacket::Other,
            }
        }
        _ => SocketPacket::Other,
    }
}

fn is_placeholder(value: &Value) -> bool {
    value
        .get("_placeholder")
        .and_then(Value::as_bool)
        .unwrap_or(false)
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct Handshake {
    sid: String,
    ping_interval: u64,
    ping_timeout: u64,
}

fn parse_handshake(body: &str, endpoint: &Endpoint) -> Result<Handshake, StreamError> {
    let protocol = |detail: String| StreamError::Protocol {
        endpoint: endpoint.to_string(),
        detail,
    };
    match split_packets(body).next().map(parse_engine) {
        Some(EnginePacket::Open(json)) => serde_json::from_str(json)
            .map_err(|err| protocol(format!("malformed open packet: {err}"))),
        _ => Err(protocol(format!(
            "expected open packet, got {:?}",
            truncate(body)
        ))),
    }
}

fn truncate(text: &str) -> &str {
    let end = text
        .char_indices()
        .nth(80)
        .map(|(idx, _)| idx)
        .unwrap_or(text.len());
    &text[..end]
}

fn remaining(
    deadline: Instant,
    timeout: Duration,
    what: &'static str,
) -> Result<Duration, StreamError> {
    let left = deadline.saturating_duration_since(Instant::now());
    if left.is_zero() {
        Err(StreamError::Timeout(timeout, what))
    } else {
        Ok(left)
    }
}

/// Opens Socket.IO sessions over Engine.IO long-polling.
#[derive(Clone)]
pub struct PollingTransport {
    client: Client,
}

impl PollingTransport {
    pub fn new() -> anyhow::Result<Self> {
        Ok(Self {
            // The producer sits on the local network or the container bridge.
            client: Client::builder().no_proxy().build()?,
        })
    }
}

impl StreamTransport for PollingTransport {
    fn open(
        &self,
        endpoint: &Endpoint,
        sink: EventSink,
        timeout: Duration,
    ) -> Result<Box<dyn StreamSession>, StreamError> {
        let deadline = Instant::now() + timeout;
        let open_url = format!("{}/socket.io/?EIO=4&transport=polling", endpoint.base_url());

        let response = self
            .client
            .get(&open_url)
            .timeout(remaining(deadline, timeout, "handshake")?)
            .send()
            .map_err(|source| StreamError::Http {
                endpoint: endpoint.to_string(),
                source,
            })?;
        let body = read_body(response, endpoint)?;
        let handshake = parse_handshake(&body, endpoint)?;
        debug!(%endpoint, sid = %handshake.sid, "engine.io handshake complete");

        let shared = Arc::new(Shared {
            client: self.client.clone(),
            url: format!("{open_url}&sid={}", handshake.sid),
            endpoint: endpoint.clone(),
            poll_timeout: Duration::from_millis(handshake.ping_interval + handshake.ping_timeout),
            alive: AtomicBool::new(false),
            closing: AtomicBool::new(false),
            pending_binary: Mutex::new(None),
        });

        // From here on the producer holds a session for us; every failure must close it.
        let connected = remaining(deadline, timeout, "namespace connect")
            .and_then(|budget| shared.post("40", budget));
        if let Err(err) = connected {
            shared.close();
            return Err(err);
        }

        let (ack_tx, ack_rx) = bounded::<Result<(), StreamError>>(1);
        let poller = shared.clone();
        let dispatch = tracing::dispatcher::get_default(|current| current.clone());
        let spawned = thread::Builder::new()
            .name("socketio-poll".into())
            .spawn(move || {
                tracing::dispatcher::with_default(&dispatch, || poller.poll_loop(sink, ack_tx))
            });
        if let Err(err) = spawned {
            shared.close();
            return Err(StreamError::Protocol {
                endpoint: endpoint.to_string(),
                detail: format!("failed to spawn poll thread: {err}"),
            });
        }

        let wait = deadline.saturating_duration_since(Instant::now());
        match ack_rx.recv_timeout(wait) {
            Ok(Ok(())) => Ok(Box::new(PollingSession { shared })),
            Ok(Err(err)) => {
                shared.close();
                Err(err)
            }
            Err(_) => {
                shared.close();
                Err(StreamError::Timeout(timeout, "namespace connect"))
            }
        }
    }
}

fn read_body(response: Response, endpoint: &Endpoint) -> Result<String, StreamError> {
    let status = response.status();
    let body = response.text().map_err(|source| StreamError::Http {
        endpoint: endpoint.to_string(),
        source,
    })?;
    if status == StatusCode::BAD_REQUEST && body.contains("Session ID unknown") {
        return Err(StreamError::Desync {
            endpoint: endpoint.to_string(),
            detail: "producer does not know this session id".into(),
        });
    }
    if !status.is_success() {
        return Err(StreamError::Protocol {
            endpoint: endpoint.to_string(),
            detail: format!("HTTP {status}: {}", truncate(&body)),
        });
    }
    Ok(body)
}

struct PendingBinary {
    name: String,
    payloads: Vec<Payload>,
    remaining: usize,
}

struct Shared {
    client: Client,
    url: String,
    endpoint: Endpoint,
    poll_timeout: Duration,
    alive: AtomicBool,
    closing: AtomicBool,
    pending_binary: Mutex<Option<PendingBinary>>,
}

impl Shared {
    fn post(&self, body: &str, timeout: Duration) -> Result<(), StreamError> {
        let response = self
            .client
            .post(&self.url)
            .header(CONTENT_TYPE, "text/plain;charset=UTF-8")
            .body(body.to_string())
            .timeout(timeout)
            .send()
            .map_err(|source| StreamError::Http {
                endpoint: self.endpoint.to_string(),
                source,
            })?;
        read_body(response, &self.endpoint).map(|_| ())
    }

    fn poll(&self) -> Result<String, StreamError> {
        let response = self
            .client
            .get(&self.url)
            .timeout(self.poll_timeout)
            .send()
            .map_err(|source| StreamError::Http {
                endpoint: self.endpoint.to_string(),
                source,
            })?;
        read_body(response, &self.endpoint)
    }

    fn close(&self) {
        if self.closing.swap(true, Ordering::SeqCst) {
            return;
        }
        self.alive.store(false, Ordering::SeqCst);
        for packet in ["41", "1"] {
            if let Err(err) = self.post(packet, CLOSE_TIMEOUT) {
                debug!(endpoint = %self.endpoint, "close packet {packet} not delivered: {err}");
            }
        }
    }

    fn poll_loop(&self, sink: EventSink, ack_tx: Sender<Result<(), StreamError>>) {
        let mut acked = false;
        while !self.closing.load(Ordering::SeqCst) {
            let body = match self.poll() {
                Ok(body) => body,
                Err(err) => {
                    if !acked {
                        let _ = ack_tx.try_send(Err(err));
                    } else if !self.closing.load(Ordering::SeqCst) {
                        warn!(endpoint = %self.endpoint, "stream poll failed: {err}");
                    }
                    break;
                }
            };

            let mut open = true;
            for packet in split_packets(&body) {
                if self.closing.load(Ordering::SeqCst) {
                    break;
                }
                match parse_engine(packet) {
                    EnginePacket::Ping => {
                        if let Err(err) = self.post("3", CLOSE_TIMEOUT) {
                            debug!(endpoint = %self.endpoint, "pong failed: {err}");
                        }
                    }
                    EnginePacket::Close => open = false,
                    EnginePacket::Message(message) => match parse_socket(message) {
                        SocketPacket::Connect => {
                            if !acked {
                                acked = true;
                                self.alive.store(true, Ordering::SeqCst);
                                let _ = ack_tx.try_send(Ok(()));
                            }
                        }
                        SocketPacket::ConnectError(detail) => {
                            let _ = ack_tx.try_send(Err(StreamError::Rejected {
                                endpoint: self.endpoint.to_string(),
                                detail,
                            }));
                            open = false;
                        }
                        SocketPacket::Disconnect => open = false,
                        SocketPacket::Event { name, args } => {
                            let payloads = args.into_iter().map(Payload::Json).collect();
                            sink(SessionEvent::Message(StreamEvent { name, payloads }));
                        }
                        SocketPacket::BinaryEvent {
                            name,
                            args,
                            attachments,
                        } => {
                            let payloads: Vec<Payload> = args
                                .into_iter()
                                .filter(|arg| !is_placeholder(arg))
                                .map(Payload::Json)
                                .collect();
                            if attachments == 0 {
                                sink(SessionEvent::Message(StreamEvent { name, payloads }));
                            } else if let Ok(mut pending) = self.pending_binary.lock() {
                                *pending = Some(PendingBinary {
                                    name,
                                    payloads,
                                    remaining: attachments,
                                });
                            }
                        }
                        SocketPacket::Other => trace!("ignoring socket.io packet {message:?}"),
                    },
                    EnginePacket::Binary(encoded) => self.attach_binary(encoded, &sink),
                    EnginePacket::Open(_)
                    | EnginePacket::Pong
                    | EnginePacket::Noop
                    | EnginePacket::Unknown => {}
                }
            }
            if !open {
                break;
            }
        }

        let was_alive = self.alive.swap(false, Ordering::SeqCst);
        if was_alive && !self.closing.load(Ordering::SeqCst) {
            debug!(endpoint = %self.endpoint, "stream session closed by transport");
            sink(SessionEvent::Closed);
        }
    }

    fn attach_binary(&self, encoded: &str, sink: &EventSink) {
        let bytes = match STANDARD.decode(encoded) {
            Ok(bytes) => bytes,
            Err(err) => {
                trace!("dropping malformed binary attachment: {err}");
                return;
            }
        };
        let Ok(mut pending) = self.pending_binary.lock() else {
            return;
        };
        let complete = match pending.as_mut() {
            Some(entry) => {
                entry.payloads.push(Payload::Binary(bytes));
                entry.remaining = entry.remaining.saturating_sub(1);
                entry.remaining == 0
            }
            None => {
                sink(SessionEvent::Message(StreamEvent {
                    name: "binary".into(),
                    payloads: vec![Payload::Binary(bytes)],
                }));
                false
            }
        };
        let finished = if complete { pending.take() } else { None };
        drop(pending);
        if let Some(entry) = finished {
            sink(SessionEvent::Message(StreamEvent {
                name: entry.name,
                payloads: entry.payloads,
            }));
        }
    }
}

/// Live Socket.IO session; dropping it closes the session.
pub struct PollingSession {
    shared: Arc<Shared>,
}

impl StreamSession for PollingSession {
    fn is_alive(&self) -> bool {
        self.shared.alive.load(Ordering::SeqCst)
    }

    fn emit(&self, event: &str) -> Result<(), StreamError> {
        if !self.is_alive() {
            return Err(StreamError::Closed);
        }
        let packet = format!("42{}", serde_json::json!([event]));
        self.shared.post(&packet, CLOSE_TIMEOUT)
    }

    fn disconnect(&self) -> Result<(), StreamError> {
        self.shared.close();
        Ok(())
    }
}

impl Drop for PollingSession {
    fn drop(&mut self) {
        self.shared.close();
    }
}
