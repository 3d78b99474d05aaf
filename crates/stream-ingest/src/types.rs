use std::{fmt, time::Instant};

use image::RgbImage;
use thiserror::Error;

/// Decoded colour frame received from the stream producer.
#[derive(Clone)]
pub struct Frame {
    pub pixels: RgbImage,
    pub captured_at: Instant,
    pub sequence: u64,
}

impl Frame {
    pub fn new(pixels: RgbImage, captured_at: Instant, sequence: u64) -> Self {
        Self {
            pixels,
            captured_at,
            sequence,
        }
    }

    pub fn width(&self) -> u32 {
        self.pixels.width()
    }

    pub fn height(&self) -> u32 {
        self.pixels.height()
    }
}

impl fmt::Debug for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Frame")
            .field("width", &self.width())
            .field("height", &self.height())
            .field("sequence", &self.sequence)
            .finish()
    }
}

/// One candidate address of the stream producer.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
}

impl Endpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    pub fn base_url(&self) -> String {
        format!("http://{}:{}", self.host, self.port)
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Argument carried by an inbound stream event.
#[derive(Clone, Debug, PartialEq)]
pub enum Payload {
    Json(serde_json::Value),
    Binary(Vec<u8>),
}

/// Named event delivered by a live session.
#[derive(Clone, Debug, PartialEq)]
pub struct StreamEvent {
    pub name: String,
    pub payloads: Vec<Payload>,
}

#[derive(Debug, Error)]
pub enum StreamError {
    #[error("timed out after {0:?} waiting for {1}")]
    Timeout(std::time::Duration, &'static str),
    #[error("http request to {endpoint} failed: {source}")]
    Http {
        endpoint: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("unexpected response from {endpoint}: {detail}")]
    Protocol { endpoint: String, detail: String },
    #[error("{endpoint} refused the namespace connect: {detail}")]
    Rejected { endpoint: String, detail: String },
    /// The client and the producer disagree about the session; the handle must be rebuilt.
    #[error("session state out of sync with {endpoint}: {detail}")]
    Desync { endpoint: String, detail: String },
    #[error("session closed")]
    Closed,
}

impl StreamError {
    pub fn is_desync(&self) -> bool {
        matches!(self, StreamError::Desync { .. })
    }
}

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("payload carries no image field")]
    NoImage,
    #[error("invalid base64 image data: {0}")]
    Base64(#[from] base64::DecodeError),
    #[error("image decode failed: {0}")]
    Image(#[from] image::ImageError),
}
