//! Wire conventions for the streamed response.
//!
//! The response head is built exactly once per session, from
//! [`StreamProtocol::response`], before the body produces its first byte.

use axum::body::{Body, Bytes};
use axum::http::{header, HeaderValue};
use axum::response::Response;
use std::str::FromStr;

const CHUNKED_ERROR_PREFIX: &str = "\n--- Error: ";
const CHUNKED_ERROR_SUFFIX: &str = " ---\n";

/// Streaming convention, chosen per deployment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StreamProtocol {
    /// Raw text deltas over chunked transfer encoding.
    ChunkedText,
    /// Server-Sent Events with `done`/`error` terminal events.
    #[default]
    EventStream,
}

impl StreamProtocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            StreamProtocol::ChunkedText => "chunked",
            StreamProtocol::EventStream => "event-stream",
        }
    }

    /// Build the response head for this convention around `body`.
    pub fn response(&self, body: Body) -> Response {
        let mut response = Response::new(body);
        let headers = response.headers_mut();

        match self {
            StreamProtocol::ChunkedText => {
                headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("text/plain"));
                headers.insert(header::TRANSFER_ENCODING, HeaderValue::from_static("chunked"));
            }
            StreamProtocol::EventStream => {
                headers.insert(
                    header::CONTENT_TYPE,
                    HeaderValue::from_static("text/event-stream"),
                );
                headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-cache"));
            }
        }
        headers.insert(header::CONNECTION, HeaderValue::from_static("keep-alive"));

        response
    }

    /// Frame one text delta.
    pub fn delta_frame(&self, delta: &str) -> Bytes {
        match self {
            StreamProtocol::ChunkedText => Bytes::copy_from_slice(delta.as_bytes()),
            StreamProtocol::EventStream => Bytes::from(sse_frame(None, delta)),
        }
    }

    /// Frame the success terminator, if the convention has one.
    pub fn done_frame(&self) -> Option<Bytes> {
        match self {
            StreamProtocol::ChunkedText => None,
            StreamProtocol::EventStream => Some(Bytes::from(sse_frame(Some("done"), "[DONE]"))),
        }
    }

    /// Frame the in-band error terminator.
    pub fn error_frame(&self, message: &str) -> Bytes {
        match self {
            StreamProtocol::ChunkedText => Bytes::from(format!(
                "{}{}{}",
                CHUNKED_ERROR_PREFIX, message, CHUNKED_ERROR_SUFFIX
            )),
            StreamProtocol::EventStream => Bytes::from(sse_frame(Some("error"), message)),
        }
    }
}

/// One SSE message. A multi-line payload becomes one `data:` line per line,
/// which clients join back with `\n`. `\r\n` and a lone `\r` also end an SSE
/// line, so both are read as `\n`.
fn sse_frame(event: Option<&str>, data: &str) -> String {
    let mut frame = String::with_capacity(data.len() + 16);
    if let Some(event) = event {
        frame.push_str("event: ");
        frame.push_str(event);
        frame.push('\n');
    }
    let data = data.replace("\r\n", "\n").replace('\r', "\n");
    for line in data.split('\n') {
        frame.push_str("data: ");
        frame.push_str(line);
        frame.push('\n');
    }
    frame.push('\n');
    frame
}

impl FromStr for StreamProtocol {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "chunked" | "chunked-text" | "text" => Ok(StreamProtocol::ChunkedText),
            "event-stream" | "sse" => Ok(StreamProtocol::EventStream),
            other => Err(format!(
                "unknown stream protocol '{}' (expected 'chunked' or 'event-stream')",
                other
            )),
        }
    }
}
