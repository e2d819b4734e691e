//! Per-request relay state machine.
//!
//! ```text
//! Created ──► HeadersSent ──► Streaming ──► Done
//!    │                            │
//!    ▼                            ▼
//! FailedBeforeHeaders      FailedAfterHeaders
//! ```
//!
//! A session opens the upstream and pulls the first delta while still in
//! `Created`, so a call that fails immediately becomes a plain 500. Once
//! [`StreamSession`] is turned into a response it is consumed: the head is
//! built once and the session lives on inside the body stream, which yields
//! one frame per delta and exactly one terminal frame. Dropping the body
//! (client gone) drops the session and its upstream stream with it.

use super::protocol::StreamProtocol;
use super::reporter::{self, FailurePhase};
use super::upstream::{DeltaStream, UpstreamError};
use crate::services::metrics;
use crate::services::providers::{GenerationParams, TextProvider};
use axum::body::{Body, Bytes};
use axum::response::{IntoResponse, Response};
use futures::{Stream, StreamExt};
use service_core::error::AppError;
use std::convert::Infallible;
use std::time::{Duration, Instant};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayState {
    Created,
    HeadersSent,
    Streaming,
    Done,
    FailedBeforeHeaders,
    FailedAfterHeaders,
}

impl RelayState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            RelayState::Done | RelayState::FailedBeforeHeaders | RelayState::FailedAfterHeaders
        )
    }

    pub fn can_transition_to(self, next: RelayState) -> bool {
        use RelayState::*;
        matches!(
            (self, next),
            (Created, HeadersSent)
                | (Created, FailedBeforeHeaders)
                | (HeadersSent, Streaming)
                | (Streaming, Done)
                | (Streaming, FailedAfterHeaders)
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            RelayState::Created => "created",
            RelayState::HeadersSent => "headers_sent",
            RelayState::Streaming => "streaming",
            RelayState::Done => "done",
            RelayState::FailedBeforeHeaders => "failed_before_headers",
            RelayState::FailedAfterHeaders => "failed_after_headers",
        }
    }
}

/// Relay settings shared by every session of a deployment.
#[derive(Debug, Clone)]
pub struct RelaySettings {
    pub protocol: StreamProtocol,
    pub params: GenerationParams,
    pub idle_timeout: Duration,
}

/// One in-flight relay. Never shared, never reused.
pub struct StreamSession {
    id: Uuid,
    protocol: StreamProtocol,
    state: RelayState,
    upstream: Option<DeltaStream>,
    pending: Option<String>,
    chunks_written: usize,
    bytes_written: usize,
    opened_at: Instant,
}

impl StreamSession {
    fn new(protocol: StreamProtocol) -> Self {
        Self {
            id: Uuid::new_v4(),
            protocol,
            state: RelayState::Created,
            upstream: None,
            pending: None,
            chunks_written: 0,
            bytes_written: 0,
            opened_at: Instant::now(),
        }
    }

    /// Open the upstream call and wait for its first delta.
    ///
    /// Any failure up to that point is reported as an error response; the
    /// session never reaches the client.
    pub async fn open(
        provider: &dyn TextProvider,
        prompt: &str,
        settings: &RelaySettings,
    ) -> Result<Self, AppError> {
        let mut session = Self::new(settings.protocol);

        tracing::info!(
            session_id = %session.id,
            provider = provider.name(),
            protocol = settings.protocol.as_str(),
            prompt_len = prompt.len(),
            "Opening relay session"
        );

        match DeltaStream::open(provider, prompt, &settings.params, settings.idle_timeout).await {
            Ok(upstream) => session.upstream = Some(upstream),
            Err(e) => return Err(session.fail_before_headers(e)),
        }

        match session.pull().await {
            Some(Ok(delta)) => {
                metrics::record_time_to_first_delta(session.opened_at.elapsed().as_secs_f64());
                session.pending = Some(delta);
            }
            Some(Err(e)) => return Err(session.fail_before_headers(e)),
            // Empty generation: the body will carry only the terminator.
            None => {}
        }

        Ok(session)
    }

    pub fn state(&self) -> RelayState {
        self.state
    }

    fn transition(&mut self, next: RelayState) {
        debug_assert!(
            self.state.can_transition_to(next),
            "invalid relay transition {:?} -> {:?}",
            self.state,
            next
        );
        tracing::trace!(
            session_id = %self.id,
            from = self.state.as_str(),
            to = next.as_str(),
            "Relay transition"
        );
        self.state = next;

        if next.is_terminal() {
            // Release the upstream as soon as nothing more will be read.
            self.upstream = None;
            metrics::record_session(next.as_str());
        }
    }

    async fn pull(&mut self) -> Option<Result<String, UpstreamError>> {
        match self.upstream.as_mut() {
            Some(upstream) => upstream.next_delta().await,
            None => None,
        }
    }

    fn fail_before_headers(&mut self, err: UpstreamError) -> AppError {
        debug_assert_eq!(FailurePhase::of(self.state), FailurePhase::BeforeHeaders);
        let response = reporter::before_headers(self.id, &err);
        self.transition(RelayState::FailedBeforeHeaders);
        response
    }

    /// Produce the next body frame, or `None` once a terminal frame is out.
    async fn next_frame(&mut self) -> Option<Bytes> {
        if self.state == RelayState::HeadersSent {
            self.transition(RelayState::Streaming);
        }
        if self.state != RelayState::Streaming {
            return None;
        }

        let next = match self.pending.take() {
            Some(delta) => Some(Ok(delta)),
            None => self.pull().await,
        };

        let frame = match next {
            Some(Ok(delta)) => {
                metrics::record_delta();
                self.protocol.delta_frame(&delta)
            }
            Some(Err(e)) => {
                debug_assert_eq!(FailurePhase::of(self.state), FailurePhase::AfterHeaders);
                let frame = reporter::after_headers(self.id, self.protocol, &e);
                self.transition(RelayState::FailedAfterHeaders);
                frame
            }
            None => {
                self.transition(RelayState::Done);
                tracing::info!(
                    session_id = %self.id,
                    chunks = self.chunks_written,
                    bytes = self.bytes_written,
                    elapsed_ms = self.opened_at.elapsed().as_millis() as u64,
                    "Relay session completed"
                );
                self.protocol.done_frame()?
            }
        };

        self.chunks_written += 1;
        self.bytes_written += frame.len();
        Some(frame)
    }

    /// Commit the response head and hand the rest of the session to the body.
    fn commit(mut self) -> (StreamProtocol, impl Stream<Item = Bytes> + Send + 'static) {
        self.transition(RelayState::HeadersSent);
        let protocol = self.protocol;
        let frames = futures::stream::unfold(self, |mut session| async move {
            let frame = session.next_frame().await?;
            Some((frame, session))
        });
        (protocol, frames)
    }
}

impl IntoResponse for StreamSession {
    fn into_response(self) -> Response {
        let (protocol, frames) = self.commit();
        protocol.response(Body::from_stream(frames.map(Ok::<_, Infallible>)))
    }
}

impl Drop for StreamSession {
    fn drop(&mut self) {
        if !self.state.is_terminal() {
            tracing::info!(
                session_id = %self.id,
                state = self.state.as_str(),
                chunks = self.chunks_written,
                bytes = self.bytes_written,
                "Client disconnected, releasing upstream stream"
            );
            metrics::record_session("cancelled");
        }
    }
}
