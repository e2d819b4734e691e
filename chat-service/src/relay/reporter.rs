//! Maps relay failures onto what the client sees.
//!
//! Before the response head is committed a failure is an ordinary JSON error
//! response; afterwards the status is fixed and the failure can only be
//! signalled in-band with the active convention's error terminator. Upstream
//! detail is logged, never sent.

use super::protocol::StreamProtocol;
use super::session::RelayState;
use super::upstream::UpstreamError;
use super::validator::ValidationFailure;
use crate::services::metrics;
use axum::body::Bytes;
use service_core::error::AppError;
use uuid::Uuid;

pub const PROMPT_REQUIRED: &str = "Prompt is required.";
pub const GENERATION_FAILED: &str = "AI generation failed.";

/// Whether the response head was already committed when a failure happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailurePhase {
    BeforeHeaders,
    AfterHeaders,
}

impl FailurePhase {
    pub fn of(state: RelayState) -> Self {
        match state {
            RelayState::Created | RelayState::FailedBeforeHeaders => FailurePhase::BeforeHeaders,
            RelayState::HeadersSent
            | RelayState::Streaming
            | RelayState::Done
            | RelayState::FailedAfterHeaders => FailurePhase::AfterHeaders,
        }
    }
}

/// A request that never reaches the upstream.
pub fn rejected(err: &ValidationFailure) -> AppError {
    tracing::info!(error = %err, "Rejected chat request");
    metrics::record_validation_failure();
    AppError::BadRequest(anyhow::anyhow!(PROMPT_REQUIRED))
}

/// Failure while the response head is still uncommitted.
pub fn before_headers(session_id: Uuid, err: &UpstreamError) -> AppError {
    log_failure(session_id, FailurePhase::BeforeHeaders, err);
    AppError::UpstreamFailure(GENERATION_FAILED.to_string())
}

/// Failure after the response head went out: the error terminator frame.
pub fn after_headers(session_id: Uuid, protocol: StreamProtocol, err: &UpstreamError) -> Bytes {
    log_failure(session_id, FailurePhase::AfterHeaders, err);
    protocol.error_frame(GENERATION_FAILED)
}

fn log_failure(session_id: Uuid, phase: FailurePhase, err: &UpstreamError) {
    tracing::error!(
        session_id = %session_id,
        phase = ?phase,
        deltas = err.deltas_received(),
        error = %err,
        "AI generation failed"
    );
    metrics::record_upstream_error(err.kind());
}
