//! Inbound payload validation.
//!
//! Runs before any upstream call and before a response head exists.

use serde::Deserialize;
use thiserror::Error;
use validator::Validate;

/// Body of `POST /ai-chat`.
#[derive(Debug, Deserialize, Validate)]
pub struct PromptRequest {
    #[validate(length(min = 1))]
    pub prompt: String,
}

#[derive(Debug, Error)]
pub enum ValidationFailure {
    /// Not JSON, not an object, or `prompt` absent/null/not a string.
    #[error("malformed prompt request: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("invalid prompt request: {0}")]
    Invalid(#[from] validator::ValidationErrors),
}

/// Extract the prompt from a raw request body.
///
/// Only presence and non-emptiness are checked. The prompt is returned
/// unchanged: no trimming, no sanitization, no length cap.
pub fn validate_prompt(body: &[u8]) -> Result<String, ValidationFailure> {
    let request: PromptRequest = serde_json::from_slice(body)?;
    request.validate()?;
    Ok(request.prompt)
}
