use crate::relay::{reporter, validate_prompt, StreamSession};
use crate::startup::AppState;
use axum::{body::Bytes, extract::State};
use service_core::error::AppError;

/// `POST /ai-chat`
///
/// The body is validated before anything else happens; an invalid request
/// never reaches the provider. On success the returned session becomes a
/// streaming response in the configured convention.
pub async fn ai_chat(
    State(state): State<AppState>,
    body: Bytes,
) -> Result<StreamSession, AppError> {
    let prompt = validate_prompt(&body).map_err(|e| reporter::rejected(&e))?;

    StreamSession::open(state.provider.as_ref(), &prompt, &state.relay).await
}
