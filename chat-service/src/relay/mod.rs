//! The streaming relay: validate, open upstream, commit the response head
//! once, forward deltas in order, finish with exactly one terminal signal.

pub mod protocol;
pub mod reporter;
pub mod session;
pub mod upstream;
pub mod validator;

pub use protocol::StreamProtocol;
pub use session::{RelaySettings, RelayState, StreamSession};
pub use upstream::{DeltaStream, UpstreamError};
pub use validator::{validate_prompt, PromptRequest, ValidationFailure};
