//! HTTP handlers for the chat service.

pub mod chat;
pub mod health;
pub mod metrics;

pub use chat::ai_chat;
pub use health::{health_check, readiness_check, root};
pub use metrics::metrics_handler;
