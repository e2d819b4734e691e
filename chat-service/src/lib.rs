//! chat-service: relays a prompt to a generative model and streams the
//! answer back as chunked text or Server-Sent Events.

pub mod config;
pub mod handlers;
pub mod relay;
pub mod services;
pub mod startup;
