//! Matilda - a conversational assistant backed by a hosted chat-completion API.

pub mod config;
pub mod handlers;
pub mod llm;
pub mod persona;
pub mod relay;
pub mod response;
pub mod server;
pub mod session;
