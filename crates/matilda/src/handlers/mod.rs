//! HTTP request handlers.

pub mod api;
mod health;

pub use health::{livez, readyz};
