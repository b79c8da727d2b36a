//! LLM provider client for chat completions.

mod error;
mod provider;
mod together;
mod types;

pub use error::LLMError;
pub use provider::LLMProvider;
pub use together::TogetherProvider;
pub use types::{
    ChatRequest, ChatResponse, ChatStream, Choice, ChoiceMessage, Message, Role, StreamEvent,
    Usage,
};
