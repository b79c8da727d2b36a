//! Conversation sessions.

mod conversation;
mod store;
mod transcript;

pub use conversation::{Conversation, Message, ValidationError};
pub use store::{ConversationTemplate, SessionStore, SharedConversation};
pub use transcript::Transcript;
