//! A single conversation: ordered, append-only message history.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;
use ulid::Ulid;

use super::transcript::Transcript;
use crate::llm::{self, Role};

const SUMMARY_SNIPPET_CHARS: usize = 100;
/// Oldest summary lines are dropped past this many.
const MAX_SUMMARY_LINES: usize = 10;

/// Errors raised for input rejected before anything leaves the process.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("message text must not be empty")]
    EmptyText,

    #[error("no unanswered user message to retry")]
    NothingToRetry,
}

/// A single conversation turn. Immutable once created.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    role: Role,
    text: String,
    timestamp: DateTime<Utc>,
}

impl Message {
    /// Create a message stamped with the current time.
    pub fn new(role: Role, text: impl Into<String>) -> Result<Self, ValidationError> {
        let text = text.into();
        if text.trim().is_empty() {
            return Err(ValidationError::EmptyText);
        }
        Ok(Self {
            role,
            text,
            timestamp: Utc::now(),
        })
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }
}

impl From<&Message> for llm::Message {
    fn from(message: &Message) -> Self {
        llm::Message {
            role: message.role,
            content: message.text.clone(),
        }
    }
}

/// Ordered message history for one interaction.
///
/// The optional persona is kept as the first message and survives [`clear`].
/// With a memory limit, older turns are folded into a short textual summary
/// that is sent ahead of the remaining history.
///
/// [`clear`]: Conversation::clear
#[derive(Debug)]
pub struct Conversation {
    id: String,
    created_at: DateTime<Utc>,
    persona: Option<Message>,
    messages: Vec<Message>,
    memory_limit: Option<usize>,
    memory_summary: String,
    labels: SpeakerLabels,
    transcript: Option<Transcript>,
}

/// Display names used when summarising trimmed turns.
#[derive(Debug, Clone)]
struct SpeakerLabels {
    user: String,
    assistant: String,
}

impl Default for SpeakerLabels {
    fn default() -> Self {
        Self {
            user: "User".to_string(),
            assistant: "Assistant".to_string(),
        }
    }
}

impl Default for Conversation {
    fn default() -> Self {
        Self::new()
    }
}

impl Conversation {
    /// Create an empty conversation without a persona.
    pub fn new() -> Self {
        Self {
            id: new_id(),
            created_at: Utc::now(),
            persona: None,
            messages: Vec::new(),
            memory_limit: None,
            memory_summary: String::new(),
            labels: SpeakerLabels::default(),
            transcript: None,
        }
    }

    /// Create a conversation seeded with a system persona message.
    pub fn with_persona(persona: impl Into<String>) -> Result<Self, ValidationError> {
        let mut conversation = Self::new();
        conversation.reseed(persona)?;
        Ok(conversation)
    }

    /// Keep at most `limit` non-system messages; older ones are summarised.
    #[must_use]
    pub fn with_memory_limit(mut self, limit: usize) -> Self {
        self.memory_limit = Some(limit.max(1));
        self
    }

    /// Names used for the two speakers in the memory summary.
    #[must_use]
    pub fn with_speaker_names(
        mut self,
        user: impl Into<String>,
        assistant: impl Into<String>,
    ) -> Self {
        self.labels = SpeakerLabels {
            user: user.into(),
            assistant: assistant.into(),
        };
        self
    }

    /// Mirror every appended message to a JSONL transcript.
    #[must_use]
    pub fn with_transcript(mut self, transcript: Transcript) -> Self {
        if let Some(persona) = &self.persona {
            transcript.record(&self.id, persona);
        }
        self.transcript = Some(transcript);
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Whether a system persona is seeded.
    pub fn has_persona(&self) -> bool {
        self.persona.is_some()
    }

    /// Summary of turns dropped by the memory limit, empty if none.
    pub fn memory_summary(&self) -> &str {
        &self.memory_summary
    }

    /// Append a message with the current timestamp to the tail.
    pub fn append(
        &mut self,
        role: Role,
        text: impl Into<String>,
    ) -> Result<&Message, ValidationError> {
        let message = Message::new(role, text)?;

        if let Some(transcript) = &self.transcript {
            transcript.record(&self.id, &message);
        }

        self.messages.push(message);
        self.enforce_memory_limit();

        // The just-pushed message is always retained: trimming keeps the newest turns.
        let index = self.messages.len() - 1;
        Ok(&self.messages[index])
    }

    /// The ordered history, persona first.
    pub fn history(&self) -> Vec<&Message> {
        self.persona.iter().chain(self.messages.iter()).collect()
    }

    /// Number of messages in [`history`](Conversation::history).
    pub fn len(&self) -> usize {
        self.messages.len() + usize::from(self.persona.is_some())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Messages to send to the provider: persona, memory summary, then history.
    pub fn messages_for_request(&self) -> Vec<llm::Message> {
        let mut out = Vec::with_capacity(self.len() + 1);

        if let Some(persona) = &self.persona {
            out.push(persona.into());
        }
        if !self.memory_summary.is_empty() {
            out.push(llm::Message {
                role: Role::System,
                content: format!(
                    "Context from earlier in the conversation: {}",
                    self.memory_summary
                ),
            });
        }
        out.extend(self.messages.iter().map(llm::Message::from));
        out
    }

    /// Reset to the seeded persona only. Idempotent.
    pub fn clear(&mut self) {
        self.messages.clear();
        self.memory_summary.clear();
        self.id = new_id();
        self.created_at = Utc::now();

        if let (Some(transcript), Some(persona)) = (&self.transcript, &self.persona) {
            transcript.record(&self.id, persona);
        }
        debug!(conversation_id = %self.id, "Conversation cleared");
    }

    /// Replace the seeded persona, leaving the rest of the history untouched.
    pub fn reseed(&mut self, persona: impl Into<String>) -> Result<(), ValidationError> {
        let message = Message::new(Role::System, persona)?;
        if let Some(transcript) = &self.transcript {
            transcript.record(&self.id, &message);
        }
        self.persona = Some(message);
        Ok(())
    }

    fn enforce_memory_limit(&mut self) {
        let Some(limit) = self.memory_limit else {
            return;
        };
        if self.messages.len() <= limit {
            return;
        }

        let overflow = self.messages.len() - limit;
        let dropped: Vec<Message> = self.messages.drain(..overflow).collect();

        let points: Vec<String> = dropped
            .iter()
            .filter(|m| m.role != Role::System)
            .map(|m| {
                let speaker = match m.role {
                    Role::User => &self.labels.user,
                    _ => &self.labels.assistant,
                };
                format!("{speaker}: {}", snippet(&m.text))
            })
            .collect();

        if points.is_empty() {
            return;
        }

        let summary = format!("Key points from earlier: {}", points.join("; "));
        let mut lines: Vec<&str> = self.memory_summary.lines().collect();
        lines.push(&summary);
        let keep_from = lines.len().saturating_sub(MAX_SUMMARY_LINES);
        self.memory_summary = lines[keep_from..].join("\n");
    }
}

fn new_id() -> String {
    format!("conv_{}", Ulid::new())
}

fn snippet(text: &str) -> String {
    let mut chars = text.chars();
    let head: String = chars.by_ref().take(SUMMARY_SNIPPET_CHARS).collect();
    if chars.next().is_some() {
        format!("{head}...")
    } else {
        head
    }
}
