//! Assistant persona: conversation styles, the system prompt and the greeting.

use std::fmt;
use std::str::FromStr;

use chrono::{NaiveDateTime, Timelike};
use thiserror::Error;

/// Default assistant name.
pub const DEFAULT_ASSISTANT_NAME: &str = "Matilda";

// ============================================================================
// Style
// ============================================================================

/// Conversation style. Each style carries default sampling parameters and a
/// paragraph appended to the system prompt.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Style {
    Professional,
    Casual,
    #[default]
    Balanced,
    Creative,
    Concise,
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("unknown conversation style '{0}' (expected one of: professional, casual, balanced, creative, concise)")]
pub struct UnknownStyle(pub String);

impl Style {
    pub const ALL: [Style; 5] = [
        Style::Professional,
        Style::Casual,
        Style::Balanced,
        Style::Creative,
        Style::Concise,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Style::Professional => "professional",
            Style::Casual => "casual",
            Style::Balanced => "balanced",
            Style::Creative => "creative",
            Style::Concise => "concise",
        }
    }

    pub fn temperature(&self) -> f32 {
        match self {
            Style::Professional => 0.6,
            Style::Casual => 0.8,
            Style::Balanced => 0.7,
            Style::Creative => 0.9,
            Style::Concise => 0.5,
        }
    }

    pub fn top_p(&self) -> f32 {
        match self {
            Style::Professional => 0.9,
            Style::Casual => 0.95,
            Style::Balanced => 0.9,
            Style::Creative => 0.98,
            Style::Concise => 0.85,
        }
    }

    fn prompt_addon(&self) -> &'static str {
        match self {
            Style::Professional => {
                "You are professional, precise, and formal in your responses. \
                 You prioritize accuracy and clarity. \
                 You use proper terminology and avoid casual language. \
                 You maintain a helpful but somewhat formal tone."
            }
            Style::Casual => {
                "You are casual, friendly, and conversational in your responses. \
                 You use relaxed language and occasional humor when appropriate. \
                 You're warm and approachable, like chatting with a friend. \
                 You use simpler explanations and everyday examples."
            }
            Style::Balanced => {
                "You balance professionalism with approachability. \
                 You adapt your tone to match the user's style and the context of the conversation. \
                 You're helpful, clear, and friendly without being overly formal or casual."
            }
            Style::Creative => {
                "You are creative, imaginative, and engaging in your responses. \
                 You think outside the box and offer unique perspectives and ideas. \
                 You use vivid language, metaphors, and storytelling techniques when appropriate. \
                 You're enthusiastic and inspirational."
            }
            Style::Concise => {
                "You are brief and to the point. \
                 You prioritize efficiency and clarity in your responses. \
                 You avoid unnecessary details unless specifically asked. \
                 You use short sentences and paragraphs."
            }
        }
    }
}

impl fmt::Display for Style {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Style {
    type Err = UnknownStyle;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let name = s.trim().to_ascii_lowercase();
        Style::ALL
            .into_iter()
            .find(|style| style.as_str() == name)
            .ok_or_else(|| UnknownStyle(s.trim().to_string()))
    }
}

// ============================================================================
// Persona
// ============================================================================

/// Who the assistant is and who it is talking to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Persona {
    pub assistant_name: String,
    pub username: String,
    pub style: Style,
}

impl Persona {
    pub fn new(
        assistant_name: impl Into<String>,
        username: impl Into<String>,
        style: Style,
    ) -> Self {
        Self {
            assistant_name: assistant_name.into(),
            username: username.into(),
            style,
        }
    }

    /// Same persona in a different conversation style.
    #[must_use]
    pub fn with_style(&self, style: Style) -> Self {
        Self {
            style,
            ..self.clone()
        }
    }

    /// Build the system prompt for a conversation starting at `now`.
    pub fn system_prompt(&self, now: NaiveDateTime) -> String {
        let name = &self.assistant_name;

        let personality = format!(
            "You are {name}, an advanced AI assistant with your own unique personality and capabilities. \
             You are intelligent, articulate, and personable. \
             You have a slight wit and charm, but always remain helpful and focused on the user's needs. \
             When appropriate, you make connections to previous parts of the conversation."
        );

        let capabilities = "You can assist with a wide range of tasks including answering questions, \
             generating creative content, and discussing complex topics.";

        let limitations = "You admit when you don't know something and avoid making up information. \
             You're aware of your limitations as an AI. When unsure, you say so rather than guessing. \
             You respond thoughtfully but do not pretend to have subjective experiences or consciousness.";

        let awareness = format!(
            "Current date: {}. Current time: {}. \
             You're speaking with {}. \
             You adapt your responses to the conversation context and the user's needs.",
            now.format("%Y-%m-%d"),
            now.format("%H:%M:%S"),
            self.username,
        );

        [
            personality.as_str(),
            self.style.prompt_addon(),
            capabilities,
            limitations,
            awareness.as_str(),
        ]
        .join("\n\n")
    }

    /// Time-of-day greeting shown when a conversation opens.
    pub fn greeting(&self, now: NaiveDateTime) -> String {
        let salutation = match now.hour() {
            5..=11 => "Good morning",
            12..=17 => "Good afternoon",
            _ => "Good evening",
        };

        format!(
            "{salutation}! I am {}, your personal AI assistant. How may I assist you today, {}?",
            self.assistant_name, self.username
        )
    }

    /// Strip echoes of the speaker labels that completion models sometimes emit.
    pub fn clean_reply(&self, text: &str) -> String {
        let mut text = text.trim();

        let assistant_label = format!("{}:", self.assistant_name);
        if let Some(rest) = text.strip_prefix(&assistant_label) {
            text = rest.trim();
        }

        let user_label = format!("{}:", self.username);
        if text.contains(&user_label) {
            return text.replace(&user_label, "").trim().to_string();
        }

        text.to_string()
    }
}

impl Default for Persona {
    fn default() -> Self {
        Self::new(DEFAULT_ASSISTANT_NAME, "User", Style::default())
    }
}
