//! Request relay: turns a conversation into a provider request and the
//! provider's answer back into a conversation turn.
//!
//! The user turn is recorded before the provider is called and stays recorded
//! whatever the outcome. The assistant turn is appended only once the provider
//! has produced a complete, non-empty answer, so a failed call can be retried
//! without duplicating the user's message.

mod error;

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use tokio_stream::StreamExt;
use tracing::{debug, info, warn};

use crate::config::ProviderConfig;
use crate::llm::{ChatRequest, LLMProvider, Message, Role, StreamEvent};
use crate::persona::Persona;
use crate::session::{Conversation, ValidationError};

pub use error::{ProviderError, ProviderErrorKind, RelayError};

/// The assistant's answer to one user turn.
#[derive(Debug, Clone, PartialEq)]
pub struct Reply {
    pub text: String,
    pub timestamp: DateTime<Utc>,
}

/// Request parameters applied to every completion.
#[derive(Debug, Clone)]
pub struct RelaySettings {
    pub model: String,
    pub max_tokens: u32,
    pub temperature: f32,
    pub top_p: Option<f32>,
    pub top_k: Option<u32>,
    pub timeout: Duration,
    /// Used when the conversation has no seeded persona, and to clean replies.
    pub persona: Option<Persona>,
}

impl RelaySettings {
    pub fn from_config(config: &ProviderConfig) -> Self {
        Self {
            model: config.model.clone(),
            max_tokens: config.max_tokens,
            temperature: config.temperature,
            top_p: Some(config.top_p),
            top_k: Some(config.top_k),
            timeout: config.request_timeout,
            persona: Some(config.persona.clone()),
        }
    }
}

pub struct Relay {
    provider: Arc<dyn LLMProvider>,
    settings: RelaySettings,
}

impl Relay {
    pub fn new(provider: Arc<dyn LLMProvider>, settings: RelaySettings) -> Self {
        Self { provider, settings }
    }

    pub fn settings(&self) -> &RelaySettings {
        &self.settings
    }

    /// Send `user_text` with the conversation so far and record the answer.
    pub async fn complete(
        &self,
        session: &mut Conversation,
        user_text: &str,
    ) -> Result<Reply, RelayError> {
        let request = self.record_user_turn(session, user_text)?;
        self.dispatch(session, request).await
    }

    /// Re-send a conversation whose last turn is an unanswered user message.
    ///
    /// Nothing is appended before the provider answers, so retrying after a
    /// failed [`complete`](Relay::complete) does not duplicate the user turn.
    pub async fn retry(&self, session: &mut Conversation) -> Result<Reply, RelayError> {
        let pending = session
            .history()
            .last()
            .is_some_and(|m| m.role() == Role::User);
        if !pending {
            return Err(ValidationError::NothingToRetry.into());
        }

        let request = self.build_request(session);
        self.dispatch(session, request).await
    }

    async fn dispatch(
        &self,
        session: &mut Conversation,
        request: ChatRequest,
    ) -> Result<Reply, RelayError> {
        let started = Instant::now();
        let timeout = self.settings.timeout;

        let response = match tokio::time::timeout(timeout, self.provider.chat(request)).await {
            Ok(Ok(response)) => response,
            Ok(Err(e)) => return Err(self.failed(session, e.into(), started).into()),
            Err(_elapsed) => {
                let err = ProviderError::timeout(timeout);
                return Err(self.failed(session, err, started).into());
            }
        };

        let text = response.content().unwrap_or_default();
        self.record_assistant_turn(session, text, started)
    }

    /// Like [`complete`](Relay::complete), but streams tokens to `on_token` as
    /// they arrive. The assistant turn is recorded only after the stream ends
    /// cleanly; an idle gap longer than the timeout fails the call.
    pub async fn complete_stream<F>(
        &self,
        session: &mut Conversation,
        user_text: &str,
        mut on_token: F,
    ) -> Result<Reply, RelayError>
    where
        F: FnMut(&str) + Send,
    {
        let request = self.record_user_turn(session, user_text)?;
        let started = Instant::now();
        let timeout = self.settings.timeout;

        let call = self.provider.chat_stream(request);
        let stream = match tokio::time::timeout(timeout, call).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => return Err(self.failed(session, e.into(), started).into()),
            Err(_elapsed) => {
                let err = ProviderError::timeout(timeout);
                return Err(self.failed(session, err, started).into());
            }
        };

        let stream = stream.timeout(timeout);
        tokio::pin!(stream);

        let mut accumulated = String::new();
        while let Some(item) = stream.next().await {
            match item {
                Ok(Ok(StreamEvent::Token(token))) => {
                    on_token(&token);
                    accumulated.push_str(&token);
                }
                Ok(Ok(StreamEvent::Done { usage })) => {
                    debug!(?usage, "Stream finished");
                    break;
                }
                Ok(Err(e)) => return Err(self.failed(session, e.into(), started).into()),
                Err(_elapsed) => {
                    let err = ProviderError::timeout(timeout);
                    return Err(self.failed(session, err, started).into());
                }
            }
        }

        self.record_assistant_turn(session, &accumulated, started)
    }

    /// Stream the reply, falling back to a single completion when the stream
    /// fails before producing any token. The user turn is sent only once.
    pub async fn complete_stream_or_fallback<F>(
        &self,
        session: &mut Conversation,
        user_text: &str,
        mut on_token: F,
    ) -> Result<Reply, RelayError>
    where
        F: FnMut(&str) + Send,
    {
        let mut streamed = false;
        let result = self
            .complete_stream(session, user_text, |token| {
                streamed = true;
                on_token(token);
            })
            .await;

        match result {
            Err(RelayError::Provider(e)) if !streamed => {
                info!(
                    conversation_id = %session.id(),
                    kind = %e.kind,
                    "Streaming failed, falling back to a single completion"
                );
                self.retry(session).await
            }
            other => other,
        }
    }

    fn record_user_turn(
        &self,
        session: &mut Conversation,
        user_text: &str,
    ) -> Result<ChatRequest, ValidationError> {
        if user_text.trim().is_empty() {
            return Err(ValidationError::EmptyText);
        }
        session.append(Role::User, user_text)?;
        Ok(self.build_request(session))
    }

    fn record_assistant_turn(
        &self,
        session: &mut Conversation,
        raw: &str,
        started: Instant,
    ) -> Result<Reply, RelayError> {
        let text = match &self.settings.persona {
            Some(persona) => persona.clean_reply(raw),
            None => raw.trim().to_string(),
        };

        if text.is_empty() {
            let err = self.failed(session, ProviderError::empty_response(), started);
            return Err(err.into());
        }

        let message = session.append(Role::Assistant, text)?;
        let reply = Reply {
            text: message.text().to_string(),
            timestamp: message.timestamp(),
        };

        info!(
            conversation_id = %session.id(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            history = session.len(),
            "Completion recorded"
        );
        Ok(reply)
    }

    fn failed(
        &self,
        session: &Conversation,
        err: ProviderError,
        started: Instant,
    ) -> ProviderError {
        warn!(
            conversation_id = %session.id(),
            kind = %err.kind,
            status = ?err.status,
            elapsed_ms = started.elapsed().as_millis() as u64,
            error = %err.detail,
            "Completion failed"
        );
        err
    }

    fn build_request(&self, session: &Conversation) -> ChatRequest {
        let mut messages = Vec::with_capacity(session.len() + 1);

        if !session.has_persona()
            && let Some(persona) = &self.settings.persona
        {
            messages.push(Message {
                role: Role::System,
                content: persona.system_prompt(chrono::Local::now().naive_local()),
            });
        }
        messages.extend(session.messages_for_request());

        ChatRequest {
            model: self.settings.model.clone(),
            messages,
            temperature: Some(self.settings.temperature),
            max_tokens: Some(self.settings.max_tokens),
            top_p: self.settings.top_p,
            top_k: self.settings.top_k,
        }
    }
}
