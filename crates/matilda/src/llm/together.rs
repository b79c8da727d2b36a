//! Together.ai provider.
//!
//! Together exposes an OpenAI-compatible `/chat/completions` endpoint, so the
//! request and response shapes are the common ones from [`super::types`].

use std::pin::Pin;
use std::task::{Context, Poll};

use async_trait::async_trait;
use futures::Stream;
use reqwest::Client;
use tracing::debug;

use super::error::{LLMError, check_response_error};
use super::provider::LLMProvider;
use super::types::{ChatRequest, ChatResponse, ChatStream, StreamEvent, Usage};

/// Chat-completion client for the Together.ai API.
pub struct TogetherProvider {
    client: Client,
    base_url: String,
    api_key: String,
}

impl TogetherProvider {
    pub const DEFAULT_BASE_URL: &'static str = "https://api.together.xyz/v1";

    #[must_use]
    pub fn new(client: Client, base_url: String, api_key: String) -> Self {
        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
        }
    }

    fn build_request<T: serde::Serialize + ?Sized>(&self, body: &T) -> reqwest::RequestBuilder {
        let url = format!("{}/chat/completions", self.base_url);
        self.client
            .post(url)
            .header("Content-Type", "application/json")
            .bearer_auth(&self.api_key)
            .json(body)
    }

    async fn send<T: serde::Serialize + ?Sized>(
        &self,
        body: &T,
    ) -> Result<reqwest::Response, LLMError> {
        let response = self.build_request(body).send().await?;

        if let Some(err) = check_response_error(&response) {
            return Err(err);
        }
        if !response.status().is_success() {
            let status = response.status().as_u16();
            let message = response.text().await.unwrap_or_default();
            return Err(LLMError::Api { status, message });
        }

        Ok(response)
    }
}

#[async_trait]
impl LLMProvider for TogetherProvider {
    async fn chat(&self, request: ChatRequest) -> Result<ChatResponse, LLMError> {
        debug!(
            model = %request.model,
            messages = request.messages.len(),
            "Sending chat completion request"
        );

        let response = self.send(&request).await?;
        let body = response.text().await?;

        // An empty body is not a protocol error; the caller sees no content.
        if body.trim().is_empty() {
            return Ok(ChatResponse::default());
        }

        serde_json::from_str(&body).map_err(|e| LLMError::Malformed(e.to_string()))
    }

    async fn chat_stream(&self, request: ChatRequest) -> Result<ChatStream, LLMError> {
        debug!(
            model = %request.model,
            messages = request.messages.len(),
            "Sending streaming chat completion request"
        );

        let stream_request = StreamRequest {
            request: &request,
            stream: true,
        };
        let response = self.send(&stream_request).await?;

        let byte_stream = response.bytes_stream();
        Ok(Box::pin(StreamParser::new(byte_stream)))
    }
}

// ============================================================================
// Streaming
// ============================================================================

#[derive(serde::Serialize)]
struct StreamRequest<'a> {
    #[serde(flatten)]
    request: &'a ChatRequest,
    stream: bool,
}

/// Parses an SSE byte stream of `chat.completion.chunk` objects into [`StreamEvent`]s.
pub(crate) struct StreamParser<S> {
    inner: S,
    buffer: Vec<u8>,
    usage: Option<Usage>,
    eof: bool,
    done: bool,
}

impl<S> StreamParser<S> {
    pub(crate) fn new(inner: S) -> Self {
        Self {
            inner,
            buffer: Vec::new(),
            usage: None,
            eof: false,
            done: false,
        }
    }

    /// Pop the next complete line from the buffer, if any.
    fn next_line(&mut self) -> Option<String> {
        let line_end = self.buffer.iter().position(|b| *b == b'\n')?;
        let line: Vec<u8> = self.buffer.drain(..=line_end).collect();
        Some(String::from_utf8_lossy(&line).trim().to_string())
    }

    /// Interpret a single SSE line. Returns `Some` when it yields an event.
    fn parse_line(&mut self, line: &str) -> Option<Result<StreamEvent, LLMError>> {
        let data = line.strip_prefix("data:")?.trim();

        if data == "[DONE]" {
            self.done = true;
            return Some(Ok(StreamEvent::Done {
                usage: self.usage.take(),
            }));
        }

        let chunk = match serde_json::from_str::<StreamChunk>(data) {
            Ok(chunk) => chunk,
            Err(e) => return Some(Err(LLMError::Malformed(e.to_string()))),
        };

        if chunk.usage.is_some() {
            self.usage = chunk.usage;
        }

        chunk
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.delta.content.or(c.text))
            .filter(|content| !content.is_empty())
            .map(|content| Ok(StreamEvent::Token(content)))
    }
}

impl<S> Stream for StreamParser<S>
where
    S: Stream<Item = Result<bytes::Bytes, reqwest::Error>> + Unpin,
{
    type Item = Result<StreamEvent, LLMError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        if self.done {
            return Poll::Ready(None);
        }

        loop {
            while let Some(line) = self.next_line() {
                if line.is_empty() {
                    continue;
                }
                if let Some(event) = self.parse_line(&line) {
                    if event.is_err() {
                        self.done = true;
                    }
                    return Poll::Ready(Some(event));
                }
            }

            if self.eof {
                self.done = true;
                let usage = self.usage.take();
                return Poll::Ready(Some(Ok(StreamEvent::Done { usage })));
            }

            match Pin::new(&mut self.inner).poll_next(cx) {
                Poll::Ready(Some(Ok(bytes))) => {
                    self.buffer.extend_from_slice(&bytes);
                }
                Poll::Ready(Some(Err(e))) => {
                    self.done = true;
                    return Poll::Ready(Some(Err(LLMError::Request(e))));
                }
                Poll::Ready(None) => {
                    self.eof = true;
                    // Flush a trailing line without a newline terminator.
                    if !self.buffer.is_empty() {
                        self.buffer.push(b'\n');
                    }
                }
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

#[derive(serde::Deserialize)]
struct StreamChunk {
    #[serde(default)]
    choices: Vec<StreamChoice>,
    #[serde(default)]
    usage: Option<Usage>,
}

#[derive(serde::Deserialize)]
struct StreamChoice {
    #[serde(default)]
    delta: StreamDelta,
    /// Legacy completion chunks carry `text` instead of a delta.
    #[serde(default)]
    text: Option<String>,
}

#[derive(Default, serde::Deserialize)]
struct StreamDelta {
    #[serde(default)]
    content: Option<String>,
}
