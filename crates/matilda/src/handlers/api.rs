//! Browser chat API.

use axum::Json;
use axum::extract::State;
use axum::http::header::{COOKIE, SET_COOKIE};
use axum::http::{HeaderMap, HeaderValue};
use axum::response::{IntoResponse, Response};
use chrono::Local;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::llm::Role;
use crate::response;
use crate::server::AppState;
use crate::session::SharedConversation;

/// Cookie carrying the server-issued session id.
pub const SESSION_COOKIE: &str = "matilda_session";

// ============================================================================
// Request/Response Types
// ============================================================================

#[derive(Serialize)]
pub struct GreetingResponse {
    greeting: String,
}

#[derive(Deserialize)]
pub struct ChatRequest {
    #[serde(default)]
    message: String,
}

#[derive(Serialize)]
pub struct ChatResponse {
    response: String,
    timestamp: String,
}

#[derive(Serialize)]
pub struct ClearResponse {
    status: &'static str,
    message: &'static str,
}

// ============================================================================
// Handlers
// ============================================================================

/// GET /api/greeting
pub async fn greeting(State(state): State<AppState>, headers: HeaderMap) -> Response {
    let session = resolve_session(&state, &headers);

    let persona = state.relay.settings().persona.clone().unwrap_or_default();
    let greeting = persona.greeting(Local::now().naive_local());

    {
        let mut conversation = session.conversation.lock().await;
        if let Err(e) = conversation.append(Role::Assistant, &greeting) {
            warn!(session_id = %session.id, error = %e, "Failed to record greeting");
        }
    }

    session.respond(Json(GreetingResponse { greeting }))
}

/// POST /api/chat
pub async fn chat(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<ChatRequest>,
) -> Response {
    let session = resolve_session(&state, &headers);

    let result = {
        let mut conversation = session.conversation.lock().await;
        state.relay.complete(&mut conversation, &req.message).await
    };

    match result {
        Ok(reply) => session.respond(Json(ChatResponse {
            response: reply.text,
            timestamp: reply.timestamp.to_rfc3339(),
        })),
        Err(e) => {
            debug!(session_id = %session.id, error = %e, "Chat request failed");
            session.respond(response::ApiError::from(e))
        }
    }
}

/// POST /api/clear
pub async fn clear(State(state): State<AppState>, headers: HeaderMap) -> Response {
    let session = resolve_session(&state, &headers);
    session.conversation.lock().await.clear();

    session.respond(Json(ClearResponse {
        status: "success",
        message: "Conversation history cleared",
    }))
}

// ============================================================================
// Session cookie
// ============================================================================

struct ResolvedSession {
    id: String,
    conversation: SharedConversation,
    created: bool,
}

impl ResolvedSession {
    /// Attach a `Set-Cookie` header when the session was just issued.
    fn respond(self, body: impl IntoResponse) -> Response {
        let mut response = body.into_response();
        if self.created {
            let cookie = format!("{SESSION_COOKIE}={}; Path=/; HttpOnly; SameSite=Lax", self.id);
            match HeaderValue::from_str(&cookie) {
                Ok(value) => {
                    response.headers_mut().append(SET_COOKIE, value);
                }
                Err(e) => warn!(error = %e, "Invalid session cookie"),
            }
        }
        response
    }
}

fn resolve_session(state: &AppState, headers: &HeaderMap) -> ResolvedSession {
    let requested = session_id_from_headers(headers);
    let (id, conversation, created) = state.sessions.get_or_create(requested.as_deref());
    ResolvedSession {
        id,
        conversation,
        created,
    }
}

fn session_id_from_headers(headers: &HeaderMap) -> Option<String> {
    headers
        .get_all(COOKIE)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(';'))
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(name, _)| *name == SESSION_COOKIE)
        .map(|(_, value)| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reads_session_cookie_among_others() {
        let mut headers = HeaderMap::new();
        headers.insert(
            COOKIE,
            HeaderValue::from_static("theme=dark; matilda_session=sess_abc ; other=1"),
        );
        assert_eq!(session_id_from_headers(&headers).as_deref(), Some("sess_abc"));
    }

    #[test]
    fn missing_or_empty_cookie_is_none() {
        let headers = HeaderMap::new();
        assert!(session_id_from_headers(&headers).is_none());

        let mut headers = HeaderMap::new();
        headers.insert(COOKIE, HeaderValue::from_static("matilda_session="));
        assert!(session_id_from_headers(&headers).is_none());
    }
}
