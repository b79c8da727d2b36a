//! HTTP API tests driving the router with a scripted provider.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use axum::Router;
use axum::body::Body;
use axum::http::{Request, StatusCode, header};
use http_body_util::BodyExt;
use serde_json::{Value, json};
use tower::ServiceExt;

use matilda::llm::{
    ChatRequest, ChatResponse, ChatStream, Choice, ChoiceMessage, LLMError, LLMProvider, Role,
};
use matilda::persona::Persona;
use matilda::relay::{Relay, RelaySettings};
use matilda::server::{AppState, build_app};
use matilda::session::{ConversationTemplate, SessionStore};

/// Answers "echo: <last user message>", except for a few magic inputs.
struct ScriptedProvider;

#[async_trait]
impl LLMProvider for ScriptedProvider {
    async fn chat(&self, request: ChatRequest) -> Result<ChatResponse, LLMError> {
        let last = request
            .messages
            .iter()
            .rev()
            .find(|m| m.role == Role::User)
            .map(|m| m.content.clone())
            .unwrap_or_default();

        match last.as_str() {
            "hang" => futures::future::pending().await,
            "busy" => Err(LLMError::RateLimit { retry_after: None }),
            "broken" => Err(LLMError::Api {
                status: 500,
                message: "internal".to_string(),
            }),
            _ => Ok(ChatResponse {
                id: "cmpl-1".to_string(),
                choices: vec![Choice {
                    index: 0,
                    message: Some(ChoiceMessage {
                        role: Some(Role::Assistant),
                        content: Some(format!("echo: {last}")),
                    }),
                    finish_reason: Some("stop".to_string()),
                }],
                usage: None,
            }),
        }
    }

    async fn chat_stream(&self, _request: ChatRequest) -> Result<ChatStream, LLMError> {
        Err(LLMError::Malformed("streaming not scripted".to_string()))
    }
}

fn test_app() -> (Router, SessionStore) {
    let persona = Persona::default();
    let sessions = SessionStore::new(ConversationTemplate {
        persona: Some(persona.clone()),
        memory_limit: None,
        transcript_dir: None,
    });
    let relay = Relay::new(
        Arc::new(ScriptedProvider),
        RelaySettings {
            model: "test-model".to_string(),
            max_tokens: 64,
            temperature: 0.7,
            top_p: None,
            top_k: None,
            timeout: Duration::from_millis(100),
            persona: Some(persona),
        },
    );
    let state = AppState {
        sessions: sessions.clone(),
        relay: Arc::new(relay),
    };
    (build_app(state, 5), sessions)
}

fn chat_request(message: &str, cookie: Option<&str>) -> Request<Body> {
    let mut builder = Request::builder()
        .method("POST")
        .uri("/api/chat")
        .header(header::CONTENT_TYPE, "application/json");
    if let Some(cookie) = cookie {
        builder = builder.header(header::COOKIE, cookie);
    }
    builder
        .body(Body::from(json!({ "message": message }).to_string()))
        .unwrap()
}

/// `name=value` part of the response's Set-Cookie header, if any.
fn session_cookie(response: &axum::response::Response) -> Option<String> {
    response
        .headers()
        .get(header::SET_COOKIE)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(';').next())
        .map(str::to_string)
}

async fn body_json(response: axum::response::Response) -> Value {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap()
}

async fn history_len(sessions: &SessionStore, cookie: &str) -> usize {
    let id = cookie.trim_start_matches("matilda_session=");
    let session = sessions.get(id).expect("session exists");
    let conversation = session.lock().await;
    conversation.history().len()
}

#[tokio::test]
async fn livez_and_readyz_are_ok() {
    let (app, _) = test_app();
    let response = app
        .clone()
        .oneshot(Request::get("/livez").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    app.clone().oneshot(chat_request("hi", None)).await.unwrap();
    let response = app
        .oneshot(Request::get("/readyz").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["status"], "ok");
    assert_eq!(body["model"], "test-model");
    assert_eq!(body["sessions"], 1);
}

#[tokio::test]
async fn cookieless_clients_do_not_accumulate_sessions() {
    let (app, sessions) = test_app();
    for _ in 0..50 {
        let response = app
            .clone()
            .oneshot(Request::get("/api/greeting").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }
    assert_eq!(sessions.len(), 50);

    let later = Instant::now() + Duration::from_secs(120);
    assert_eq!(sessions.evict_idle(later, Duration::from_secs(60)), 50);
    assert!(sessions.is_empty());
}

#[tokio::test]
async fn evicted_session_cookie_gets_a_fresh_session() {
    let (app, sessions) = test_app();
    let response = app.clone().oneshot(chat_request("hi", None)).await.unwrap();
    let cookie = session_cookie(&response).unwrap();

    sessions.evict_idle(Instant::now(), Duration::ZERO);
    let response = app.oneshot(chat_request("again", Some(&cookie))).await.unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let renewed = session_cookie(&response).expect("new cookie issued");
    assert_ne!(renewed, cookie);
    assert_eq!(history_len(&sessions, &renewed).await, 3);
}

#[tokio::test]
async fn greeting_issues_cookie_and_is_recorded() {
    let (app, sessions) = test_app();
    let response = app
        .oneshot(Request::get("/api/greeting").body(Body::empty()).unwrap())
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let cookie = session_cookie(&response).expect("cookie issued");
    assert!(cookie.starts_with("matilda_session=sess_"));

    let body = body_json(response).await;
    let greeting = body["greeting"].as_str().unwrap();
    assert!(greeting.starts_with("Good "));
    assert!(greeting.contains("I am Matilda, your personal AI assistant."));

    // persona + greeting
    assert_eq!(history_len(&sessions, &cookie).await, 2);
}

#[tokio::test]
async fn chat_reuses_session_and_grows_history() {
    let (app, sessions) = test_app();

    let response = app
        .clone()
        .oneshot(chat_request("hi", None))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let cookie = session_cookie(&response).expect("cookie issued");
    let body = body_json(response).await;
    assert_eq!(body["response"], "echo: hi");
    assert!(body["timestamp"].as_str().is_some());

    let response = app
        .clone()
        .oneshot(chat_request("tell me a joke", Some(&cookie)))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert!(session_cookie(&response).is_none());
    assert_eq!(body_json(response).await["response"], "echo: tell me a joke");

    assert_eq!(history_len(&sessions, &cookie).await, 5);
    assert_eq!(sessions.len(), 1);
}

#[tokio::test]
async fn sessions_do_not_share_history() {
    let (app, sessions) = test_app();

    let first = app.clone().oneshot(chat_request("one", None)).await.unwrap();
    let second = app.clone().oneshot(chat_request("two", None)).await.unwrap();
    let first = session_cookie(&first).unwrap();
    let second = session_cookie(&second).unwrap();

    assert_ne!(first, second);
    assert_eq!(history_len(&sessions, &first).await, 3);
    assert_eq!(history_len(&sessions, &second).await, 3);
}

#[tokio::test]
async fn empty_message_is_bad_request() {
    let (app, sessions) = test_app();
    let response = app.oneshot(chat_request("   ", None)).await.unwrap();

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let cookie = session_cookie(&response).unwrap();
    let body = body_json(response).await;
    assert!(body["error"].as_str().is_some());
    assert_eq!(history_len(&sessions, &cookie).await, 1);
}

#[tokio::test]
async fn provider_failures_map_to_statuses() {
    let cases = [
        ("hang", StatusCode::GATEWAY_TIMEOUT, "timeout"),
        ("busy", StatusCode::TOO_MANY_REQUESTS, "rate_limited"),
        ("broken", StatusCode::BAD_GATEWAY, "upstream"),
    ];

    for (message, status, kind) in cases {
        let (app, sessions) = test_app();
        let response = app.oneshot(chat_request(message, None)).await.unwrap();

        assert_eq!(response.status(), status, "{message}");
        let cookie = session_cookie(&response).unwrap();
        let body = body_json(response).await;
        assert_eq!(body["kind"], kind);
        assert!(body["error"].as_str().unwrap().contains("Please try again"));

        // persona + user turn, no assistant turn
        assert_eq!(history_len(&sessions, &cookie).await, 2, "{message}");
    }
}

#[tokio::test]
async fn clear_keeps_only_the_persona() {
    let (app, sessions) = test_app();
    let response = app
        .clone()
        .oneshot(chat_request("hi", None))
        .await
        .unwrap();
    let cookie = session_cookie(&response).unwrap();
    assert_eq!(history_len(&sessions, &cookie).await, 3);

    let response = app
        .oneshot(
            Request::post("/api/clear")
                .header(header::COOKIE, &cookie)
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["status"], "success");
    assert_eq!(body["message"], "Conversation history cleared");
    assert_eq!(history_len(&sessions, &cookie).await, 1);
}
