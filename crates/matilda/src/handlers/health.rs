use axum::Json;
use axum::extract::State;
use axum::http::StatusCode;
use serde::Serialize;

use crate::server::AppState;

#[derive(Serialize)]
pub struct Readiness {
    status: &'static str,
    model: String,
    sessions: usize,
}

pub async fn livez() -> (StatusCode, &'static str) {
    (StatusCode::OK, "ok")
}

/// The provider configuration is validated before the listener binds, so a
/// running server is ready; report what it is serving.
pub async fn readyz(State(state): State<AppState>) -> (StatusCode, Json<Readiness>) {
    let readiness = Readiness {
        status: "ok",
        model: state.relay.settings().model.clone(),
        sessions: state.sessions.len(),
    };
    (StatusCode::OK, Json(readiness))
}
