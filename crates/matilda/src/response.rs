//! JSON error responses.

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;
use tracing::warn;

use crate::relay::{ProviderErrorKind, RelayError};

/// Message shown to users when the provider could not produce an answer.
pub const APOLOGY: &str = "Sorry, I encountered an error generating a response. Please try again.";

#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kind: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

pub struct ApiError {
    status: StatusCode,
    body: ErrorBody,
}

impl ApiError {
    pub fn new(status: StatusCode, error: impl Into<String>) -> Self {
        Self {
            status,
            body: ErrorBody {
                error: error.into(),
                kind: None,
                detail: None,
            },
        }
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(self.body)).into_response()
    }
}

pub fn bad_request(message: impl Into<String>) -> ApiError {
    ApiError::new(StatusCode::BAD_REQUEST, message)
}

impl From<RelayError> for ApiError {
    fn from(err: RelayError) -> Self {
        match err {
            RelayError::Validation(e) => bad_request(e.to_string()),
            RelayError::Provider(e) => {
                let status = match e.kind {
                    ProviderErrorKind::RateLimited => StatusCode::TOO_MANY_REQUESTS,
                    ProviderErrorKind::Timeout => StatusCode::GATEWAY_TIMEOUT,
                    _ => StatusCode::BAD_GATEWAY,
                };
                // Raw provider bodies for these kinds stay in the server log.
                let detail = match e.kind {
                    ProviderErrorKind::Auth | ProviderErrorKind::Upstream => {
                        warn!(
                            kind = %e.kind,
                            status = ?e.status,
                            detail = %e.detail,
                            "Provider error withheld from client"
                        );
                        None
                    }
                    _ => Some(e.detail),
                };
                Self {
                    status,
                    body: ErrorBody {
                        error: APOLOGY.to_string(),
                        kind: Some(e.kind.as_str()),
                        detail,
                    },
                }
            }
        }
    }
}
