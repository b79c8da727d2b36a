//! Relay error taxonomy.

use std::fmt;
use std::time::Duration;

use thiserror::Error;

use crate::llm::LLMError;
use crate::session::ValidationError;

/// What went wrong talking to the provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderErrorKind {
    /// Credentials were rejected (401/403).
    Auth,
    /// The provider throttled the request (429).
    RateLimited,
    /// No definitive answer within the configured timeout.
    Timeout,
    /// Connection-level failure.
    Network,
    /// The provider answered without any completion text.
    EmptyResponse,
    /// The response body could not be understood.
    Malformed,
    /// Any other non-success status from the provider.
    Upstream,
}

impl ProviderErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderErrorKind::Auth => "auth",
            ProviderErrorKind::RateLimited => "rate_limited",
            ProviderErrorKind::Timeout => "timeout",
            ProviderErrorKind::Network => "network",
            ProviderErrorKind::EmptyResponse => "empty_response",
            ProviderErrorKind::Malformed => "malformed",
            ProviderErrorKind::Upstream => "upstream",
        }
    }
}

impl fmt::Display for ProviderErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A provider failure surfaced to the caller. The relay never retries.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("provider error ({kind}): {detail}")]
pub struct ProviderError {
    pub kind: ProviderErrorKind,
    pub detail: String,
    /// HTTP status returned by the provider, when there was one.
    pub status: Option<u16>,
}

impl ProviderError {
    pub fn new(kind: ProviderErrorKind, detail: impl Into<String>) -> Self {
        Self {
            kind,
            detail: detail.into(),
            status: None,
        }
    }

    pub fn timeout(after: Duration) -> Self {
        Self::new(
            ProviderErrorKind::Timeout,
            format!("no response within {}s", after.as_secs_f32()),
        )
    }

    pub fn empty_response() -> Self {
        Self::new(
            ProviderErrorKind::EmptyResponse,
            "provider returned no completion text",
        )
    }

    fn with_status(mut self, status: u16) -> Self {
        self.status = Some(status);
        self
    }

    /// Whether retrying the same request later could reasonably succeed.
    pub fn is_transient(&self) -> bool {
        match self.kind {
            ProviderErrorKind::Timeout | ProviderErrorKind::Network => true,
            ProviderErrorKind::Upstream => self.status.is_some_and(|s| s >= 500),
            _ => false,
        }
    }
}

impl From<LLMError> for ProviderError {
    fn from(err: LLMError) -> Self {
        match err {
            LLMError::Request(e) if e.is_timeout() => {
                ProviderError::new(ProviderErrorKind::Timeout, e.to_string())
            }
            LLMError::Request(e) if e.is_decode() => {
                ProviderError::new(ProviderErrorKind::Malformed, e.to_string())
            }
            LLMError::Request(e) => ProviderError::new(ProviderErrorKind::Network, e.to_string()),
            LLMError::RateLimit { retry_after } => {
                let detail = match retry_after {
                    Some(secs) => format!("rate limited, retry after {secs}s"),
                    None => "rate limited".to_string(),
                };
                ProviderError::new(ProviderErrorKind::RateLimited, detail).with_status(429)
            }
            LLMError::Api { status, message } => {
                let kind = match status {
                    401 | 403 => ProviderErrorKind::Auth,
                    408 | 504 => ProviderErrorKind::Timeout,
                    429 => ProviderErrorKind::RateLimited,
                    _ => ProviderErrorKind::Upstream,
                };
                ProviderError::new(kind, message).with_status(status)
            }
            LLMError::Malformed(detail) => ProviderError::new(ProviderErrorKind::Malformed, detail),
        }
    }
}

/// Errors returned by the relay.
#[derive(Debug, Error)]
pub enum RelayError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Provider(#[from] ProviderError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn maps_api_statuses_to_kinds() {
        let cases = [
            (401, ProviderErrorKind::Auth),
            (403, ProviderErrorKind::Auth),
            (408, ProviderErrorKind::Timeout),
            (429, ProviderErrorKind::RateLimited),
            (400, ProviderErrorKind::Upstream),
            (503, ProviderErrorKind::Upstream),
        ];
        for (status, kind) in cases {
            let err = ProviderError::from(LLMError::Api {
                status,
                message: "nope".to_string(),
            });
            assert_eq!(err.kind, kind, "status {status}");
            assert_eq!(err.status, Some(status));
        }
    }

    #[test]
    fn maps_rate_limit_and_malformed() {
        let err = ProviderError::from(LLMError::RateLimit {
            retry_after: Some(7),
        });
        assert_eq!(err.kind, ProviderErrorKind::RateLimited);
        assert!(err.detail.contains("7s"));

        let err = ProviderError::from(LLMError::Malformed("bad json".to_string()));
        assert_eq!(err.kind, ProviderErrorKind::Malformed);
    }

    #[test]
    fn transient_only_for_timeouts_network_and_5xx() {
        assert!(ProviderError::timeout(Duration::from_secs(1)).is_transient());
        assert!(ProviderError::new(ProviderErrorKind::Network, "reset").is_transient());
        assert!(
            ProviderError::from(LLMError::Api {
                status: 502,
                message: String::new()
            })
            .is_transient()
        );
        assert!(
            !ProviderError::from(LLMError::Api {
                status: 400,
                message: String::new()
            })
            .is_transient()
        );
        assert!(
            !ProviderError::from(LLMError::Api {
                status: 401,
                message: String::new()
            })
            .is_transient()
        );
        assert!(!ProviderError::empty_response().is_transient());
    }

    #[test]
    fn display_includes_kind() {
        let err = ProviderError::timeout(Duration::from_millis(1500));
        assert_eq!(err.to_string(), "provider error (timeout): no response within 1.5s");
    }
}
