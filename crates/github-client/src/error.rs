//! Error types for GitHub API calls

use crate::ratelimit::RateLimitInfo;
use provider::ProviderError;

/// Terminal outcome of `GitHubClient::request`.
///
/// Retryable failures are absorbed by the retry loop; only exhausted or
/// terminal errors reach the caller. HTTP errors carry the status and the
/// rate-limit snapshot of the failing response.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("network error: {0}")]
    Network(String),

    #[error("authentication required: {0}")]
    AuthenticationRequired(String),

    #[error("rate limited (HTTP {status}): {message}")]
    RateLimited {
        status: u16,
        message: String,
        rate_limit: Option<RateLimitInfo>,
    },

    #[error("not found: {message}")]
    NotFound {
        message: String,
        rate_limit: Option<RateLimitInfo>,
    },

    #[error("forbidden: {message}")]
    Forbidden {
        message: String,
        rate_limit: Option<RateLimitInfo>,
    },

    #[error("validation failed: {message}")]
    Validation {
        message: String,
        rate_limit: Option<RateLimitInfo>,
    },

    #[error("GitHub API error (HTTP {status}): {message}")]
    Api {
        status: u16,
        message: String,
        rate_limit: Option<RateLimitInfo>,
    },

    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

/// Result alias for API calls.
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// HTTP status of the failing response, if there was one.
    pub fn status(&self) -> Option<u16> {
        match self {
            Error::RateLimited { status, .. } | Error::Api { status, .. } => Some(*status),
            Error::NotFound { .. } => Some(404),
            Error::Forbidden { .. } => Some(403),
            Error::Validation { .. } => Some(422),
            _ => None,
        }
    }

    pub fn rate_limit(&self) -> Option<&RateLimitInfo> {
        match self {
            Error::RateLimited { rate_limit, .. }
            | Error::NotFound { rate_limit, .. }
            | Error::Forbidden { rate_limit, .. }
            | Error::Validation { rate_limit, .. }
            | Error::Api { rate_limit, .. } => rate_limit.as_ref(),
            _ => None,
        }
    }

    pub fn is_authentication_required(&self) -> bool {
        matches!(self, Error::AuthenticationRequired(_))
    }

    /// Build the terminal error for a non-success response.
    pub(crate) fn from_response(
        status: u16,
        body: &str,
        rate_limit: Option<RateLimitInfo>,
        rate_limited: bool,
    ) -> Self {
        let message = error_message(body);
        if rate_limited {
            return Error::RateLimited {
                status,
                message,
                rate_limit,
            };
        }
        match status {
            401 => Error::AuthenticationRequired(message),
            403 => Error::Forbidden {
                message,
                rate_limit,
            },
            404 => Error::NotFound {
                message,
                rate_limit,
            },
            422 => Error::Validation {
                message,
                rate_limit,
            },
            _ => Error::Api {
                status,
                message,
                rate_limit,
            },
        }
    }
}

impl From<ProviderError> for Error {
    fn from(err: ProviderError) -> Self {
        match err {
            ProviderError::AuthenticationRequired(msg) => Error::AuthenticationRequired(msg),
            ProviderError::Internal(msg) => {
                Error::AuthenticationRequired(format!("credential unavailable: {msg}"))
            }
        }
    }
}

/// GitHub error bodies look like `{"message": "...", "documentation_url": "..."}`.
/// Falls back to the raw body, truncated.
fn error_message(body: &str) -> String {
    const MAX: usize = 200;
    if let Ok(value) = serde_json::from_str::<serde_json::Value>(body)
        && let Some(message) = value.get("message").and_then(|m| m.as_str())
    {
        return message.to_string();
    }
    let trimmed = body.trim();
    if trimmed.is_empty() {
        return "no response body".into();
    }
    trimmed.chars().take(MAX).collect()
}
