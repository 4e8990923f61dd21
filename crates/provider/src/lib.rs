//! Credential abstraction for GitHub API authentication
//!
//! Defines the `CredentialProvider` trait that decouples the HTTP client from
//! the authentication strategy. `StaticTokenProvider` wraps a pre-supplied
//! token (GH_TOKEN); the device-flow authenticator implements the same trait
//! with a token store and single-flight refresh behind it.

pub mod static_token;

pub use static_token::StaticTokenProvider;

use common::Secret;
use reqwest::header::HeaderValue;
use std::future::Future;
use std::pin::Pin;

/// Errors from credential operations (lookup, refresh)
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProviderError {
    /// No usable token: never logged in, expired without a refresh token,
    /// or the refresh itself failed. The user has to log in again.
    #[error("authentication required: {0}")]
    AuthenticationRequired(String),

    #[error("internal provider error: {0}")]
    Internal(String),
}

/// Result alias for provider operations.
pub type Result<T> = std::result::Result<T, ProviderError>;

/// A bearer credential handed to the HTTP client for one or more requests.
#[derive(Debug, Clone, PartialEq)]
pub struct BearerToken {
    token: Secret<String>,
    refreshable: bool,
}

impl BearerToken {
    pub fn new(token: impl Into<Secret<String>>, refreshable: bool) -> Self {
        Self {
            token: token.into(),
            refreshable,
        }
    }

    pub fn secret(&self) -> &Secret<String> {
        &self.token
    }

    /// Non-secret handle for logs (first characters of the token).
    pub fn hint(&self) -> &str {
        self.token.hint()
    }

    /// Whether a 401 on this token is worth a refresh attempt.
    pub fn is_refreshable(&self) -> bool {
        self.refreshable
    }

    /// `Authorization` header value, marked sensitive so it is never printed.
    pub fn authorization(&self) -> Result<HeaderValue> {
        let mut value = HeaderValue::from_str(&format!("Bearer {}", self.token.expose()))
            .map_err(|_| {
                ProviderError::Internal("token contains invalid header characters".into())
            })?;
        value.set_sensitive(true);
        Ok(value)
    }
}

/// Source of bearer tokens for outgoing GitHub requests.
///
/// Uses `Pin<Box<dyn Future>>` return types for dyn-compatibility
/// (`Arc<dyn CredentialProvider>`).
pub trait CredentialProvider: Send + Sync {
    /// Identifier for logging (e.g. "static", "device-flow")
    fn id(&self) -> &str;

    /// Token to attach to the next request.
    fn credential(&self) -> Pin<Box<dyn Future<Output = Result<BearerToken>> + Send + '_>>;

    /// Called once after the API rejected `rejected` with 401. Returns a
    /// replacement token to retry with, or `AuthenticationRequired`.
    fn refresh<'a>(
        &'a self,
        rejected: &'a BearerToken,
    ) -> Pin<Box<dyn Future<Output = Result<BearerToken>> + Send + 'a>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn authorization_header_is_sensitive() {
        let token = BearerToken::new("ghu_abcdef", true);
        let header = token.authorization().unwrap();
        assert_eq!(header.to_str().unwrap(), "Bearer ghu_abcdef");
        assert!(header.is_sensitive());
    }

    #[test]
    fn invalid_token_characters_rejected() {
        let token = BearerToken::new("bad\ntoken", false);
        assert!(matches!(
            token.authorization(),
            Err(ProviderError::Internal(_))
        ));
    }

    #[test]
    fn debug_does_not_leak_token() {
        let token = BearerToken::new("ghp_supersecretvalue", false);
        let debug = format!("{token:?}");
        assert!(!debug.contains("supersecretvalue"));
        assert_eq!(token.hint(), "ghp_");
    }
}
