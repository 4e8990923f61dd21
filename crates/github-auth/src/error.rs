//! Error types for GitHub authentication operations

use provider::ProviderError;

/// Errors from authentication operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("HTTP request failed: {0}")]
    Http(String),

    #[error("token exchange failed: {0}")]
    TokenExchange(String),

    #[error("invalid credentials: {0}")]
    InvalidCredentials(String),

    #[error("credential parse error: {0}")]
    CredentialParse(String),

    #[error("I/O error: {0}")]
    Io(String),

    #[error("secret backend error: {0}")]
    Backend(String),

    #[error("encryption error: {0}")]
    Crypto(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("authentication required: {0}")]
    AuthenticationRequired(String),

    #[error("device authorization denied by the user")]
    DeviceFlowDenied,

    #[error("device code expired before authorization completed")]
    DeviceFlowExpired,

    #[error("device flow failed: {0}")]
    DeviceFlowFailed(String),

    #[error("device flow cancelled")]
    DeviceFlowCancelled,

    #[error(transparent)]
    Refresh(#[from] RefreshError),
}

/// Result alias for auth operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Why a refresh could not produce a new token.
///
/// `Clone` so one settled outcome can be handed to every waiter. Every
/// variant means the user has to log in again.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RefreshError {
    #[error("token has no refresh token")]
    NotRefreshable,

    #[error("refresh token expired")]
    RefreshTokenExpired,

    #[error("refresh rejected: {0}")]
    Rejected(String),

    #[error("refresh failed after retries: {0}")]
    Network(String),

    #[error("failed to store refreshed token: {0}")]
    Store(String),
}

impl From<RefreshError> for ProviderError {
    fn from(err: RefreshError) -> Self {
        ProviderError::AuthenticationRequired(format!("{err}; log in again"))
    }
}

impl From<Error> for ProviderError {
    fn from(err: Error) -> Self {
        match err {
            Error::AuthenticationRequired(msg) => ProviderError::AuthenticationRequired(msg),
            Error::Refresh(e) => e.into(),
            Error::InvalidCredentials(msg) => ProviderError::AuthenticationRequired(msg),
            other => ProviderError::Internal(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn refresh_errors_downgrade_to_authentication_required() {
        let err: ProviderError = RefreshError::NotRefreshable.into();
        assert!(matches!(
            err,
            ProviderError::AuthenticationRequired(ref m) if m.contains("log in")
        ));

        let err: ProviderError = Error::Refresh(RefreshError::RefreshTokenExpired).into();
        assert!(matches!(err, ProviderError::AuthenticationRequired(_)));
    }

    #[test]
    fn storage_errors_are_internal() {
        let err: ProviderError = Error::Io("disk full".into()).into();
        assert!(matches!(err, ProviderError::Internal(ref m) if m.contains("disk full")));
    }
}
