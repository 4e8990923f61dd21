//! GitHub OAuth constants
//!
//! Public OAuth client configuration. These values are not secrets; they
//! identify the public client application. The actual secrets (access and
//! refresh tokens) live in the token store.

use std::time::Duration;

/// Public OAuth App client ID used when none is configured
pub const DEFAULT_CLIENT_ID: &str = "Iv1.c42d2e9c91e3a928";

/// Scopes requested when the caller does not override them
pub const DEFAULT_SCOPES: &[&str] = &["repo", "read:user", "user:email", "gist", "workflow"];

/// RFC 8628 grant type for device-code polling
pub const DEVICE_CODE_GRANT: &str = "urn:ietf:params:oauth:grant-type:device_code";

/// Grant type for exchanging a refresh token
pub const REFRESH_TOKEN_GRANT: &str = "refresh_token";

/// Added to the poll interval on every `slow_down` response
pub const SLOW_DOWN_INCREMENT: Duration = Duration::from_secs(5);

/// Tokens expiring within this window report `TokenState::ExpiringSoon`
pub const EXPIRY_WARNING: Duration = Duration::from_secs(300);

/// Poll interval used when the device-code response omits one
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(5);

/// Service name for keyring entries
pub const KEYRING_SERVICE: &str = "gh-session";

/// OAuth endpoints for one GitHub host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OAuthEndpoints {
    pub device_code: String,
    pub token: String,
}

impl OAuthEndpoints {
    /// `https://{host}/login/device/code` and `https://{host}/login/oauth/access_token`.
    /// Works for github.com and enterprise hosts alike.
    pub fn for_host(host: &str) -> Self {
        Self::with_origin(&format!("https://{host}"))
    }

    /// Same paths under an arbitrary origin (e.g. a mock server).
    pub fn with_origin(origin: &str) -> Self {
        let origin = origin.trim_end_matches('/');
        Self {
            device_code: format!("{origin}/login/device/code"),
            token: format!("{origin}/login/oauth/access_token"),
        }
    }
}
