//! Token records and the refresh-token grant
//!
//! A `TokenRecord` is one persisted credential. Records are never edited in
//! place: a refresh produces a new record that replaces the old one in the
//! store.
//!
//! Expiry is computed from `created_at + expires_in` (unix seconds). A token
//! whose expiry instant equals `now` is already expired.

use std::fmt;
use std::time::{Duration, SystemTime};

use common::clock::unix_seconds;
use common::{HINT_LEN, Secret};
use serde::{Deserialize, Deserializer, Serialize};
use tracing::debug;

use crate::constants::{OAuthEndpoints, REFRESH_TOKEN_GRANT};
use crate::error::{Error, Result};

/// One persisted credential.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenRecord {
    pub access_token: String,
    #[serde(default = "default_token_type")]
    pub token_type: String,
    /// Granted scopes. Order is irrelevant.
    #[serde(default, deserialize_with = "scope_list")]
    pub scope: Vec<String>,
    pub host: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    /// Unix seconds
    pub created_at: u64,
    /// Seconds after `created_at`; `None` means the token does not expire
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_in: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token_expires_in: Option<u64>,
}

/// Storage key of a record: `(host, prefix)`.
///
/// The prefix is a display/lookup handle, not a security boundary.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TokenId {
    pub host: String,
    pub prefix: String,
}

impl fmt::Display for TokenId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.host, self.prefix)
    }
}

/// Expiry status relative to a point in time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenState {
    Valid,
    ExpiringSoon,
    Expired,
}

impl TokenState {
    pub fn label(&self) -> &'static str {
        match self {
            TokenState::Valid => "valid",
            TokenState::ExpiringSoon => "expiring_soon",
            TokenState::Expired => "expired",
        }
    }
}

impl TokenRecord {
    /// A non-expiring bearer token (manual import, pre-supplied token).
    pub fn new(access_token: impl Into<String>, host: impl Into<String>, created_at: u64) -> Self {
        Self {
            access_token: access_token.into(),
            token_type: default_token_type(),
            scope: Vec::new(),
            host: host.into(),
            refresh_token: None,
            created_at,
            expires_in: None,
            refresh_token_expires_in: None,
        }
    }

    /// Build a record from a successful token endpoint response.
    pub fn from_response(response: TokenResponse, host: &str, created_at: u64) -> Result<Self> {
        let record = Self {
            access_token: response.access_token,
            token_type: response.token_type.unwrap_or_else(default_token_type),
            scope: response.scope.as_deref().map(split_scope).unwrap_or_default(),
            host: host.to_string(),
            refresh_token: response.refresh_token.filter(|t| !t.is_empty()),
            created_at,
            expires_in: response.expires_in,
            refresh_token_expires_in: response.refresh_token_expires_in,
        };
        record.validate()?;
        Ok(record)
    }

    /// Non-empty access token and host.
    pub fn validate(&self) -> Result<()> {
        if self.access_token.is_empty() {
            return Err(Error::CredentialParse("access_token is empty".into()));
        }
        if self.host.is_empty() {
            return Err(Error::CredentialParse("host is empty".into()));
        }
        Ok(())
    }

    /// First characters of the access token.
    pub fn prefix(&self) -> &str {
        let end = self
            .access_token
            .char_indices()
            .nth(HINT_LEN)
            .map(|(i, _)| i)
            .unwrap_or(self.access_token.len());
        &self.access_token[..end]
    }

    pub fn id(&self) -> TokenId {
        TokenId {
            host: self.host.clone(),
            prefix: self.prefix().to_string(),
        }
    }

    /// Whether `handle` (a prefix of any length) selects this record.
    /// The empty handle selects nothing.
    pub fn matches(&self, handle: &str) -> bool {
        !handle.is_empty() && self.access_token.starts_with(handle)
    }

    pub fn access_secret(&self) -> Secret<String> {
        Secret::new(self.access_token.clone())
    }

    /// Unix seconds at which the access token expires.
    pub fn expires_at(&self) -> Option<u64> {
        self.expires_in.map(|e| self.created_at.saturating_add(e))
    }

    /// Inclusive: expired when `expires_at <= now`.
    pub fn is_expired(&self, now: SystemTime) -> bool {
        self.expires_at()
            .is_some_and(|at| at <= unix_seconds(now))
    }

    pub fn refresh_expires_at(&self) -> Option<u64> {
        self.refresh_token_expires_in
            .map(|e| self.created_at.saturating_add(e))
    }

    pub fn refresh_expired(&self, now: SystemTime) -> bool {
        self.refresh_expires_at()
            .is_some_and(|at| at <= unix_seconds(now))
    }

    pub fn is_refreshable(&self) -> bool {
        self.refresh_token.as_deref().is_some_and(|t| !t.is_empty())
    }

    /// `None` for tokens without an expiry; zero once expired.
    pub fn time_until_expiry(&self, now: SystemTime) -> Option<Duration> {
        self.expires_at()
            .map(|at| Duration::from_secs(at.saturating_sub(unix_seconds(now))))
    }

    pub fn state(&self, now: SystemTime, warning: Duration) -> TokenState {
        match self.time_until_expiry(now) {
            None => TokenState::Valid,
            Some(left) if left.is_zero() => TokenState::Expired,
            Some(left) if left <= warning => TokenState::ExpiringSoon,
            Some(_) => TokenState::Valid,
        }
    }
}

impl fmt::Debug for TokenRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenRecord")
            .field("access_token", &format_args!("{}...", self.prefix()))
            .field("token_type", &self.token_type)
            .field("scope", &self.scope)
            .field("host", &self.host)
            .field(
                "refresh_token",
                &self.refresh_token.as_ref().map(|_| "[REDACTED]"),
            )
            .field("created_at", &self.created_at)
            .field("expires_in", &self.expires_in)
            .field("refresh_token_expires_in", &self.refresh_token_expires_in)
            .finish()
    }
}

fn default_token_type() -> String {
    "bearer".to_string()
}

/// GitHub reports scopes as `"repo,gist"`; stored records use an array.
fn scope_list<'de, D>(deserializer: D) -> std::result::Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Scope {
        List(Vec<String>),
        Joined(String),
    }
    Ok(match Option::<Scope>::deserialize(deserializer)? {
        Some(Scope::List(list)) => list,
        Some(Scope::Joined(joined)) => split_scope(&joined),
        None => Vec::new(),
    })
}

fn split_scope(raw: &str) -> Vec<String> {
    raw.split(|c: char| c == ',' || c.is_whitespace())
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

/// Successful token endpoint payload (device-code poll or refresh).
#[derive(Deserialize, Serialize)]
pub struct TokenResponse {
    pub access_token: String,
    #[serde(default)]
    pub token_type: Option<String>,
    #[serde(default)]
    pub scope: Option<String>,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default)]
    pub expires_in: Option<u64>,
    #[serde(default)]
    pub refresh_token_expires_in: Option<u64>,
}

impl fmt::Debug for TokenResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenResponse")
            .field("access_token", &"[REDACTED]")
            .field("token_type", &self.token_type)
            .field("scope", &self.scope)
            .field("expires_in", &self.expires_in)
            .finish_non_exhaustive()
    }
}

/// OAuth error payload. GitHub returns these with HTTP 200.
#[derive(Debug, Clone, Deserialize)]
pub struct OAuthError {
    pub error: String,
    #[serde(default)]
    pub error_description: Option<String>,
    /// Present on `slow_down`
    #[serde(default)]
    pub interval: Option<u64>,
}

impl fmt::Display for OAuthError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.error_description {
            Some(desc) => write!(f, "{}: {desc}", self.error),
            None => f.write_str(&self.error),
        }
    }
}

/// Either outcome of a token endpoint call.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum TokenEndpointResponse {
    Token(TokenResponse),
    Error(OAuthError),
}

/// Exchange a refresh token for a new token pair.
///
/// Network failures and 5xx map to `Error::Http` (worth retrying); a
/// rejected refresh token maps to `Error::InvalidCredentials`.
pub async fn refresh_token(
    client: &reqwest::Client,
    endpoints: &OAuthEndpoints,
    client_id: &str,
    client_secret: Option<&Secret<String>>,
    refresh: &str,
) -> Result<TokenResponse> {
    let mut form = vec![
        ("client_id", client_id),
        ("grant_type", REFRESH_TOKEN_GRANT),
        ("refresh_token", refresh),
    ];
    if let Some(secret) = client_secret {
        form.push(("client_secret", secret.expose().as_str()));
    }

    let response = client
        .post(&endpoints.token)
        .header(reqwest::header::ACCEPT, "application/json")
        .form(&form)
        .send()
        .await
        .map_err(|e| Error::Http(format!("token refresh request failed: {e}")))?;

    let status = response.status();
    if !status.is_success() {
        let body = response
            .text()
            .await
            .unwrap_or_else(|_| String::from("<no body>"));

        // 401/403 means the refresh token is revoked or invalid
        if status.as_u16() == 401 || status.as_u16() == 403 {
            return Err(Error::InvalidCredentials(format!(
                "refresh token rejected ({status}): {body}"
            )));
        }
        if status.is_server_error() {
            return Err(Error::Http(format!("token refresh returned {status}")));
        }
        return Err(Error::TokenExchange(format!(
            "token refresh returned {status}: {body}"
        )));
    }

    match response
        .json::<TokenEndpointResponse>()
        .await
        .map_err(|e| Error::TokenExchange(format!("invalid refresh response: {e}")))?
    {
        TokenEndpointResponse::Token(token) => {
            debug!(expires_in = ?token.expires_in, "refresh token exchanged");
            Ok(token)
        }
        TokenEndpointResponse::Error(err) => Err(Error::InvalidCredentials(format!(
            "refresh rejected: {err}"
        ))),
    }
}
