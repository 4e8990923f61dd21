//! Configuration types and loading
//!
//! Config precedence: env vars > config file > defaults. Every field has a
//! default, so `Config::from_env()` works with no file at all. Secrets (the
//! pre-supplied token, the OAuth client secret, the storage passphrase) are
//! loaded from env vars or a dedicated file, never stored in the TOML.

use crate::Secret;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Public github.com API origin.
pub const GITHUB_API_URL: &str = "https://api.github.com";

/// Default OAuth host.
pub const GITHUB_HOST: &str = "github.com";

/// Root configuration
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub api: ApiConfig,
    pub oauth: OAuthConfig,
    pub storage: StorageConfig,
    /// Pre-supplied token from GH_TOKEN / GITHUB_TOKEN; bypasses device flow.
    #[serde(skip)]
    pub token: Option<Secret<String>>,
    /// Passphrase for the encrypted token backend (GH_SESSION_PASSPHRASE).
    #[serde(skip)]
    pub passphrase: Option<Secret<String>>,
}

/// REST client settings
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    pub base_url: String,
    /// Per-request ceiling; a request stuck longer is a transient failure.
    pub timeout_secs: u64,
    pub max_retries: u32,
    pub base_delay_ms: u64,
    pub backoff_multiplier: f64,
    /// Remaining/limit fraction at or below which requests are held back
    /// until the rate-limit window resets.
    pub throttle_threshold: f64,
    /// Overall cap on time spent waiting out rate limits for one request.
    pub rate_limit_budget_secs: u64,
    pub user_agent: String,
}

/// Device flow / refresh settings
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct OAuthConfig {
    pub host: String,
    pub client_id: String,
    pub scopes: Vec<String>,
    /// Path to a file containing the OAuth client secret (alternative to GH_CLIENT_SECRET)
    pub client_secret_file: Option<PathBuf>,
    #[serde(skip)]
    pub client_secret: Option<Secret<String>>,
    pub max_transient_poll_failures: u32,
}

/// Token persistence settings
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Defaults to the platform config dir (e.g. ~/.config/gh-session)
    pub dir: Option<PathBuf>,
    pub backend: StorageBackend,
}

/// Which secret backend holds persisted tokens
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    #[default]
    Plaintext,
    Encrypted,
    Keyring,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            base_url: GITHUB_API_URL.to_string(),
            timeout_secs: 30,
            max_retries: 3,
            base_delay_ms: 1000,
            backoff_multiplier: 2.0,
            throttle_threshold: 0.1,
            rate_limit_budget_secs: 900,
            user_agent: concat!("gh-session/", env!("CARGO_PKG_VERSION")).to_string(),
        }
    }
}

impl Default for OAuthConfig {
    fn default() -> Self {
        Self {
            host: GITHUB_HOST.to_string(),
            client_id: "Iv1.c42d2e9c91e3a928".to_string(),
            scopes: ["repo", "read:user", "user:email", "gist", "workflow"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            client_secret_file: None,
            client_secret: None,
            max_transient_poll_failures: 3,
        }
    }
}

impl ApiConfig {
    pub fn timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.timeout_secs)
    }

    pub fn base_delay(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.base_delay_ms)
    }

    pub fn rate_limit_budget(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.rate_limit_budget_secs)
    }
}

impl StorageConfig {
    /// Configured directory, or the platform default.
    pub fn resolved_dir(&self) -> PathBuf {
        self.dir.clone().unwrap_or_else(default_dir)
    }
}

impl Config {
    /// Load configuration from a TOML file, then overlay environment variables.
    pub fn load(path: &Path) -> crate::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let mut config: Config = toml::from_str(&contents)?;
        config.apply_env()?;
        config.validate()?;
        debug!(path = %path.display(), host = %config.oauth.host, "configuration loaded");
        Ok(config)
    }

    /// Defaults overlaid with environment variables, no file involved.
    pub fn from_env() -> crate::Result<Self> {
        let mut config = Config::default();
        config.apply_env()?;
        config.validate()?;
        Ok(config)
    }

    /// Resolve config file path from CLI arg or CONFIG_PATH env var.
    pub fn resolve_path(cli_path: Option<&str>) -> PathBuf {
        if let Some(p) = cli_path {
            return PathBuf::from(p);
        }
        if let Ok(p) = std::env::var("CONFIG_PATH") {
            return PathBuf::from(p);
        }
        default_dir().join("config.toml")
    }

    /// Overlay environment inputs.
    ///
    /// - Token: GH_TOKEN, then GITHUB_TOKEN
    /// - Host: GH_HOST (also derives the API base URL)
    /// - API base URL: GITHUB_API_URL (wins over the GH_HOST derivation)
    /// - Scopes: GH_SCOPES, comma or whitespace separated
    /// - Client secret: GH_CLIENT_SECRET, then `oauth.client_secret_file`
    /// - Passphrase: GH_SESSION_PASSPHRASE
    fn apply_env(&mut self) -> crate::Result<()> {
        self.token = non_empty_env("GH_TOKEN")
            .or_else(|| non_empty_env("GITHUB_TOKEN"))
            .map(Secret::new);

        if let Some(host) = non_empty_env("GH_HOST") {
            self.api.base_url = api_base_for_host(&host);
            self.oauth.host = host;
        }
        if let Some(url) = non_empty_env("GITHUB_API_URL") {
            self.api.base_url = url;
        }

        if let Some(scopes) = non_empty_env("GH_SCOPES") {
            self.oauth.scopes = split_scopes(&scopes);
        }

        if let Some(secret) = non_empty_env("GH_CLIENT_SECRET") {
            self.oauth.client_secret = Some(Secret::new(secret));
        } else if let Some(ref secret_file) = self.oauth.client_secret_file {
            let secret = std::fs::read_to_string(secret_file).map_err(|e| {
                crate::Error::Config(format!(
                    "failed to read client_secret_file {}: {e}",
                    secret_file.display()
                ))
            })?;
            let secret = secret.trim().to_owned();
            if !secret.is_empty() {
                self.oauth.client_secret = Some(Secret::new(secret));
            }
        }

        self.passphrase = non_empty_env("GH_SESSION_PASSPHRASE").map(Secret::new);
        Ok(())
    }

    fn validate(&self) -> crate::Result<()> {
        if !self.api.base_url.starts_with("http://") && !self.api.base_url.starts_with("https://")
        {
            return Err(crate::Error::InvalidValue {
                field: "api.base_url",
                reason: format!(
                    "must start with http:// or https://, got: {}",
                    self.api.base_url
                ),
            });
        }
        if self.api.timeout_secs == 0 {
            return Err(crate::Error::InvalidValue {
                field: "api.timeout_secs",
                reason: "must be greater than 0".into(),
            });
        }
        if self.api.base_delay_ms == 0 {
            return Err(crate::Error::InvalidValue {
                field: "api.base_delay_ms",
                reason: "must be greater than 0".into(),
            });
        }
        if self.api.backoff_multiplier < 1.0 {
            return Err(crate::Error::InvalidValue {
                field: "api.backoff_multiplier",
                reason: format!("must be at least 1.0, got {}", self.api.backoff_multiplier),
            });
        }
        if !(0.0..1.0).contains(&self.api.throttle_threshold) {
            return Err(crate::Error::InvalidValue {
                field: "api.throttle_threshold",
                reason: format!(
                    "must be in [0.0, 1.0), got {}",
                    self.api.throttle_threshold
                ),
            });
        }
        if self.oauth.client_id.trim().is_empty() {
            return Err(crate::Error::InvalidValue {
                field: "oauth.client_id",
                reason: "must not be empty".into(),
            });
        }
        if self.oauth.host.trim().is_empty() {
            return Err(crate::Error::InvalidValue {
                field: "oauth.host",
                reason: "must not be empty".into(),
            });
        }
        Ok(())
    }
}

/// REST API origin for an OAuth host: github.com maps to api.github.com,
/// enterprise hosts serve the API under `/api/v3`.
pub fn api_base_for_host(host: &str) -> String {
    if host == GITHUB_HOST {
        GITHUB_API_URL.to_string()
    } else {
        format!("https://{host}/api/v3")
    }
}

/// Split a scope list on commas and whitespace, dropping empties.
pub fn split_scopes(raw: &str) -> Vec<String> {
    raw.split(|c: char| c == ',' || c.is_whitespace())
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

fn non_empty_env(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|v| v.trim().to_owned())
        .filter(|v| !v.is_empty())
}

fn default_dir() -> PathBuf {
    directories::ProjectDirs::from("", "", "gh-session")
        .map(|dirs| dirs.config_dir().to_path_buf())
        .unwrap_or_else(|| PathBuf::from(".gh-session"))
}
