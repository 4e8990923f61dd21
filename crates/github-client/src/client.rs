//! GitHub REST client: credential, throttle, send, classify, retry

use crate::error::{Error, Result};
use crate::metrics;
use crate::ratelimit::{RateLimitInfo, RateLimitState};
use crate::response::Response;
use crate::retry::{ErrorKind, RetryOutcome, RetryPolicy};
use common::{ApiConfig, Clock};
use provider::{BearerToken, CredentialProvider};
use reqwest::header::{ACCEPT, AUTHORIZATION, HeaderMap, HeaderValue, USER_AGENT};
use reqwest::{Method, Url};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

pub const GITHUB_ACCEPT: &str = "application/vnd.github.v3+json";
pub const API_VERSION_HEADER: &str = "x-github-api-version";
pub const API_VERSION: &str = "2022-11-28";

/// Build the `reqwest::Client` shared by the API client, the device flow and
/// token refresh (one connection pool per process).
pub fn build_http_client(user_agent: &str) -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .user_agent(user_agent)
        .build()
        .map_err(|e| Error::InvalidRequest(format!("failed to build HTTP client: {e}")))
}

pub struct GitHubClient {
    http: reqwest::Client,
    base_url: Url,
    user_agent: HeaderValue,
    timeout: Duration,
    throttle_threshold: f64,
    policy: RetryPolicy,
    credentials: Arc<dyn CredentialProvider>,
    clock: Arc<dyn Clock>,
    rate_limit: Mutex<RateLimitState>,
}

impl GitHubClient {
    pub fn new(
        config: &ApiConfig,
        http: reqwest::Client,
        credentials: Arc<dyn CredentialProvider>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        let mut base = config.base_url.trim_end_matches('/').to_string();
        base.push('/');
        let base_url = Url::parse(&base)
            .map_err(|e| Error::InvalidRequest(format!("invalid base URL {base}: {e}")))?;
        let user_agent = HeaderValue::from_str(&config.user_agent)
            .map_err(|e| Error::InvalidRequest(format!("invalid user agent: {e}")))?;
        info!(
            base_url = %base_url,
            provider = credentials.id(),
            max_retries = config.max_retries,
            "GitHub client initialized"
        );
        Ok(Self {
            http,
            base_url,
            user_agent,
            timeout: config.timeout(),
            throttle_threshold: config.throttle_threshold,
            policy: RetryPolicy::from_config(config),
            credentials,
            clock,
            rate_limit: Mutex::new(RateLimitState::new()),
        })
    }

    pub fn http_client(&self) -> &reqwest::Client {
        &self.http
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Latest rate-limit snapshot seen on any response.
    pub fn rate_limit(&self) -> Option<RateLimitInfo> {
        self.rate_state().current().cloned()
    }

    pub async fn get(&self, path: &str, params: Option<&[(&str, &str)]>) -> Result<Response> {
        self.request(Method::GET, path, params, None).await
    }

    pub async fn post(&self, path: &str, body: &serde_json::Value) -> Result<Response> {
        self.request(Method::POST, path, None, Some(body)).await
    }

    pub async fn patch(&self, path: &str, body: &serde_json::Value) -> Result<Response> {
        self.request(Method::PATCH, path, None, Some(body)).await
    }

    pub async fn put(&self, path: &str, body: Option<&serde_json::Value>) -> Result<Response> {
        self.request(Method::PUT, path, None, body).await
    }

    pub async fn delete(&self, path: &str) -> Result<Response> {
        self.request(Method::DELETE, path, None, None).await
    }

    /// Perform one logical API call.
    ///
    /// `path` is relative to the base URL, or an absolute URL on the same
    /// origin (e.g. a `next` link from `Pagination`).
    #[instrument(
        skip_all,
        fields(request_id = %uuid::Uuid::new_v4(), method = %method, path = %path)
    )]
    pub async fn request(
        &self,
        method: Method,
        path: &str,
        params: Option<&[(&str, &str)]>,
        body: Option<&serde_json::Value>,
    ) -> Result<Response> {
        let url = self.url(path)?;
        let mut token = self.credentials.credential().await?;
        let mut refreshed = false;
        let mut transient_attempts: u32 = 0;
        let mut rate_limit_attempts: u32 = 0;
        let mut rate_limit_waited = Duration::ZERO;

        loop {
            let wait = self
                .rate_state()
                .time_until_safe(self.throttle_threshold, self.clock.now());
            if !wait.is_zero() {
                if self.policy.fits_budget(rate_limit_waited, wait) {
                    info!(
                        wait_secs = wait.as_secs(),
                        "rate limit nearly exhausted, waiting for reset"
                    );
                    metrics::record_throttle_wait();
                    self.clock.sleep(wait).await;
                    rate_limit_waited += wait;
                } else {
                    debug!(
                        wait_secs = wait.as_secs(),
                        "throttle wait exceeds budget, sending anyway"
                    );
                }
            }

            let (kind, error, snapshot) = match self.send(&method, &url, params, body, &token).await
            {
                Ok(resp) => {
                    let status = resp.status();
                    let headers = resp.headers().clone();
                    let snapshot = self.rate_state().update(&headers);
                    metrics::record_request(method.as_str(), status.as_u16());

                    if status.is_success() {
                        match resp.bytes().await {
                            Ok(bytes) => {
                                debug!(status = status.as_u16(), "request succeeded");
                                return Ok(Response::new(
                                    status.as_u16(),
                                    headers,
                                    &bytes,
                                    snapshot,
                                ));
                            }
                            Err(e) => (
                                ErrorKind::Network,
                                Error::Network(format!("failed to read response body: {e}")),
                                snapshot,
                            ),
                        }
                    } else {
                        let text = match resp.text().await {
                            Ok(text) => text,
                            Err(e) => {
                                warn!(%status, error = %e, "failed to read error response body");
                                format!("unreadable response body: {e}")
                            }
                        };
                        let kind = ErrorKind::classify(status, &headers, &text);

                        if kind == ErrorKind::Unauthorized {
                            if refreshed {
                                warn!("refreshed token rejected, giving up");
                                return Err(Error::AuthenticationRequired(
                                    "token rejected after refresh; log in again".into(),
                                ));
                            }
                            info!(token = %token.hint(), "token rejected, refreshing");
                            refreshed = true;
                            token = self.credentials.refresh(&token).await?;
                            continue;
                        }

                        let error = Error::from_response(
                            status.as_u16(),
                            &text,
                            snapshot.clone(),
                            kind.is_rate_limit(),
                        );
                        (kind, error, snapshot)
                    }
                }
                Err(e) => {
                    let kind = if e.is_timeout() {
                        ErrorKind::Timeout
                    } else {
                        ErrorKind::Network
                    };
                    (kind, Error::Network(e.to_string()), None)
                }
            };

            let attempt = if kind.is_rate_limit() {
                rate_limit_attempts
            } else {
                transient_attempts
            };
            let snapshot = snapshot.or_else(|| self.rate_limit());
            match self
                .policy
                .next_delay(attempt, &kind, snapshot.as_ref(), self.clock.now())
            {
                RetryOutcome::Retry(delay) => {
                    if kind.is_rate_limit() {
                        if !self.policy.fits_budget(rate_limit_waited, delay) {
                            warn!(
                                delay_secs = delay.as_secs(),
                                waited_secs = rate_limit_waited.as_secs(),
                                "rate limit wait exceeds budget, giving up"
                            );
                            return Err(error);
                        }
                        rate_limit_waited += delay;
                        rate_limit_attempts += 1;
                    } else {
                        transient_attempts += 1;
                    }
                    warn!(
                        kind = kind.label(),
                        attempt = attempt + 1,
                        delay_ms = delay.as_millis() as u64,
                        error = %error,
                        "request failed, retrying"
                    );
                    metrics::record_retry(kind.label());
                    self.clock.sleep(delay).await;
                }
                RetryOutcome::GiveUp => {
                    debug!(kind = kind.label(), error = %error, "request failed");
                    return Err(error);
                }
            }
        }
    }

    async fn send(
        &self,
        method: &Method,
        url: &Url,
        params: Option<&[(&str, &str)]>,
        body: Option<&serde_json::Value>,
        token: &BearerToken,
    ) -> reqwest::Result<reqwest::Response> {
        let mut headers = HeaderMap::new();
        headers.insert(ACCEPT, HeaderValue::from_static(GITHUB_ACCEPT));
        headers.insert(API_VERSION_HEADER, HeaderValue::from_static(API_VERSION));
        headers.insert(USER_AGENT, self.user_agent.clone());
        match token.authorization() {
            Ok(value) => {
                headers.insert(AUTHORIZATION, value);
            }
            Err(e) => warn!(error = %e, "sending request without authorization"),
        }

        let mut builder = self
            .http
            .request(method.clone(), url.clone())
            .headers(headers)
            .timeout(self.timeout);
        if let Some(params) = params {
            builder = builder.query(params);
        }
        if let Some(body) = body {
            builder = builder.json(body);
        }
        builder.send().await
    }

    fn url(&self, path: &str) -> Result<Url> {
        if path.starts_with("http://") || path.starts_with("https://") {
            let url = Url::parse(path)
                .map_err(|e| Error::InvalidRequest(format!("invalid URL {path}: {e}")))?;
            if url.origin() != self.base_url.origin() {
                return Err(Error::InvalidRequest(format!(
                    "refusing to send credentials to foreign origin: {path}"
                )));
            }
            return Ok(url);
        }
        self.base_url
            .join(path.trim_start_matches('/'))
            .map_err(|e| Error::InvalidRequest(format!("invalid path {path}: {e}")))
    }

    fn rate_state(&self) -> MutexGuard<'_, RateLimitState> {
        self.rate_limit
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
