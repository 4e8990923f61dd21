//! Retry policy and failure classification
//!
//! `RetryPolicy::next_delay` is a pure function of the attempt number, the
//! failure kind, the rate-limit snapshot and the current time, so the same
//! inputs always produce the same delay.

use crate::ratelimit::RateLimitInfo;
use common::ApiConfig;
use reqwest::StatusCode;
use reqwest::header::{HeaderMap, RETRY_AFTER};
use std::time::{Duration, SystemTime};

/// Body fragments GitHub uses for primary and secondary rate limits on 403.
const RATE_LIMIT_PATTERNS: &[&str] = &["rate limit", "abuse detection"];

/// What went wrong with one attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ErrorKind {
    /// Connection refused/reset, DNS, TLS, truncated body
    Network,
    /// Request exceeded the per-request ceiling (or 408)
    Timeout,
    /// 5xx
    Server(u16),
    /// 429, or 403 carrying a primary/secondary rate-limit signal
    RateLimited { retry_after: Option<Duration> },
    /// 401
    Unauthorized,
    /// 403 without a rate-limit signal
    Forbidden,
    /// 404
    NotFound,
    /// 422
    Validation,
    /// Any other 4xx
    Client(u16),
}

impl ErrorKind {
    /// Classify a non-success response.
    ///
    /// A 403 counts as a rate limit when the primary budget is spent
    /// (`X-RateLimit-Remaining: 0`), a `Retry-After` is present (secondary
    /// limit), or the body says so.
    pub fn classify(status: StatusCode, headers: &HeaderMap, body: &str) -> Self {
        let retry_after = retry_after(headers);
        match status.as_u16() {
            401 => ErrorKind::Unauthorized,
            429 => ErrorKind::RateLimited { retry_after },
            403 => {
                let exhausted = headers
                    .get("x-ratelimit-remaining")
                    .and_then(|v| v.to_str().ok())
                    .is_some_and(|v| v.trim() == "0");
                let lower = body.to_lowercase();
                let mentions = RATE_LIMIT_PATTERNS.iter().any(|p| lower.contains(p));
                if exhausted || retry_after.is_some() || mentions {
                    ErrorKind::RateLimited { retry_after }
                } else {
                    ErrorKind::Forbidden
                }
            }
            404 => ErrorKind::NotFound,
            408 => ErrorKind::Timeout,
            422 => ErrorKind::Validation,
            s if status.is_server_error() => ErrorKind::Server(s),
            s => ErrorKind::Client(s),
        }
    }

    /// Retried with exponential backoff up to `max_retries`.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ErrorKind::Network | ErrorKind::Timeout | ErrorKind::Server(_)
        )
    }

    pub fn is_rate_limit(&self) -> bool {
        matches!(self, ErrorKind::RateLimited { .. })
    }

    /// Label for metrics and logs.
    pub fn label(&self) -> &'static str {
        match self {
            ErrorKind::Network => "network",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Server(_) => "server",
            ErrorKind::RateLimited { .. } => "rate_limited",
            ErrorKind::Unauthorized => "unauthorized",
            ErrorKind::Forbidden => "forbidden",
            ErrorKind::NotFound => "not_found",
            ErrorKind::Validation => "validation",
            ErrorKind::Client(_) => "client",
        }
    }
}

/// Decision for one failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryOutcome {
    Retry(Duration),
    GiveUp,
}

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub backoff_multiplier: f64,
    /// Total time one request may spend waiting out rate limits.
    pub rate_limit_budget: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_secs(1),
            backoff_multiplier: 2.0,
            rate_limit_budget: Duration::from_secs(900),
        }
    }
}

impl RetryPolicy {
    pub fn from_config(config: &ApiConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            base_delay: config.base_delay(),
            backoff_multiplier: config.backoff_multiplier,
            rate_limit_budget: config.rate_limit_budget(),
        }
    }

    /// `base_delay * backoff_multiplier^attempt`, saturating at `Duration::MAX`.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = self
            .backoff_multiplier
            .powi(attempt.min(i32::MAX as u32) as i32);
        Duration::try_from_secs_f64(self.base_delay.as_secs_f64() * factor)
            .unwrap_or(Duration::MAX)
    }

    /// Decide whether attempt number `attempt` (0-based count of retries
    /// already made for this kind of failure) should be retried.
    ///
    /// - transient: backoff while `attempt < max_retries`
    /// - rate limited: wait for `Retry-After`, else the window reset, never
    ///   less than `base_delay`; not capped by count (see `fits_budget`)
    /// - 401 and other 4xx: give up (401 is the caller's refresh path)
    pub fn next_delay(
        &self,
        attempt: u32,
        kind: &ErrorKind,
        rate_limit: Option<&RateLimitInfo>,
        now: SystemTime,
    ) -> RetryOutcome {
        match kind {
            k if k.is_transient() => {
                if attempt < self.max_retries {
                    RetryOutcome::Retry(self.backoff(attempt))
                } else {
                    RetryOutcome::GiveUp
                }
            }
            ErrorKind::RateLimited { retry_after } => {
                let wait = match (retry_after, rate_limit) {
                    (Some(after), _) => *after,
                    (None, Some(info)) if info.is_exhausted() => info.until_reset(now),
                    // Secondary limit without any hint: back off as for a transient failure.
                    (None, _) => self.backoff(attempt),
                };
                RetryOutcome::Retry(wait.max(self.base_delay))
            }
            _ => RetryOutcome::GiveUp,
        }
    }

    /// Whether waiting `delay` more keeps the total rate-limit wait within budget.
    pub fn fits_budget(&self, waited: Duration, delay: Duration) -> bool {
        waited.saturating_add(delay) <= self.rate_limit_budget
    }
}

fn retry_after(headers: &HeaderMap) -> Option<Duration> {
    headers
        .get(RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse::<u64>()
        .ok()
        .map(Duration::from_secs)
}
