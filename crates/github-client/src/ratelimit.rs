//! Rate-limit tracking from GitHub response headers
//!
//! GitHub reports the primary rate limit on every response:
//! `X-RateLimit-Limit`, `X-RateLimit-Remaining`, `X-RateLimit-Used`,
//! `X-RateLimit-Reset` (unix seconds) and `X-RateLimit-Resource`. Each
//! response replaces the previous snapshot wholesale.

use common::clock::{from_unix_seconds, unix_seconds};
use reqwest::header::HeaderMap;
use serde::Serialize;
use std::time::{Duration, SystemTime};
use tracing::{debug, warn};

const LIMIT: &str = "x-ratelimit-limit";
const REMAINING: &str = "x-ratelimit-remaining";
const USED: &str = "x-ratelimit-used";
const RESET: &str = "x-ratelimit-reset";
const RESOURCE: &str = "x-ratelimit-resource";

/// One rate-limit snapshot. `remaining <= limit` always holds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RateLimitInfo {
    pub limit: u64,
    pub remaining: u64,
    pub used: u64,
    /// Window reset, unix seconds.
    pub reset_at: u64,
    pub resource: Option<String>,
}

impl RateLimitInfo {
    /// Parse the rate-limit headers. `None` when limit, remaining or reset is
    /// missing or unparsable.
    pub fn from_headers(headers: &HeaderMap) -> Option<Self> {
        let limit = header_u64(headers, LIMIT)?;
        let remaining = header_u64(headers, REMAINING)?.min(limit);
        let reset_at = header_u64(headers, RESET)?;
        let used = header_u64(headers, USED).unwrap_or(limit - remaining);
        let resource = headers
            .get(RESOURCE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_owned);
        Some(Self {
            limit,
            remaining,
            used,
            reset_at,
            resource,
        })
    }

    pub fn reset_time(&self) -> SystemTime {
        from_unix_seconds(self.reset_at)
    }

    /// Time left until the window resets; zero once it has passed.
    pub fn until_reset(&self, now: SystemTime) -> Duration {
        Duration::from_secs(self.reset_at.saturating_sub(unix_seconds(now)))
    }

    pub fn is_exhausted(&self) -> bool {
        self.remaining == 0
    }

    /// Wait needed before the next request: zero while `remaining/limit`
    /// is above `threshold`, otherwise the time until reset.
    pub fn time_until_safe(&self, threshold: f64, now: SystemTime) -> Duration {
        if self.limit == 0 {
            return Duration::ZERO;
        }
        let fraction = self.remaining as f64 / self.limit as f64;
        if fraction > threshold {
            return Duration::ZERO;
        }
        self.until_reset(now)
    }
}

/// Latest rate-limit snapshot seen by a client.
#[derive(Debug, Default)]
pub struct RateLimitState {
    current: Option<RateLimitInfo>,
}

impl RateLimitState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the snapshot from response headers. Responses without the
    /// headers (some enterprise endpoints, redirects) keep the prior state.
    pub fn update(&mut self, headers: &HeaderMap) -> Option<RateLimitInfo> {
        match RateLimitInfo::from_headers(headers) {
            Some(info) => {
                debug!(
                    limit = info.limit,
                    remaining = info.remaining,
                    reset_at = info.reset_at,
                    "rate limit updated"
                );
                self.current = Some(info.clone());
                Some(info)
            }
            None => {
                if headers.contains_key(REMAINING) {
                    warn!("unparsable rate limit headers, keeping previous state");
                }
                None
            }
        }
    }

    pub fn current(&self) -> Option<&RateLimitInfo> {
        self.current.as_ref()
    }

    /// Zero when nothing is known yet.
    pub fn time_until_safe(&self, threshold: f64, now: SystemTime) -> Duration {
        self.current
            .as_ref()
            .map(|info| info.time_until_safe(threshold, now))
            .unwrap_or(Duration::ZERO)
    }
}

fn header_u64(headers: &HeaderMap, name: &str) -> Option<u64> {
    headers.get(name)?.to_str().ok()?.trim().parse().ok()
}
