//! Metric recording helpers
//!
//! - `github_requests_total` (counter): labels `method`, `status`
//! - `github_retries_total` (counter): label `kind`
//! - `github_throttle_waits_total` (counter)
//!
//! No recorder is installed here; without one these calls are no-ops.

/// Record a completed HTTP exchange with GitHub.
pub fn record_request(method: &str, status: u16) {
    metrics::counter!(
        "github_requests_total",
        "method" => method.to_string(),
        "status" => status.to_string()
    )
    .increment(1);
}

/// Record a retry scheduled by the retry policy.
pub fn record_retry(kind: &'static str) {
    metrics::counter!("github_retries_total", "kind" => kind).increment(1);
}

/// Record a proactive wait for the rate-limit window to reset.
pub fn record_throttle_wait() {
    metrics::counter!("github_throttle_waits_total").increment(1);
}
