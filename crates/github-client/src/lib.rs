//! Rate-limited, retrying client for the GitHub REST API
//!
//! Every call goes through `GitHubClient::request`:
//! 1. Credential comes from a `CredentialProvider` (static token or the
//!    device-flow authenticator)
//! 2. If the last seen rate-limit window is nearly spent, wait for its reset
//!    before sending (proactive throttling)
//! 3. 401 → ask the provider for a fresh token, retry exactly once
//! 4. Network/timeout/5xx → exponential backoff, bounded by `max_retries`
//! 5. 429 / secondary rate limit → wait until the window resets, bounded by
//!    an overall time budget rather than a count
//! 6. Other 4xx → returned to the caller as a terminal error
//!
//! All waits go through the injected `Clock`.

pub mod client;
pub mod error;
pub mod metrics;
pub mod ratelimit;
pub mod response;
pub mod retry;

pub use client::{GitHubClient, build_http_client};
pub use error::{Error, Result};
pub use ratelimit::{RateLimitInfo, RateLimitState};
pub use response::{Pagination, Response};
pub use retry::{ErrorKind, RetryOutcome, RetryPolicy};
