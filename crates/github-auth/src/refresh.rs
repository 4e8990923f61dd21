//! Single-flight token refresh
//!
//! However many tasks discover the same stale token at once, the refresh
//! token is exchanged exactly once. Callers queue on a tokio `Mutex`; the
//! first one performs the refresh and records the outcome keyed by a
//! fingerprint of the stale access token. Later callers for the same stale
//! token find the settled outcome (success or failure) and return it
//! without touching the network.
//!
//! Network failures are retried with the client's `RetryPolicy`. A refresh
//! token that GitHub rejects is never retried.

use std::sync::Arc;
use std::time::{Duration, SystemTime};

use common::{Clock, Secret};
use github_client::{ErrorKind, RetryOutcome, RetryPolicy};
use sha2::{Digest, Sha256};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::constants::OAuthEndpoints;
use crate::error::{Error, RefreshError};
use crate::metrics;
use crate::store::TokenStore;
use crate::token::{TokenRecord, TokenResponse, refresh_token};

/// How long a settled outcome is handed to late callers holding the same
/// stale token.
const OUTCOME_TTL: Duration = Duration::from_secs(30);

struct Settled {
    stale: [u8; 32],
    at: SystemTime,
    outcome: Result<TokenRecord, RefreshError>,
}

pub struct TokenRefreshCoordinator {
    store: Arc<TokenStore>,
    http: reqwest::Client,
    endpoints: OAuthEndpoints,
    client_id: String,
    client_secret: Option<Secret<String>>,
    clock: Arc<dyn Clock>,
    policy: RetryPolicy,
    last: Mutex<Option<Settled>>,
}

impl TokenRefreshCoordinator {
    pub fn new(
        store: Arc<TokenStore>,
        http: reqwest::Client,
        endpoints: OAuthEndpoints,
        client_id: impl Into<String>,
        client_secret: Option<Secret<String>>,
        clock: Arc<dyn Clock>,
        policy: RetryPolicy,
    ) -> Self {
        Self {
            store,
            http,
            endpoints,
            client_id: client_id.into(),
            client_secret,
            clock,
            policy,
            last: Mutex::new(None),
        }
    }

    /// Return a usable replacement for `stale`, refreshing at most once for
    /// all concurrent callers.
    ///
    /// Fails without any HTTP call when `stale` has no refresh token or its
    /// refresh token has expired.
    pub async fn ensure_fresh(&self, stale: &TokenRecord) -> Result<TokenRecord, RefreshError> {
        let key = fingerprint(&stale.access_token);
        let mut last = self.last.lock().await;
        let now = self.clock.now();

        if let Some(settled) = last.as_ref()
            && settled.stale == key
            && now.duration_since(settled.at).unwrap_or_default() <= OUTCOME_TTL
        {
            debug!(token = %stale.id(), "sharing settled refresh outcome");
            metrics::record_refresh("shared");
            return settled.outcome.clone();
        }

        if let Some(current) = self.superseded_by(stale, now).await {
            debug!(token = %current.id(), "token already replaced, skipping refresh");
            metrics::record_refresh("shared");
            return Ok(current);
        }

        let outcome = self.refresh(stale).await;
        metrics::record_refresh(match &outcome {
            Ok(_) => "success",
            Err(RefreshError::NotRefreshable) => "not_refreshable",
            Err(RefreshError::RefreshTokenExpired) => "expired",
            Err(RefreshError::Rejected(_)) => "rejected",
            Err(RefreshError::Network(_)) => "network",
            Err(RefreshError::Store(_)) => "store",
        });
        *last = Some(Settled {
            stale: key,
            at: self.clock.now(),
            outcome: outcome.clone(),
        });
        outcome
    }

    /// The active record when `stale` is no longer stored and a live
    /// token for the same host has taken its place.
    async fn superseded_by(&self, stale: &TokenRecord, now: SystemTime) -> Option<TokenRecord> {
        let stored = self.store.get(&stale.id()).await;
        if stored.is_some_and(|r| r.access_token == stale.access_token) {
            return None;
        }
        self.store
            .active_record()
            .await
            .filter(|r| r.host == stale.host && !r.is_expired(now))
    }

    async fn refresh(&self, stale: &TokenRecord) -> Result<TokenRecord, RefreshError> {
        let Some(refresh) = stale.refresh_token.as_deref().filter(|t| !t.is_empty()) else {
            return Err(RefreshError::NotRefreshable);
        };
        if stale.refresh_expired(self.clock.now()) {
            return Err(RefreshError::RefreshTokenExpired);
        }
        // A rotated refresh token could not be installed for a deleted record.
        if !self.store.contains(stale).await {
            return Err(RefreshError::Store(format!(
                "token {} is no longer stored",
                stale.id()
            )));
        }

        info!(token = %stale.id(), "refreshing access token");
        let response = self.exchange(refresh).await?;
        let record = self.next_record(stale, response)?;

        let id = self
            .store
            .replace(stale, record.clone())
            .await
            .map_err(|e| RefreshError::Store(e.to_string()))?;
        info!(token = %id, expires_at = ?record.expires_at(), "access token refreshed");
        Ok(record)
    }

    async fn exchange(&self, refresh: &str) -> Result<TokenResponse, RefreshError> {
        let mut attempt = 0;
        loop {
            match refresh_token(
                &self.http,
                &self.endpoints,
                &self.client_id,
                self.client_secret.as_ref(),
                refresh,
            )
            .await
            {
                Ok(response) => return Ok(response),
                Err(Error::Http(e)) => {
                    match self
                        .policy
                        .next_delay(attempt, &ErrorKind::Network, None, self.clock.now())
                    {
                        RetryOutcome::Retry(delay) => {
                            warn!(error = %e, attempt, ?delay, "token refresh failed, retrying");
                            self.clock.sleep(delay).await;
                            attempt += 1;
                        }
                        RetryOutcome::GiveUp => return Err(RefreshError::Network(e)),
                    }
                }
                Err(e) => {
                    warn!(error = %e, "refresh token rejected");
                    return Err(RefreshError::Rejected(e.to_string()));
                }
            }
        }
    }

    /// Build the replacement record. GitHub may omit a new refresh token,
    /// in which case the old one carries over with its original deadline.
    fn next_record(
        &self,
        stale: &TokenRecord,
        response: TokenResponse,
    ) -> Result<TokenRecord, RefreshError> {
        let created_at = self.clock.unix_now();
        let mut record = TokenRecord::from_response(response, &stale.host, created_at)
            .map_err(|e| RefreshError::Rejected(e.to_string()))?;

        if record.refresh_token.is_none() {
            record.refresh_token = stale.refresh_token.clone();
            record.refresh_token_expires_in = stale
                .refresh_expires_at()
                .map(|at| at.saturating_sub(created_at));
        }
        if record.scope.is_empty() {
            record.scope = stale.scope.clone();
        }
        Ok(record)
    }
}

fn fingerprint(token: &str) -> [u8; 32] {
    Sha256::digest(token.as_bytes()).into()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemoryBackend;
    use common::ManualClock;
    use wiremock::matchers::{body_string_contains, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const NOW: u64 = 1_700_000_000;

    struct Fixture {
        server: MockServer,
        store: Arc<TokenStore>,
        clock: Arc<ManualClock>,
        coordinator: TokenRefreshCoordinator,
    }

    async fn fixture() -> Fixture {
        let server = MockServer::start().await;
        let clock = Arc::new(ManualClock::at_unix(NOW));
        let backend = Arc::new(MemoryBackend::new());
        let store = Arc::new(TokenStore::open(backend, clock.clone()).await.unwrap());
        let coordinator = TokenRefreshCoordinator::new(
            store.clone(),
            reqwest::Client::new(),
            OAuthEndpoints::with_origin(&server.uri()),
            "Iv1.test",
            None,
            clock.clone(),
            RetryPolicy::default(),
        );
        Fixture {
            server,
            store,
            clock,
            coordinator,
        }
    }

    fn expired_record() -> TokenRecord {
        TokenRecord {
            refresh_token: Some("ghr_old".into()),
            expires_in: Some(3600),
            refresh_token_expires_in: Some(86400),
            scope: vec!["repo".into()],
            ..TokenRecord::new("ghu_old", "github.com", NOW - 3600)
        }
    }

    fn token_body() -> serde_json::Value {
        serde_json::json!({
            "access_token": "gho_new",
            "refresh_token": "ghr_new",
            "expires_in": 28800,
            "refresh_token_expires_in": 15897600,
            "token_type": "bearer",
            "scope": ""
        })
    }

    #[tokio::test]
    async fn refresh_installs_replacement() {
        let f = fixture().await;
        Mock::given(method("POST"))
            .and(path("/login/oauth/access_token"))
            .and(body_string_contains("refresh_token=ghr_old"))
            .respond_with(ResponseTemplate::new(200).set_body_json(token_body()))
            .expect(1)
            .mount(&f.server)
            .await;

        let stale = expired_record();
        f.store.save(stale.clone()).await.unwrap();

        let fresh = f.coordinator.ensure_fresh(&stale).await.unwrap();
        assert_eq!(fresh.access_token, "gho_new");
        assert_eq!(fresh.created_at, NOW);
        assert_eq!(fresh.scope, vec!["repo"]);

        let active = f.store.active().await.unwrap();
        assert_eq!(active.access_token, "gho_new");
        assert_eq!(f.store.len().await, 1);
    }

    #[tokio::test]
    async fn missing_refresh_token_fails_without_http() {
        let f = fixture().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(token_body()))
            .expect(0)
            .mount(&f.server)
            .await;

        let stale = TokenRecord {
            refresh_token: None,
            ..expired_record()
        };
        f.store.save(stale.clone()).await.unwrap();

        let err = f.coordinator.ensure_fresh(&stale).await.unwrap_err();
        assert_eq!(err, RefreshError::NotRefreshable);
    }

    #[tokio::test]
    async fn expired_refresh_token_fails_without_http() {
        let f = fixture().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(token_body()))
            .expect(0)
            .mount(&f.server)
            .await;

        let stale = TokenRecord {
            refresh_token_expires_in: Some(3600),
            ..expired_record()
        };
        f.store.save(stale.clone()).await.unwrap();

        let err = f.coordinator.ensure_fresh(&stale).await.unwrap_err();
        assert_eq!(err, RefreshError::RefreshTokenExpired);
    }

    #[tokio::test]
    async fn network_failures_retry_with_backoff() {
        let f = fixture().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(502))
            .up_to_n_times(2)
            .mount(&f.server)
            .await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(token_body()))
            .mount(&f.server)
            .await;

        let stale = expired_record();
        f.store.save(stale.clone()).await.unwrap();

        let fresh = f.coordinator.ensure_fresh(&stale).await.unwrap();
        assert_eq!(fresh.access_token, "gho_new");
        assert_eq!(
            f.clock.sleeps(),
            vec![Duration::from_secs(1), Duration::from_secs(2)]
        );
    }

    #[tokio::test]
    async fn persistent_network_failure_gives_up() {
        let f = fixture().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(503))
            .expect(4)
            .mount(&f.server)
            .await;

        let stale = expired_record();
        f.store.save(stale.clone()).await.unwrap();

        let err = f.coordinator.ensure_fresh(&stale).await.unwrap_err();
        assert!(matches!(err, RefreshError::Network(_)));
        assert_eq!(f.clock.sleeps().len(), 3);
        assert_eq!(f.store.active_record().await.unwrap().access_token, "ghu_old");
    }

    #[tokio::test]
    async fn rejected_refresh_is_not_retried() {
        let f = fixture().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "error": "bad_refresh_token"
            })))
            .expect(1)
            .mount(&f.server)
            .await;

        let stale = expired_record();
        f.store.save(stale.clone()).await.unwrap();

        let err = f.coordinator.ensure_fresh(&stale).await.unwrap_err();
        assert!(matches!(err, RefreshError::Rejected(ref m) if m.contains("bad_refresh_token")));
        assert!(f.clock.sleeps().is_empty());
    }

    #[tokio::test]
    async fn settled_outcome_is_shared() {
        let f = fixture().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(token_body()))
            .expect(1)
            .mount(&f.server)
            .await;

        let stale = expired_record();
        f.store.save(stale.clone()).await.unwrap();

        let a = f.coordinator.ensure_fresh(&stale).await.unwrap();
        let b = f.coordinator.ensure_fresh(&stale).await.unwrap();
        assert_eq!(a, b);
    }

    #[tokio::test]
    async fn settled_failure_is_shared() {
        let f = fixture().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(401))
            .expect(1)
            .mount(&f.server)
            .await;

        let stale = expired_record();
        f.store.save(stale.clone()).await.unwrap();

        let a = f.coordinator.ensure_fresh(&stale).await.unwrap_err();
        let b = f.coordinator.ensure_fresh(&stale).await.unwrap_err();
        assert_eq!(a, b);
    }

    #[tokio::test]
    async fn replaced_token_is_returned_without_refresh() {
        let f = fixture().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(token_body()))
            .expect(0)
            .mount(&f.server)
            .await;

        let stale = expired_record();
        f.store.save(stale.clone()).await.unwrap();
        let newer = TokenRecord {
            expires_in: Some(28800),
            ..TokenRecord::new("gho_other", "github.com", NOW)
        };
        f.store.replace(&stale, newer.clone()).await.unwrap();

        let fresh = f.coordinator.ensure_fresh(&stale).await.unwrap();
        assert_eq!(fresh, newer);
    }

    #[tokio::test]
    async fn deleted_token_is_not_exchanged() {
        let f = fixture().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(token_body()))
            .expect(0)
            .mount(&f.server)
            .await;

        let stale = expired_record();
        f.store.save(stale.clone()).await.unwrap();
        f.store.delete(&stale.access_token).await.unwrap();

        let err = f.coordinator.ensure_fresh(&stale).await.unwrap_err();
        assert!(matches!(err, RefreshError::Store(ref m) if m.contains("no longer stored")));
    }

    #[tokio::test]
    async fn carries_over_refresh_token_when_omitted() {
        let f = fixture().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "access_token": "gho_new",
                "expires_in": 28800
            })))
            .mount(&f.server)
            .await;

        let stale = expired_record();
        f.store.save(stale.clone()).await.unwrap();

        let fresh = f.coordinator.ensure_fresh(&stale).await.unwrap();
        assert_eq!(fresh.refresh_token.as_deref(), Some("ghr_old"));
        assert_eq!(fresh.refresh_expires_at(), stale.refresh_expires_at());
    }
}
