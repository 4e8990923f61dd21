//! Login, logout and token lookup for one GitHub host
//!
//! `Authenticator` ties the device flow, the token store and the refresh
//! coordinator together, and implements `CredentialProvider` so the API
//! client can ask it for a token on every request.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use common::{Clock, OAuthConfig, Secret};
use github_client::RetryPolicy;
use provider::{BearerToken, CredentialProvider, ProviderError};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::constants::{EXPIRY_WARNING, OAuthEndpoints};
use crate::device_flow::{DeviceFlow, DeviceFlowSession};
use crate::error::{Error, Result};
use crate::refresh::TokenRefreshCoordinator;
use crate::store::TokenStore;
use crate::token::{TokenId, TokenRecord, TokenState};

pub struct Authenticator {
    store: Arc<TokenStore>,
    coordinator: TokenRefreshCoordinator,
    http: reqwest::Client,
    endpoints: OAuthEndpoints,
    host: String,
    client_id: String,
    client_secret: Option<Secret<String>>,
    scopes: Vec<String>,
    max_poll_failures: u32,
    clock: Arc<dyn Clock>,
    policy: RetryPolicy,
    /// GH_TOKEN / GITHUB_TOKEN; takes precedence over the store
    env_token: Option<Secret<String>>,
    /// Cancellation handle of the running login, tagged with its sequence number
    login: Mutex<Option<(u64, CancellationToken)>>,
    login_seq: AtomicU64,
}

impl Authenticator {
    pub fn new(
        store: Arc<TokenStore>,
        http: reqwest::Client,
        config: &OAuthConfig,
        clock: Arc<dyn Clock>,
        policy: RetryPolicy,
    ) -> Self {
        let endpoints = OAuthEndpoints::for_host(&config.host);
        let coordinator = TokenRefreshCoordinator::new(
            store.clone(),
            http.clone(),
            endpoints.clone(),
            config.client_id.clone(),
            config.client_secret.clone(),
            clock.clone(),
            policy.clone(),
        );
        Self {
            store,
            coordinator,
            http,
            endpoints,
            host: config.host.clone(),
            client_id: config.client_id.clone(),
            client_secret: config.client_secret.clone(),
            scopes: config.scopes.clone(),
            max_poll_failures: config.max_transient_poll_failures,
            clock,
            policy,
            env_token: None,
            login: Mutex::new(None),
            login_seq: AtomicU64::new(0),
        }
    }

    /// Send OAuth traffic somewhere other than `https://{host}` (tests,
    /// proxies). Records are still tagged with the configured host.
    pub fn with_endpoints(mut self, endpoints: OAuthEndpoints) -> Self {
        self.coordinator = TokenRefreshCoordinator::new(
            self.store.clone(),
            self.http.clone(),
            endpoints.clone(),
            self.client_id.clone(),
            self.client_secret.clone(),
            self.clock.clone(),
            self.policy.clone(),
        );
        self.endpoints = endpoints;
        self
    }

    /// Use a pre-supplied token instead of the store. Blank tokens are ignored.
    pub fn with_env_token(mut self, token: Option<Secret<String>>) -> Self {
        self.env_token = token.filter(|t| !t.is_empty());
        self
    }

    pub fn uses_env_token(&self) -> bool {
        self.env_token.is_some()
    }

    pub fn store(&self) -> &Arc<TokenStore> {
        &self.store
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    /// Bearer token to use right now: the pre-supplied env token when set,
    /// else the active unexpired record. Never refreshes.
    pub async fn active_token(&self) -> Result<Secret<String>> {
        if let Some(token) = &self.env_token {
            return Ok(token.clone());
        }
        self.store
            .active()
            .await
            .map(|record| record.access_secret())
            .ok_or_else(|| {
                Error::AuthenticationRequired("no active token; run `gh-session login`".into())
            })
    }

    pub async fn is_authenticated(&self) -> bool {
        self.active_token().await.is_ok()
    }

    /// Expiry status of the active record, `None` when nothing is active.
    /// An env token never expires.
    pub async fn token_state(&self) -> Option<TokenState> {
        if self.env_token.is_some() {
            return Some(TokenState::Valid);
        }
        let record = self.store.active_record().await?;
        Some(record.state(self.clock.now(), EXPIRY_WARNING))
    }

    /// Run the device flow and store the resulting token as active.
    ///
    /// `scopes` overrides the configured scopes. Starting a login cancels
    /// any login still in progress.
    pub async fn login<F>(&self, scopes: Option<&[String]>, prompt: F) -> Result<TokenRecord>
    where
        F: FnMut(&DeviceFlowSession) + Send,
    {
        let cancel = CancellationToken::new();
        let seq = self.login_seq.fetch_add(1, Ordering::Relaxed);
        if let Some((_, previous)) = self.login.lock().await.replace((seq, cancel.clone())) {
            info!("cancelling previous login");
            previous.cancel();
        }

        let flow = DeviceFlow::new(
            self.http.clone(),
            self.endpoints.clone(),
            self.client_id.clone(),
            self.clock.clone(),
        )
        .with_max_transient_failures(self.max_poll_failures);

        let scopes = scopes.unwrap_or(self.scopes.as_slice());
        let result = flow.run(scopes, prompt, &cancel).await;

        // Cancellation goes through this lock, so holding it until the token
        // is saved keeps a cancelled session from persisting anything.
        let mut slot = self.login.lock().await;
        if slot.as_ref().is_some_and(|(current, _)| *current == seq) {
            *slot = None;
        }

        let response = result?;
        if cancel.is_cancelled() {
            return Err(Error::DeviceFlowCancelled);
        }
        let record = TokenRecord::from_response(response, &self.host, self.clock.unix_now())?;
        let id = self.store.save(record.clone()).await?;
        self.store.set_active_id(&id).await?;
        drop(slot);
        info!(token = %id, "logged in");
        Ok(record)
    }

    /// Cancel a running login. Returns whether one was running.
    pub async fn cancel_login(&self) -> bool {
        match self.login.lock().await.take() {
            Some((_, token)) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    /// Delete the active record. Returns whether anything was removed.
    pub async fn logout(&self) -> Result<bool> {
        let Some(record) = self.store.active_record().await else {
            return Ok(false);
        };
        let removed = self.store.delete(&record.access_token).await?;
        if removed {
            info!(token = %record.id(), "logged out");
        }
        Ok(removed)
    }

    /// Store a token obtained elsewhere (e.g. a personal access token) and
    /// make it active. `host` defaults to the configured host.
    pub async fn import_token(
        &self,
        access_token: Secret<String>,
        host: Option<&str>,
        scopes: Vec<String>,
    ) -> Result<TokenId> {
        let record = TokenRecord {
            scope: scopes,
            ..TokenRecord::new(
                access_token.expose().clone(),
                host.unwrap_or(self.host.as_str()),
                self.clock.unix_now(),
            )
        };
        let id = self.store.save(record).await?;
        self.store.set_active_id(&id).await?;
        info!(token = %id, "imported token");
        Ok(id)
    }

    async fn usable_token(&self) -> provider::Result<TokenRecord> {
        let Some(record) = self.store.active_record().await else {
            return Err(ProviderError::AuthenticationRequired(
                "no active token; run `gh-session login`".into(),
            ));
        };
        if !record.is_expired(self.clock.now()) {
            return Ok(record);
        }
        if !record.is_refreshable() {
            return Err(ProviderError::AuthenticationRequired(format!(
                "token {} expired; log in again",
                record.id()
            )));
        }
        info!(token = %record.id(), "active token expired, refreshing");
        Ok(self.coordinator.ensure_fresh(&record).await?)
    }

    async fn replace_rejected(&self, rejected: &BearerToken) -> provider::Result<TokenRecord> {
        let Some(current) = self.store.active_record().await else {
            return Err(ProviderError::AuthenticationRequired(
                "no active token; run `gh-session login`".into(),
            ));
        };
        if current.access_token != *rejected.secret().expose()
            && !current.is_expired(self.clock.now())
        {
            return Ok(current);
        }
        warn!(token = %current.id(), "token rejected by GitHub, refreshing");
        Ok(self.coordinator.ensure_fresh(&current).await?)
    }
}

fn bearer(record: &TokenRecord) -> BearerToken {
    BearerToken::new(record.access_secret(), record.is_refreshable())
}

impl CredentialProvider for Authenticator {
    fn id(&self) -> &str {
        "device-flow"
    }

    fn credential(
        &self,
    ) -> Pin<Box<dyn Future<Output = provider::Result<BearerToken>> + Send + '_>> {
        Box::pin(async move {
            if let Some(token) = &self.env_token {
                return Ok(BearerToken::new(token.clone(), false));
            }
            self.usable_token().await.map(|r| bearer(&r))
        })
    }

    fn refresh<'a>(
        &'a self,
        rejected: &'a BearerToken,
    ) -> Pin<Box<dyn Future<Output = provider::Result<BearerToken>> + Send + 'a>> {
        Box::pin(async move {
            if self.env_token.is_some() {
                warn!(token = %rejected.hint(), "pre-supplied token rejected by GitHub");
                return Err(ProviderError::AuthenticationRequired(
                    "GH_TOKEN was rejected; replace it or unset it and log in".into(),
                ));
            }
            self.replace_rejected(rejected).await.map(|r| bearer(&r))
        })
    }
}
