//! Static token provider: a pre-supplied token (GH_TOKEN / GITHUB_TOKEN).
//!
//! No store, no refresh. A 401 means the token is bad and the only fix is a
//! different token, so `refresh` always reports `AuthenticationRequired`.

use crate::{BearerToken, CredentialProvider, ProviderError};
use common::Secret;
use std::future::Future;
use std::pin::Pin;
use tracing::warn;

pub struct StaticTokenProvider {
    token: BearerToken,
}

impl StaticTokenProvider {
    pub fn new(token: Secret<String>) -> Self {
        Self {
            token: BearerToken::new(token, false),
        }
    }
}

impl CredentialProvider for StaticTokenProvider {
    fn id(&self) -> &str {
        "static"
    }

    fn credential(
        &self,
    ) -> Pin<Box<dyn Future<Output = crate::Result<BearerToken>> + Send + '_>> {
        Box::pin(async {
            if self.token.secret().is_empty() {
                return Err(ProviderError::AuthenticationRequired(
                    "pre-supplied token is empty".into(),
                ));
            }
            Ok(self.token.clone())
        })
    }

    fn refresh<'a>(
        &'a self,
        rejected: &'a BearerToken,
    ) -> Pin<Box<dyn Future<Output = crate::Result<BearerToken>> + Send + 'a>> {
        Box::pin(async move {
            warn!(token = %rejected.hint(), "pre-supplied token rejected by GitHub");
            Err(ProviderError::AuthenticationRequired(
                "GH_TOKEN was rejected; replace it or unset it and log in".into(),
            ))
        })
    }
}
