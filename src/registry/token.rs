// Registry bearer tokens: the token endpoint response and a per-repository cache

use reqwest::RequestBuilder;
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use tokio::time::{Duration, Instant};

use super::RegistryError;

/// Lifetime assumed when the token endpoint does not say.
const DEFAULT_LIFETIME: Duration = Duration::from_secs(60);
/// Tokens are dropped this long before they actually expire.
const EXPIRY_MARGIN: Duration = Duration::from_secs(10);

/// Token endpoints answer with `token`, `access_token` or both.
#[derive(Debug, Deserialize)]
pub(crate) struct TokenResponse {
    #[serde(default)]
    token: Option<String>,
    #[serde(default)]
    access_token: Option<String>,
    #[serde(default)]
    expires_in: Option<u64>,
}

impl TokenResponse {
    pub fn token(&self) -> Option<&str> {
        self.token.as_deref().or(self.access_token.as_deref())
    }

    pub fn lifetime(&self) -> Duration {
        self.expires_in
            .map(Duration::from_secs)
            .unwrap_or(DEFAULT_LIFETIME)
    }
}

#[derive(Default)]
pub(crate) struct TokenCache {
    tokens: Mutex<HashMap<String, (String, Instant)>>,
}

impl TokenCache {
    fn lock(&self) -> MutexGuard<'_, HashMap<String, (String, Instant)>> {
        self.tokens.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Still-valid token for `repository`.
    pub fn get(&self, repository: &str) -> Option<String> {
        let mut tokens = self.lock();
        match tokens.get(repository) {
            Some((token, valid_until)) if Instant::now() < *valid_until => Some(token.clone()),
            Some(_) => {
                tokens.remove(repository);
                None
            }
            None => None,
        }
    }

    /// Cached token for `repository`, otherwise the one `request` returns.
    pub async fn get_or_fetch(
        &self,
        repository: &str,
        request: RequestBuilder,
        registry: &str,
    ) -> Result<String, RegistryError> {
        if let Some(token) = self.get(repository) {
            return Ok(token);
        }
        let response = request.send().await?;
        if !response.status().is_success() {
            return Err(RegistryError::Auth(format!(
                "{registry} token request returned {}",
                response.status()
            )));
        }
        let body: TokenResponse = response.json().await?;
        let token = body
            .token()
            .ok_or_else(|| RegistryError::Auth(format!("{registry} token response has no token")))?
            .to_string();
        self.insert(repository, &token, body.lifetime());
        tracing::debug!(registry, repository, "Fetched registry token");
        Ok(token)
    }

    pub fn insert(&self, repository: &str, token: &str, lifetime: Duration) {
        let usable = lifetime.saturating_sub(EXPIRY_MARGIN);
        if usable.is_zero() {
            return;
        }
        self.lock().insert(
            repository.to_string(),
            (token.to_string(), Instant::now() + usable),
        );
    }
}
