// Quay.io: optional robot-account token exchange

use async_trait::async_trait;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use reqwest::RequestBuilder;
use reqwest::header::AUTHORIZATION;
use serde::Deserialize;

use super::token::TokenCache;
use super::{RegistryError, RegistryProvider, host_of};
use crate::component::{ComponentError, mask};
use crate::models::Image;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct QuayConfig {
    pub namespace: Option<String>,
    pub account: Option<String>,
    pub token: Option<String>,
}

pub struct Quay {
    name: String,
    config: QuayConfig,
    http: reqwest::Client,
    tokens: TokenCache,
}

impl Quay {
    pub fn new(name: &str, config: QuayConfig, http: reqwest::Client) -> Result<Self, ComponentError> {
        let set = [&config.namespace, &config.account, &config.token]
            .iter()
            .filter(|v| v.is_some())
            .count();
        if set != 0 && set != 3 {
            return Err(ComponentError::invalid(
                "registry",
                format!("quay.{name}"),
                "\"namespace\", \"account\" and \"token\" must be set together",
            ));
        }
        Ok(Self {
            name: name.to_string(),
            config,
            http,
            tokens: TokenCache::default(),
        })
    }

    fn credentials(&self) -> Option<String> {
        match (&self.config.namespace, &self.config.account, &self.config.token) {
            (Some(ns), Some(account), Some(token)) => {
                Some(BASE64.encode(format!("{ns}+{account}:{token}")))
            }
            _ => None,
        }
    }
}

#[async_trait]
impl RegistryProvider for Quay {
    fn provider(&self) -> &'static str {
        "quay"
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn http(&self) -> &reqwest::Client {
        &self.http
    }

    fn match_image(&self, image: &Image) -> bool {
        host_of(&image.registry.url) == "quay.io"
    }

    fn normalize_image(&self, mut image: Image) -> Image {
        image.registry.url = "https://quay.io/v2".to_string();
        image
    }

    async fn authenticate(
        &self,
        image: &Image,
        request: RequestBuilder,
    ) -> Result<RequestBuilder, RegistryError> {
        let Some(credentials) = self.credentials() else {
            return Ok(request);
        };
        let token_request = self
            .http
            .get(format!(
                "https://quay.io/v2/auth?service=quay.io&scope=repository:{}:pull",
                image.name
            ))
            .header(AUTHORIZATION, format!("Basic {credentials}"));
        let token = self
            .tokens
            .get_or_fetch(&image.name, token_request, "quay")
            .await?;
        Ok(request.bearer_auth(token))
    }

    fn mask_configuration(&self) -> serde_json::Value {
        serde_json::json!({
            "namespace": self.config.namespace,
            "account": self.config.account,
            "token": self.config.token.as_deref().map(mask),
        })
    }
}
