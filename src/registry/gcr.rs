// Google Container Registry: service-account `_json_key` token exchange

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
pub struct GcrConfig {
    pub clientemail: Option<String>,
    pub privatekey: Option<String>,
}

pub struct Gcr {
    name: String,
    config: GcrConfig,
    http: reqwest::Client,
    tokens: TokenCache,
}

impl Gcr {
    pub fn new(name: &str, config: GcrConfig, http: reqwest::Client) -> Result<Self, ComponentError> {
        match (&config.clientemail, &config.privatekey) {
            (Some(_), None) => {
                return Err(ComponentError::invalid("registry", format!("gcr.{name}"), "\"privatekey\" is required"));
            }
            (None, Some(_)) => {
                return Err(ComponentError::invalid("registry", format!("gcr.{name}"), "\"clientemail\" is required"));
            }
            _ => {}
        }
        Ok(Self {
            name: name.to_string(),
            config,
            http,
            tokens: TokenCache::default(),
        })
    }
}

#[async_trait]
impl RegistryProvider for Gcr {
    fn provider(&self) -> &'static str {
        "gcr"
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn http(&self) -> &reqwest::Client {
        &self.http
    }

    fn match_image(&self, image: &Image) -> bool {
        let host = host_of(&image.registry.url);
        host == "gcr.io" || host.ends_with(".gcr.io")
    }

    fn normalize_image(&self, mut image: Image) -> Image {
        let bare = image
            .registry
            .url
            .trim_start_matches("https://")
            .trim_start_matches("http://")
            .trim_end_matches('/')
            .trim_end_matches("/v2")
            .to_string();
        image.registry.url = format!("https://{bare}/v2");
        image
    }

    async fn authenticate(
        &self,
        image: &Image,
        request: RequestBuilder,
    ) -> Result<RequestBuilder, RegistryError> {
        let (Some(email), Some(key)) = (&self.config.clientemail, &self.config.privatekey) else {
            return Ok(request);
        };
        let json_key = serde_json::json!({
            "private_key": key,
            "client_email": email,
        });
        let credentials = BASE64.encode(format!("_json_key:{json_key}"));
        let token_request = self
            .http
            .get(format!(
                "https://gcr.io/v2/token?scope=repository:{}:pull",
                image.name
            ))
            .header(AUTHORIZATION, format!("Basic {credentials}"));
        let token = self
            .tokens
            .get_or_fetch(&image.name, token_request, "gcr")
            .await?;
        Ok(request.bearer_auth(token))
    }

    fn mask_configuration(&self) -> serde_json::Value {
        serde_json::json!({
            "clientemail": self.config.clientemail,
            "privatekey": self.config.privatekey.as_deref().map(mask),
        })
    }
}
