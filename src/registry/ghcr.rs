// GitHub Container Registry

use async_trait::async_trait;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use reqwest::RequestBuilder;
use serde::Deserialize;

use super::{RegistryError, RegistryProvider, host_of};
use crate::component::mask;
use crate::models::Image;

const GHCR_URL: &str = "https://ghcr.io";

#[derive(Debug, Clone, Default, Deserialize)]
pub struct GhcrConfig {
    pub username: Option<String>,
    pub token: Option<String>,
}

pub struct Ghcr {
    name: String,
    config: GhcrConfig,
    http: reqwest::Client,
}

impl Ghcr {
    pub fn new(name: &str, config: GhcrConfig, http: reqwest::Client) -> Self {
        Self {
            name: name.to_string(),
            config,
            http,
        }
    }
}

#[async_trait]
impl RegistryProvider for Ghcr {
    fn provider(&self) -> &'static str {
        "ghcr"
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn http(&self) -> &reqwest::Client {
        &self.http
    }

    fn match_image(&self, image: &Image) -> bool {
        host_of(&image.registry.url) == "ghcr.io"
    }

    fn normalize_image(&self, mut image: Image) -> Image {
        image.registry.url = format!("{GHCR_URL}/v2");
        image
    }

    /// A configured token is sent base64 encoded; anonymous pulls rely on the
    /// bearer challenge handled by the v2 client.
    async fn authenticate(
        &self,
        _image: &Image,
        request: RequestBuilder,
    ) -> Result<RequestBuilder, RegistryError> {
        Ok(match self.config.token.as_deref().filter(|t| !t.is_empty()) {
            Some(token) => request.bearer_auth(BASE64.encode(token)),
            None => request,
        })
    }

    fn mask_configuration(&self) -> serde_json::Value {
        serde_json::json!({
            "username": self.config.username,
            "token": self.config.token.as_deref().map(mask),
        })
    }
}
