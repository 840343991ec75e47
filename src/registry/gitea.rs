// Gitea package registry (v2 API on the configured host)

use async_trait::async_trait;
use reqwest::RequestBuilder;
use serde::Deserialize;

use super::{RegistryError, RegistryProvider, basic_credentials, host_of, with_scheme};
use crate::component::{ComponentError, mask};
use crate::models::Image;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct GiteaConfig {
    pub url: String,
    pub login: Option<String>,
    pub password: Option<String>,
    pub auth: Option<String>,
}

pub struct Gitea {
    name: String,
    url: String,
    config: GiteaConfig,
    http: reqwest::Client,
}

impl Gitea {
    pub fn new(name: &str, config: GiteaConfig, http: reqwest::Client) -> Result<Self, ComponentError> {
        if config.url.trim().is_empty() {
            return Err(ComponentError::invalid("registry", format!("gitea.{name}"), "\"url\" is required"));
        }
        Ok(Self {
            name: name.to_string(),
            url: with_scheme(&config.url),
            config,
            http,
        })
    }
}

#[async_trait]
impl RegistryProvider for Gitea {
    fn provider(&self) -> &'static str {
        "gitea"
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn http(&self) -> &reqwest::Client {
        &self.http
    }

    fn match_image(&self, image: &Image) -> bool {
        host_of(&self.url) == host_of(&image.registry.url)
    }

    fn normalize_image(&self, mut image: Image) -> Image {
        image.registry.url = format!("https://{}/v2", host_of(&image.registry.url));
        image
    }

    async fn authenticate(
        &self,
        _image: &Image,
        request: RequestBuilder,
    ) -> Result<RequestBuilder, RegistryError> {
        let credentials = basic_credentials(
            self.config.login.as_deref(),
            self.config.password.as_deref(),
            self.config.auth.as_deref(),
        );
        Ok(match credentials {
            Some(c) => request.header(reqwest::header::AUTHORIZATION, format!("Basic {c}")),
            None => request,
        })
    }

    fn mask_configuration(&self) -> serde_json::Value {
        serde_json::json!({
            "url": self.url,
            "login": self.config.login,
            "password": self.config.password.as_deref().map(mask),
            "auth": self.config.auth.as_deref().map(mask),
        })
    }
}
