// Docker Hub: token handshake against auth.docker.io, `library/` for official images

use async_trait::async_trait;
use reqwest::RequestBuilder;
use reqwest::header::{ACCEPT, AUTHORIZATION};
use serde::Deserialize;

use super::token::TokenCache;
use super::{RegistryError, RegistryProvider, basic_credentials, host_of};
use crate::component::mask;
use crate::models::Image;

pub const HUB_URL: &str = "https://registry-1.docker.io";
const AUTH_URL: &str = "https://auth.docker.io/token";

#[derive(Debug, Clone, Default, Deserialize)]
pub struct HubConfig {
    pub login: Option<String>,
    pub password: Option<String>,
    /// Access token, used as the password.
    pub token: Option<String>,
    pub auth: Option<String>,
}

pub struct Hub {
    name: String,
    config: HubConfig,
    http: reqwest::Client,
    auth_url: String,
    tokens: TokenCache,
}

impl Hub {
    pub fn new(name: &str, mut config: HubConfig, http: reqwest::Client) -> Self {
        if config.password.is_none() {
            config.password = config.token.clone();
        }
        Self {
            name: name.to_string(),
            config,
            http,
            auth_url: AUTH_URL.to_string(),
            tokens: TokenCache::default(),
        }
    }
}

#[async_trait]
impl RegistryProvider for Hub {
    fn provider(&self) -> &'static str {
        "hub"
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn http(&self) -> &reqwest::Client {
        &self.http
    }

    fn match_image(&self, image: &Image) -> bool {
        let host = host_of(&image.registry.url);
        host.is_empty() || host == "docker.io" || host.ends_with(".docker.io")
    }

    fn normalize_image(&self, mut image: Image) -> Image {
        image.registry.url = format!("{HUB_URL}/v2");
        if !image.name.contains('/') {
            image.name = format!("library/{}", image.name);
        }
        image
    }

    async fn authenticate(
        &self,
        image: &Image,
        request: RequestBuilder,
    ) -> Result<RequestBuilder, RegistryError> {
        let url = format!(
            "{}?service=registry.docker.io&scope=repository:{}:pull&grant_type=password",
            self.auth_url, image.name
        );
        let mut token_request = self.http.get(&url).header(ACCEPT, "application/json");
        if let Some(credentials) = basic_credentials(
            self.config.login.as_deref(),
            self.config.password.as_deref(),
            self.config.auth.as_deref(),
        ) {
            token_request = token_request.header(AUTHORIZATION, format!("Basic {credentials}"));
        }
        let token = self
            .tokens
            .get_or_fetch(&image.name, token_request, "docker hub")
            .await?;
        Ok(request.bearer_auth(token))
    }

    fn mask_configuration(&self) -> serde_json::Value {
        serde_json::json!({
            "url": HUB_URL,
            "login": self.config.login,
            "password": self.config.password.as_deref().map(mask),
            "token": self.config.token.as_deref().map(mask),
            "auth": self.config.auth.as_deref().map(mask),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::test_support::image;

    fn hub(config: HubConfig) -> Hub {
        Hub::new("public", config, reqwest::Client::new())
    }

    #[test]
    fn matches_docker_hosts_and_bare_names() {
        let h = hub(HubConfig::default());
        assert!(h.match_image(&image("registry-1.docker.io", "nginx")));
        assert!(h.match_image(&image("docker.io", "nginx")));
        assert!(h.match_image(&image("", "nginx")));
        assert!(!h.match_image(&image("other.registry.com", "nginx")));
    }

    #[test]
    fn official_images_get_library_prefix() {
        let h = hub(HubConfig::default());
        assert_eq!(h.normalize_image(image("", "nginx")).name, "library/nginx");
        assert_eq!(h.normalize_image(image("", "user/nginx")).name, "user/nginx");
    }

    #[test]
    fn token_is_used_as_password() {
        let h = hub(HubConfig {
            token: Some("mytoken".into()),
            ..Default::default()
        });
        assert_eq!(h.config.password.as_deref(), Some("mytoken"));
    }

    #[tokio::test]
    async fn token_is_fetched_once_per_repository() {
        use axum::{Json, Router, extract::State, routing::get};
        use std::sync::Arc;
        use std::sync::atomic::{AtomicUsize, Ordering};

        let calls = Arc::new(AtomicUsize::new(0));
        let app = Router::new()
            .route(
                "/token",
                get(|State(calls): State<Arc<AtomicUsize>>| async move {
                    let n = calls.fetch_add(1, Ordering::SeqCst);
                    Json(serde_json::json!({ "token": format!("t{n}"), "expires_in": 300 }))
                }),
            )
            .with_state(calls.clone());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });

        let mut h = hub(HubConfig::default());
        h.auth_url = format!("http://{addr}/token");
        let nginx = h.normalize_image(image("", "nginx"));
        let redis = h.normalize_image(image("", "redis"));
        let bearer = |r: RequestBuilder| {
            r.build().unwrap().headers()[AUTHORIZATION].to_str().unwrap().to_string()
        };

        for _ in 0..3 {
            let request = h.http.get("https://registry-1.docker.io/v2/library/nginx/tags/list");
            let authed = h.authenticate(&nginx, request).await.unwrap();
            assert_eq!(bearer(authed), "Bearer t0");
        }
        let request = h.http.get("https://registry-1.docker.io/v2/library/redis/tags/list");
        let authed = h.authenticate(&redis, request).await.unwrap();
        assert_eq!(bearer(authed), "Bearer t1");
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn mask_covers_all_secrets() {
        let h = hub(HubConfig {
            login: Some("testuser".into()),
            password: Some("testpass".into()),
            token: Some("testtoken".into()),
            auth: Some("dGVzdDp0ZXN0".into()),
        });
        let masked = h.mask_configuration();
        assert_eq!(masked["login"], "testuser");
        assert_eq!(masked["password"], "t******s");
        assert_eq!(masked["token"], "t*******n");
        assert_eq!(masked["auth"], "d**********0");
    }
}
