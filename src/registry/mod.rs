// Registry providers: matching, normalization, tag listing and manifest digests

mod custom;
mod gcr;
mod ghcr;
mod gitea;
mod hub;
mod quay;
mod token;
pub mod v2;

pub use custom::Custom;
pub use gcr::Gcr;
pub use ghcr::Ghcr;
pub use gitea::Gitea;
pub use hub::Hub;
pub use quay::Quay;

use async_trait::async_trait;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use reqwest::RequestBuilder;
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::component::ComponentError;
use crate::models::Image;

/// Registry name given to images no provider understands.
pub const UNKNOWN_REGISTRY: &str = "unknown";

/// Registered provider types, sorted.
pub const PROVIDERS: &[&str] = &["custom", "gcr", "ghcr", "gitea", "hub", "quay"];

/// Registries available without configuration, unless their type is configured.
pub const PUBLIC_DEFAULTS: &[&str] = &["gcr", "ghcr", "hub", "quay"];

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("http: {0}")]
    Http(#[from] reqwest::Error),
    #[error("invalid url {0}")]
    Url(String),
    #[error("{url} returned {status}")]
    Status {
        url: String,
        status: reqwest::StatusCode,
    },
    #[error("authentication failed: {0}")]
    Auth(String),
    #[error("manifest: {0}")]
    Manifest(String),
    #[error("Unsupported Registry {0}")]
    Unsupported(String),
}

/// Remote digest of a tag. `version` is 1 for legacy manifests where `digest` is the
/// embedded config image id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManifestDigest {
    pub digest: Option<String>,
    pub created: Option<String>,
    pub version: u8,
}

#[async_trait]
pub trait RegistryProvider: Send + Sync {
    /// Provider type, e.g. `hub`.
    fn provider(&self) -> &'static str;

    fn name(&self) -> &str;

    fn id(&self) -> String {
        format!("{}.{}", self.provider(), self.name())
    }

    fn http(&self) -> &reqwest::Client;

    fn match_image(&self, image: &Image) -> bool;

    /// Rewrite the registry url to its v2 API root (and official-image names).
    fn normalize_image(&self, image: Image) -> Image;

    /// Inject credentials into a registry request.
    async fn authenticate(
        &self,
        _image: &Image,
        request: RequestBuilder,
    ) -> Result<RequestBuilder, RegistryError> {
        Ok(request)
    }

    fn mask_configuration(&self) -> serde_json::Value;

    async fn get_tags(&self, image: &Image) -> Result<Vec<String>, RegistryError> {
        v2::get_tags(self, image).await
    }

    /// Digest of `digest` (when given) or of the image tag.
    async fn get_image_manifest_digest(
        &self,
        image: &Image,
        digest: Option<&str>,
    ) -> Result<ManifestDigest, RegistryError> {
        v2::get_image_manifest_digest(self, image, digest).await
    }
}

/// Base64 `user:password`, or a preformatted `auth` blob.
pub(crate) fn basic_credentials(
    login: Option<&str>,
    password: Option<&str>,
    auth: Option<&str>,
) -> Option<String> {
    if let Some(auth) = auth.filter(|a| !a.is_empty()) {
        return Some(auth.to_string());
    }
    match (login, password) {
        (Some(login), Some(password)) if !login.is_empty() => {
            Some(BASE64.encode(format!("{login}:{password}")))
        }
        _ => None,
    }
}

/// Host part of a registry url, lowercased, without scheme, path or port-less suffixes.
pub(crate) fn host_of(url: &str) -> String {
    let without_scheme = url
        .trim()
        .trim_start_matches("https://")
        .trim_start_matches("http://");
    without_scheme
        .split('/')
        .next()
        .unwrap_or_default()
        .to_lowercase()
}

/// `https://` prefixed url without trailing slash.
pub(crate) fn with_scheme(url: &str) -> String {
    let trimmed = url.trim().trim_end_matches('/');
    if trimmed.starts_with("http://") || trimmed.starts_with("https://") {
        trimmed.to_string()
    } else {
        format!("https://{trimmed}")
    }
}

/// Parse a provider configuration table.
fn parse_config<T: serde::de::DeserializeOwned>(
    provider: &str,
    name: &str,
    config: toml::Value,
) -> Result<T, ComponentError> {
    config
        .try_into()
        .map_err(|e| ComponentError::invalid("registry", format!("{provider}.{name}"), e))
}

/// Build a provider from its `(type, name)` and configuration table.
pub fn build(
    provider: &str,
    name: &str,
    config: toml::Value,
    http: reqwest::Client,
) -> Result<Arc<dyn RegistryProvider>, ComponentError> {
    let provider = provider.to_lowercase();
    let name = name.to_lowercase();
    let built: Arc<dyn RegistryProvider> = match provider.as_str() {
        "custom" => Arc::new(Custom::new(&name, parse_config(&provider, &name, config)?, http)?),
        "gcr" => Arc::new(Gcr::new(&name, parse_config(&provider, &name, config)?, http)?),
        "ghcr" => Arc::new(Ghcr::new(&name, parse_config(&provider, &name, config)?, http)),
        "gitea" => Arc::new(Gitea::new(&name, parse_config(&provider, &name, config)?, http)?),
        "hub" => Arc::new(Hub::new(&name, parse_config(&provider, &name, config)?, http)),
        "quay" => Arc::new(Quay::new(&name, parse_config(&provider, &name, config)?, http)?),
        _ => {
            return Err(ComponentError::UnknownProvider {
                kind: "registry",
                provider,
                available: PROVIDERS,
            });
        }
    };
    Ok(built)
}

/// Registered providers, resolved in registration order.
#[derive(Clone, Default)]
pub struct Registries {
    providers: Vec<Arc<dyn RegistryProvider>>,
}

impl Registries {
    pub fn new(providers: Vec<Arc<dyn RegistryProvider>>) -> Self {
        Self { providers }
    }

    /// Configured providers plus the public defaults for unconfigured types.
    /// A provider that fails to register is logged and skipped.
    pub fn from_config(
        configured: &BTreeMap<String, BTreeMap<String, toml::Value>>,
        http: reqwest::Client,
    ) -> Self {
        let mut all: BTreeMap<String, BTreeMap<String, toml::Value>> = PUBLIC_DEFAULTS
            .iter()
            .map(|p| {
                let mut public = BTreeMap::new();
                public.insert("public".to_string(), toml::Value::Table(Default::default()));
                (p.to_string(), public)
            })
            .collect();
        for (provider, entries) in configured {
            all.insert(provider.to_lowercase(), entries.clone());
        }

        let mut providers = Vec::new();
        for (provider, entries) in all {
            tracing::info!(provider = %provider, "Register all components of kind registry");
            for (name, config) in entries {
                match build(&provider, &name, config, http.clone()) {
                    Ok(registry) => providers.push(registry),
                    Err(e) => tracing::warn!(error = %e, "Some registries failed to register"),
                }
            }
        }
        Self { providers }
    }

    pub fn all(&self) -> &[Arc<dyn RegistryProvider>] {
        &self.providers
    }

    pub fn get(&self, id: &str) -> Option<Arc<dyn RegistryProvider>> {
        self.providers.iter().find(|p| p.id() == id).cloned()
    }

    /// First provider whose match predicate accepts the image.
    pub fn resolve(&self, image: &Image) -> Option<Arc<dyn RegistryProvider>> {
        self.providers.iter().find(|p| p.match_image(image)).cloned()
    }

    /// Normalize through the matching provider, or mark the registry unknown.
    pub fn normalize(&self, image: Image) -> Image {
        match self.resolve(&image) {
            Some(provider) => {
                let mut normalized = provider.normalize_image(image);
                normalized.registry.name = provider.id();
                normalized
            }
            None => {
                let mut unknown = image;
                unknown.registry.name = UNKNOWN_REGISTRY.to_string();
                unknown
            }
        }
    }
}
