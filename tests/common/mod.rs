// Shared test helpers: in-memory container engine, fixed-answer registry, container builder
#![allow(dead_code)]

use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use tagwatch::config::WatcherConfig;
use tagwatch::engine::{
    ContainerEngine, EngineContainer, EngineContainerState, EngineError, EngineImage, EventReader,
};
use tagwatch::event::EventBus;
use tagwatch::models::{Container, Image, ImageDigest, ImageRegistry, ImageTag};
use tagwatch::registry::{ManifestDigest, Registries, RegistryError, RegistryProvider};
use tagwatch::store::ContainerStore;
use tagwatch::watcher::Watcher;

pub const TEST_CONFIG: &str = r#"
[server]
port = 8081
host = "0.0.0.0"

[store]
in_memory = true

[install]
poll_interval_ms = 10
image_update_timeout_secs = 1
rescan_timeout_secs = 1
cleanup_attempts = 2
cleanup_backoff_ms = 10

[watchers.local]
watchevents = false
watchatstart = false
"#;

pub const FAKE_REGISTRY_HOST: &str = "registry.test";

#[derive(Default)]
struct EngineState {
    containers: Vec<EngineContainer>,
    images: HashMap<String, EngineImage>,
    events: Vec<u8>,
}

/// Container engine answering from memory.
#[derive(Default)]
pub struct FakeEngine {
    state: Mutex<EngineState>,
}

impl FakeEngine {
    /// Register a running container created from `reference`, with an image of the
    /// same reference.
    pub fn run(&self, id: &str, name: &str, reference: &str, labels: &[(&str, &str)]) {
        let image_id = format!("sha256:{id}-image");
        let mut state = self.state.lock().unwrap();
        state.images.insert(
            reference.to_string(),
            EngineImage {
                id: image_id.clone(),
                repo_tags: vec![reference.to_string()],
                repo_digests: vec![format!("{reference}@sha256:{id}-repo")],
                architecture: "amd64".into(),
                os: "linux".into(),
                variant: None,
                created: Some("2024-01-01T00:00:00Z".into()),
                config_image: None,
            },
        );
        state.containers.push(EngineContainer {
            id: id.into(),
            name: name.into(),
            image: reference.into(),
            image_id,
            status: "running".into(),
            labels: labels
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        });
    }

    pub fn set_status(&self, id: &str, status: &str) {
        let mut state = self.state.lock().unwrap();
        if let Some(c) = state.containers.iter_mut().find(|c| c.id == id) {
            c.status = status.into();
        }
    }

    pub fn remove(&self, id: &str) {
        self.state.lock().unwrap().containers.retain(|c| c.id != id);
    }

    /// Raw bytes served by the next `events()` call.
    pub fn push_events(&self, raw: &str) {
        self.state
            .lock()
            .unwrap()
            .events
            .extend_from_slice(raw.as_bytes());
    }

    fn state_of(c: &EngineContainer) -> EngineContainerState {
        EngineContainerState {
            id: c.id.clone(),
            name: c.name.clone(),
            status: c.status.clone(),
            image_id: c.image_id.clone(),
        }
    }
}

#[async_trait]
impl ContainerEngine for FakeEngine {
    async fn list_containers(&self, all: bool) -> Result<Vec<EngineContainer>, EngineError> {
        let state = self.state.lock().unwrap();
        Ok(state
            .containers
            .iter()
            .filter(|c| all || c.status == "running")
            .cloned()
            .collect())
    }

    async fn inspect_container(&self, id: &str) -> Result<Option<EngineContainerState>, EngineError> {
        let state = self.state.lock().unwrap();
        Ok(state.containers.iter().find(|c| c.id == id).map(Self::state_of))
    }

    async fn find_container_by_name(&self, name: &str) -> Result<Option<EngineContainerState>, EngineError> {
        let state = self.state.lock().unwrap();
        Ok(state
            .containers
            .iter()
            .find(|c| c.name == name)
            .map(Self::state_of))
    }

    async fn inspect_image(&self, image: &str) -> Result<EngineImage, EngineError> {
        let state = self.state.lock().unwrap();
        state
            .images
            .get(image)
            .cloned()
            .ok_or_else(|| {
                EngineError::Io(std::io::Error::new(
                    std::io::ErrorKind::NotFound,
                    format!("no such image {image}"),
                ))
            })
    }

    async fn events(&self) -> Result<EventReader, EngineError> {
        let raw = std::mem::take(&mut self.state.lock().unwrap().events);
        Ok(Box::new(std::io::Cursor::new(raw)))
    }
}

/// Registry for `registry.test` images with fixed tags and digest.
pub struct FakeRegistry {
    http: reqwest::Client,
    tags: Vec<String>,
    digest: Option<String>,
}

impl FakeRegistry {
    pub fn new(tags: &[&str], digest: Option<&str>) -> Self {
        Self {
            http: reqwest::Client::new(),
            tags: tags.iter().map(|t| t.to_string()).collect(),
            digest: digest.map(str::to_string),
        }
    }
}

#[async_trait]
impl RegistryProvider for FakeRegistry {
    fn provider(&self) -> &'static str {
        "fake"
    }

    fn name(&self) -> &str {
        "test"
    }

    fn http(&self) -> &reqwest::Client {
        &self.http
    }

    fn match_image(&self, image: &Image) -> bool {
        image.registry.url.contains(FAKE_REGISTRY_HOST)
    }

    fn normalize_image(&self, mut image: Image) -> Image {
        image.registry.url = format!("https://{FAKE_REGISTRY_HOST}/v2");
        image
    }

    fn mask_configuration(&self) -> serde_json::Value {
        serde_json::json!({})
    }

    async fn get_tags(&self, _image: &Image) -> Result<Vec<String>, RegistryError> {
        Ok(self.tags.clone())
    }

    async fn get_image_manifest_digest(
        &self,
        _image: &Image,
        digest: Option<&str>,
    ) -> Result<ManifestDigest, RegistryError> {
        // The local lookup (by repo digest) answers with the repo digest itself
        Ok(ManifestDigest {
            digest: digest.map(str::to_string).or_else(|| self.digest.clone()),
            created: None,
            version: 2,
        })
    }
}

pub fn registries(tags: &[&str], digest: Option<&str>) -> Registries {
    Registries::new(vec![Arc::new(FakeRegistry::new(tags, digest))])
}

pub fn store() -> Arc<ContainerStore> {
    Arc::new(ContainerStore::in_memory(EventBus::default()))
}

pub fn watcher(
    engine: Arc<FakeEngine>,
    registries: Registries,
    store: Arc<ContainerStore>,
) -> Arc<Watcher> {
    let config = WatcherConfig {
        watchevents: false,
        watchatstart: false,
        ..Default::default()
    };
    Arc::new(Watcher::new("local", config, engine, registries, store))
}

/// Valid running container on `registry.test`.
pub fn container(id: &str, name: &str, tag: &str) -> Container {
    Container {
        id: id.into(),
        name: name.into(),
        display_name: String::new(),
        display_icon: String::new(),
        status: "running".into(),
        watcher: "local".into(),
        include_tags: None,
        exclude_tags: None,
        transform_tags: None,
        link_template: None,
        trigger_include: None,
        trigger_exclude: None,
        compose_project: None,
        image: Image {
            id: format!("sha256:{id}-image"),
            registry: ImageRegistry {
                name: "fake.test".into(),
                url: format!("https://{FAKE_REGISTRY_HOST}/v2"),
            },
            name: name.into(),
            tag: ImageTag {
                value: tag.into(),
                semver: tagwatch::tag::parse(tag).is_some(),
            },
            digest: ImageDigest::default(),
            architecture: "amd64".into(),
            os: "linux".into(),
            variant: None,
            created: None,
        },
        result: None,
        error: None,
        notification: None,
        labels: BTreeMap::new(),
    }
    .validate()
    .unwrap()
}
