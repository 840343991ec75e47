// Container engine access: the trait watchers and the installer depend on, and its
// Docker implementation via bollard

pub mod events;

pub use events::{EngineEvent, EngineEventCodec, WATCHED_ACTIONS};

use async_trait::async_trait;
use bollard::Docker;
use bollard::models::EventMessage;
use bollard::query_parameters::{EventsOptions, InspectContainerOptions, ListContainersOptions};
use bytes::Bytes;
use futures_util::StreamExt;
use std::collections::HashMap;
use tokio::io::AsyncRead;
use tokio_util::io::StreamReader;

const DOCKER_TIMEOUT_SECS: u64 = 120;

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("docker: {0}")]
    Docker(#[from] bollard::errors::Error),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

/// Container as listed by the engine.
#[derive(Debug, Clone, Default)]
pub struct EngineContainer {
    pub id: String,
    pub name: String,
    /// Image reference the container was created from (may be an id).
    pub image: String,
    pub image_id: String,
    pub status: String,
    pub labels: HashMap<String, String>,
}

/// Runtime state of one container.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EngineContainerState {
    pub id: String,
    pub name: String,
    pub status: String,
    pub image_id: String,
}

#[derive(Debug, Clone, Default)]
pub struct EngineImage {
    pub id: String,
    pub repo_tags: Vec<String>,
    pub repo_digests: Vec<String>,
    pub architecture: String,
    pub os: String,
    pub variant: Option<String>,
    pub created: Option<String>,
    /// Legacy `Config.Image` identifier, used as a digest surrogate for v1 manifests.
    pub config_image: Option<String>,
}

pub type EventReader = Box<dyn AsyncRead + Send + Unpin>;

#[async_trait]
pub trait ContainerEngine: Send + Sync {
    async fn list_containers(&self, all: bool) -> Result<Vec<EngineContainer>, EngineError>;

    /// `None` when the container no longer exists.
    async fn inspect_container(&self, id: &str) -> Result<Option<EngineContainerState>, EngineError>;

    async fn find_container_by_name(&self, name: &str) -> Result<Option<EngineContainerState>, EngineError>;

    async fn inspect_image(&self, image: &str) -> Result<EngineImage, EngineError>;

    /// Newline-delimited JSON stream of container lifecycle events.
    async fn events(&self) -> Result<EventReader, EngineError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
    Socket(String),
    Tcp { host: String, port: u16 },
}

pub struct DockerEngine {
    docker: Docker,
}

fn is_not_found(e: &bollard::errors::Error) -> bool {
    matches!(
        e,
        bollard::errors::Error::DockerResponseServerError {
            status_code: 404,
            ..
        }
    )
}

fn container_name(names: Option<&Vec<String>>, fallback: &str) -> String {
    names
        .and_then(|n| n.first())
        .map(|n| n.trim_start_matches('/').to_string())
        .unwrap_or_else(|| fallback.to_string())
}

/// Re-encode a decoded event as one JSON line, so every engine feeds the same codec.
fn event_line(message: Result<EventMessage, bollard::errors::Error>) -> std::io::Result<Bytes> {
    let message = message.map_err(std::io::Error::other)?;
    let mut line = serde_json::to_vec(&message)?;
    line.push(b'\n');
    Ok(Bytes::from(line))
}

impl DockerEngine {
    pub fn connect(endpoint: Endpoint) -> Result<Self, EngineError> {
        let docker = match endpoint {
            Endpoint::Socket(path) => {
                Docker::connect_with_unix(&path, DOCKER_TIMEOUT_SECS, bollard::API_DEFAULT_VERSION)?
            }
            Endpoint::Tcp { host, port } => Docker::connect_with_http(
                &format!("tcp://{host}:{port}"),
                DOCKER_TIMEOUT_SECS,
                bollard::API_DEFAULT_VERSION,
            )?,
        };
        Ok(Self { docker })
    }
}

#[async_trait]
impl ContainerEngine for DockerEngine {
    async fn list_containers(&self, all: bool) -> Result<Vec<EngineContainer>, EngineError> {
        let options = ListContainersOptions {
            all,
            ..Default::default()
        };
        let containers = self.docker.list_containers(Some(options)).await?;
        Ok(containers
            .into_iter()
            .map(|c| {
                let id = c.id.clone().unwrap_or_default();
                EngineContainer {
                    name: container_name(c.names.as_ref(), &id),
                    image: c.image.clone().unwrap_or_default(),
                    image_id: c.image_id.clone().unwrap_or_default(),
                    status: c.state.as_ref().map(|s| s.to_string()).unwrap_or_default(),
                    labels: c.labels.clone().unwrap_or_default(),
                    id,
                }
            })
            .collect())
    }

    async fn inspect_container(&self, id: &str) -> Result<Option<EngineContainerState>, EngineError> {
        match self
            .docker
            .inspect_container(id, None::<InspectContainerOptions>)
            .await
        {
            Ok(inspect) => Ok(Some(EngineContainerState {
                id: inspect.id.clone().unwrap_or_else(|| id.to_string()),
                name: inspect
                    .name
                    .as_deref()
                    .unwrap_or(id)
                    .trim_start_matches('/')
                    .to_string(),
                status: inspect
                    .state
                    .as_ref()
                    .and_then(|s| s.status.as_ref())
                    .map(|s| s.to_string())
                    .unwrap_or_default(),
                image_id: inspect.image.clone().unwrap_or_default(),
            })),
            Err(e) if is_not_found(&e) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn find_container_by_name(&self, name: &str) -> Result<Option<EngineContainerState>, EngineError> {
        let mut filters = HashMap::new();
        filters.insert("name".to_string(), vec![name.to_string()]);
        let options = ListContainersOptions {
            all: true,
            filters: Some(filters),
            ..Default::default()
        };
        let containers = self.docker.list_containers(Some(options)).await?;
        // The name filter matches substrings
        let found = containers.into_iter().find(|c| {
            c.names
                .as_ref()
                .is_some_and(|names| names.iter().any(|n| n.trim_start_matches('/') == name))
        });
        Ok(found.map(|c| EngineContainerState {
            id: c.id.clone().unwrap_or_default(),
            name: name.to_string(),
            status: c.state.as_ref().map(|s| s.to_string()).unwrap_or_default(),
            image_id: c.image_id.clone().unwrap_or_default(),
        }))
    }

    async fn inspect_image(&self, image: &str) -> Result<EngineImage, EngineError> {
        let inspect = self.docker.inspect_image(image).await?;
        // Config.Image is a legacy field absent from the typed model
        let config_image = serde_json::to_value(&inspect)
            .ok()
            .and_then(|v| {
                v.pointer("/Config/Image")
                    .and_then(|i| i.as_str())
                    .map(str::to_string)
            })
            .filter(|i| !i.is_empty());
        Ok(EngineImage {
            id: inspect.id.clone().unwrap_or_default(),
            repo_tags: inspect.repo_tags.clone().unwrap_or_default(),
            repo_digests: inspect.repo_digests.clone().unwrap_or_default(),
            architecture: inspect.architecture.clone().unwrap_or_default(),
            os: inspect.os.clone().unwrap_or_default(),
            variant: inspect.variant.clone().filter(|v| !v.is_empty()),
            created: inspect.created.as_ref().map(|c| c.to_string()),
            config_image,
        })
    }

    async fn events(&self) -> Result<EventReader, EngineError> {
        let mut filters = HashMap::new();
        filters.insert("type".to_string(), vec!["container".to_string()]);
        filters.insert(
            "event".to_string(),
            WATCHED_ACTIONS.iter().map(|a| a.to_string()).collect(),
        );
        let options = EventsOptions {
            filters: Some(filters),
            ..Default::default()
        };
        let lines = self.docker.events(Some(options)).map(event_line);
        Ok(Box::new(StreamReader::new(Box::pin(lines))))
    }
}
