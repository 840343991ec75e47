// Domain models

mod container;

pub use container::{
    Container, ContainerError, DEFAULT_DISPLAY_ICON, DEFAULT_STATUS, Image, ImageDigest,
    ImageRegistry, ImageTag, Notification, NotificationLevel, SemverDiff, UpdateKind,
    UpdateKindKind, UpdateResult, ValidationError,
};

use serde::Serialize;

/// Per-scan result: the container as stored plus whether its result changed
/// while an update is available.
#[derive(Debug, Clone, Serialize)]
pub struct ContainerReport {
    pub container: Container,
    pub changed: bool,
}
