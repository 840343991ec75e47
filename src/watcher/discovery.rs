// Container discovery: list, filter by label, hydrate image metadata, prune stale records

use futures_util::future::join_all;
use std::collections::HashSet;

use super::image_ref::ImageReference;
use super::labels;
use super::{WatchError, Watcher};
use crate::engine::EngineContainer;
use crate::models::{
    Container, Image, ImageDigest, ImageRegistry, ImageTag, NotificationLevel, UpdateResult,
};
use crate::store::ContainerQuery;
use crate::tag;

impl Watcher {
    /// Running containers to watch, hydrated and normalized. Stale store records for
    /// this watcher are pruned on the way.
    pub async fn get_containers(&self) -> Result<Vec<Container>, WatchError> {
        let listed = self.engine.list_containers(self.config.watchall).await?;
        let to_watch = listed.into_iter().filter(|c| {
            labels::is_container_to_watch(c.labels.get(labels::WATCH), self.config.watchbydefault)
        });
        let hydrated = join_all(to_watch.map(|c| self.add_image_details(c))).await;
        let mut containers: Vec<Container> = hydrated.into_iter().flatten().collect();
        self.prune_old_containers(&mut containers).await;
        Ok(containers)
    }

    async fn add_image_details(&self, listed: EngineContainer) -> Option<Container> {
        let state = match self.engine.inspect_container(&listed.id).await {
            Ok(state) => state,
            Err(e) => {
                tracing::warn!(watcher = %self.name, id = %listed.id, error = %e, "Unable to inspect container");
                None
            }
        };
        let stored = self.store.get(&listed.id).await;
        let Some(state) = state.filter(|s| s.status == "running") else {
            if stored.is_some() {
                self.forget(&listed.id).await;
            }
            return None;
        };

        if let Some(stored) = stored {
            if stored.error.is_none() && stored.is_running() {
                return Some(stored);
            }
            if !stored.is_running() {
                self.forget(&listed.id).await;
            }
        }

        let image = match self.engine.inspect_image(&listed.image).await {
            Ok(image) => image,
            Err(e) => {
                tracing::warn!(watcher = %self.name, container = %listed.name, error = %e, "Unable to inspect image");
                return None;
            }
        };

        // Containers started from an image id carry no reference; fall back to its tags
        let reference = if listed.image.contains("sha256:") {
            match image.repo_tags.first() {
                Some(tag) => tag.clone(),
                None => {
                    tracing::warn!(watcher = %self.name, container = %listed.name, "Cannot get a reliable tag for this image");
                    return None;
                }
            }
        } else {
            listed.image.clone()
        };
        let parsed = ImageReference::parse(&reference);
        let tag_value = parsed.tag_or_latest();

        let label = |key: &str| listed.labels.get(key).filter(|v| !v.is_empty()).cloned();
        let transform_tags = label(labels::TAG_TRANSFORM);
        let semver = tag::parse(&tag::transform(transform_tags.as_deref(), &tag_value)).is_some();
        let watch_digest = labels::is_digest_to_watch(listed.labels.get(labels::WATCH_DIGEST), semver);
        if !semver && !watch_digest {
            tracing::warn!(
                watcher = %self.name,
                container = %listed.name,
                "Image is not semver and digest watching is disabled so no update will be reported"
            );
        }
        let repo_digest = image
            .repo_digests
            .first()
            .and_then(|d| d.split('@').nth(1))
            .map(str::to_string);

        let mut container = Container {
            id: listed.id.clone(),
            name: state.name.clone(),
            display_name: label(labels::DISPLAY_NAME).unwrap_or_else(|| state.name.clone()),
            display_icon: label(labels::DISPLAY_ICON).unwrap_or_default(),
            status: state.status.clone(),
            watcher: self.name.clone(),
            include_tags: label(labels::TAG_INCLUDE),
            exclude_tags: label(labels::TAG_EXCLUDE),
            transform_tags,
            link_template: label(labels::LINK_TEMPLATE),
            trigger_include: label(labels::TRIGGER_INCLUDE),
            trigger_exclude: label(labels::TRIGGER_EXCLUDE),
            compose_project: label(labels::COMPOSE_PROJECT),
            image: Image {
                id: image.id.clone(),
                registry: ImageRegistry {
                    name: String::new(),
                    url: parsed.domain.clone().unwrap_or_default(),
                },
                name: parsed.path.clone(),
                tag: ImageTag {
                    value: tag_value.clone(),
                    semver,
                },
                digest: ImageDigest {
                    watch: watch_digest,
                    value: None,
                    repo: repo_digest,
                },
                architecture: image.architecture.clone(),
                os: image.os.clone(),
                variant: image.variant.clone(),
                created: image.created.clone(),
            },
            result: Some(UpdateResult {
                tag: Some(tag_value),
                ..Default::default()
            }),
            error: None,
            notification: None,
            labels: listed.labels.into_iter().collect(),
        };
        container.image = self.registries.normalize(container.image);
        match container.validate() {
            Ok(valid) => Some(valid),
            Err(e) => {
                tracing::warn!(watcher = %self.name, container = %listed.name, error = %e, "Invalid container");
                None
            }
        }
    }

    async fn forget(&self, id: &str) {
        if let Err(e) = self.store.delete(id).await {
            tracing::warn!(watcher = %self.name, id = %id, error = %e, "Unable to delete container");
        }
    }

    /// Delete records of containers that disappeared. A disappeared record whose state
    /// is still relevant is carried over to the container that replaced it (same name),
    /// or kept while an install is in flight. The replaced record stays the reference
    /// for the replacement's first `changed` check.
    async fn prune_old_containers(&self, current: &mut [Container]) {
        let current_ids: HashSet<String> = current.iter().map(|c| c.id.clone()).collect();
        let stored = self.store.list_all(&ContainerQuery::watcher(&self.name)).await;
        for old in stored.into_iter().filter(|c| !current_ids.contains(&c.id)) {
            match current.iter_mut().find(|c| c.name == old.name) {
                Some(survivor) => {
                    if survivor.notification.is_none() {
                        survivor.notification = old.notification.clone();
                    }
                    if self.store.get(&survivor.id).await.is_none() {
                        self.predecessors
                            .lock()
                            .await
                            .insert(survivor.id.clone(), old.clone());
                    }
                }
                None => {
                    let install_in_flight = old
                        .notification
                        .as_ref()
                        .is_some_and(|n| n.level == NotificationLevel::Info);
                    if install_in_flight {
                        tracing::debug!(watcher = %self.name, container = %old.full_name(), "Keeping record of container being updated");
                        continue;
                    }
                }
            }
            self.forget(&old.id).await;
        }
    }
}
