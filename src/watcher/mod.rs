// Watcher: one per container-engine host. Scans on a cron schedule, on debounced engine
// events and on explicit requests; resolves new versions and reconciles the store.

mod discovery;
pub mod image_ref;
pub mod labels;

use futures_util::StreamExt;
use futures_util::future::join_all;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, broadcast, mpsc, watch};
use tokio::time::{Duration, Instant, sleep_until};
use tokio_util::codec::FramedRead;

use crate::config::{WatcherConfig, parse_cron};
use crate::engine::{ContainerEngine, EngineError, EngineEvent, EngineEventCodec};
use crate::event::EventBus;
use crate::models::{Container, ContainerError, ContainerReport, UpdateResult};
use crate::registry::{Registries, RegistryError};
use crate::store::{ContainerStore, StoreError};
use crate::tag;

/// Delay before the first scan when watching at start.
pub const START_DELAY: Duration = Duration::from_secs(1);
/// Engine events arriving within this window produce a single scan.
pub const DEBOUNCE: Duration = Duration::from_secs(5);
/// Wait before reopening an ended or failed event stream.
const EVENTS_RECONNECT_DELAY: Duration = Duration::from_secs(10);

#[derive(Debug, thiserror::Error)]
pub enum WatchError {
    #[error(transparent)]
    Engine(#[from] EngineError),
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("invalid tag filter: {0}")]
    Regex(#[from] regex::Error),
}

pub struct Watcher {
    name: String,
    config: WatcherConfig,
    engine: Arc<dyn ContainerEngine>,
    registries: Registries,
    store: Arc<ContainerStore>,
    bus: EventBus,
    /// One scan at a time per host.
    scan_lock: Mutex<()>,
    /// Pruned records keyed by the id of the container that replaced them.
    predecessors: Mutex<HashMap<String, Container>>,
}

impl Watcher {
    pub fn new(
        name: &str,
        config: WatcherConfig,
        engine: Arc<dyn ContainerEngine>,
        registries: Registries,
        store: Arc<ContainerStore>,
    ) -> Self {
        let bus = store.bus().clone();
        Self {
            name: name.to_lowercase(),
            config,
            engine,
            registries,
            store,
            bus,
            scan_lock: Mutex::new(()),
            predecessors: Mutex::new(HashMap::new()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &WatcherConfig {
        &self.config
    }

    pub fn engine(&self) -> Arc<dyn ContainerEngine> {
        self.engine.clone()
    }

    /// Scan and log a summary.
    pub async fn watch_from_cron(&self) -> Vec<ContainerReport> {
        tracing::info!(watcher = %self.name, "Cron started");
        let reports = self.watch().await;
        let errors = reports.iter().filter(|r| r.container.error.is_some()).count();
        let updates = reports
            .iter()
            .filter(|r| r.container.update_available())
            .count();
        tracing::info!(
            watcher = %self.name,
            "Cron finished ({} containers watched, {} errors, {} available updates)",
            reports.len(),
            errors,
            updates
        );
        reports
    }

    /// Full scan: start event, per-container watch, batch report, stop event.
    pub async fn watch(&self) -> Vec<ContainerReport> {
        let _scan = self.scan_lock.lock().await;
        self.bus.emit_watcher_start(&self.name);

        let containers = match self.get_containers().await {
            Ok(containers) => containers,
            Err(e) => {
                tracing::warn!(watcher = %self.name, error = %e, "Error when trying to get the list of the containers to watch");
                Vec::new()
            }
        };
        let reports: Vec<ContainerReport> =
            join_all(containers.into_iter().map(|c| self.watch_container(c)))
                .await
                .into_iter()
                .flatten()
                .collect();
        self.bus.emit_container_reports(reports.clone());

        self.bus.emit_watcher_stop(&self.name);
        reports
    }

    /// Resolve and persist one container. Errors end up on the container, never propagate.
    /// `None` when the stored container stopped running and was removed.
    pub async fn watch_container(&self, mut container: Container) -> Option<ContainerReport> {
        container.result = None;
        container.error = None;
        let predecessor = self.predecessors.lock().await.remove(&container.id);

        if let Some(stored) = self.store.get(&container.id).await
            && !stored.is_running()
        {
            if let Err(e) = self.store.delete(&container.id).await {
                tracing::warn!(watcher = %self.name, container = %container.full_name(), error = %e, "Unable to delete container");
            }
            return None;
        }

        match self.find_new_version(&mut container).await {
            Ok(result) => {
                container.result = Some(result);
                match self.map_to_report(container.clone(), predecessor).await {
                    Ok(report) => {
                        self.bus.emit_container_report(report.clone());
                        Some(report)
                    }
                    Err(e) => Some(self.failed(container, &WatchError::from(e)).await),
                }
            }
            Err(e) => Some(self.failed(container, &e).await),
        }
    }

    async fn failed(&self, mut container: Container, error: &WatchError) -> ContainerReport {
        tracing::warn!(watcher = %self.name, container = %container.full_name(), error = %error, "Error when processing");
        container.error = Some(ContainerError {
            message: error.to_string(),
        });
        let persisted = self
            .store
            .upsert_with(container.clone(), carry_notification)
            .await;
        let report = ContainerReport {
            container: persisted.unwrap_or(container),
            changed: false,
        };
        self.bus.emit_container_report(report.clone());
        report
    }

    /// Persist and compute `changed` against the previously stored result. A recreated
    /// container has no record of its own yet and compares against its predecessor.
    async fn map_to_report(
        &self,
        container: Container,
        predecessor: Option<Container>,
    ) -> Result<ContainerReport, StoreError> {
        let mut previous = None;
        let stored = self
            .store
            .upsert_with(container, |existing, incoming| {
                previous = existing.cloned();
                carry_notification(existing, incoming)
            })
            .await?;
        let previous = previous.or(predecessor);
        let changed = stored.result_changed(previous.as_ref()) && stored.update_available();
        Ok(ContainerReport {
            container: stored,
            changed,
        })
    }

    /// Remote tag (first candidate, else the current tag) and, when watched, digests.
    pub async fn find_new_version(&self, container: &mut Container) -> Result<UpdateResult, WatchError> {
        let registry_name = container.image.registry.name.clone();
        let provider = self
            .registries
            .get(&registry_name)
            .ok_or(RegistryError::Unsupported(registry_name))?;

        let mut result = UpdateResult {
            tag: Some(container.image.tag.value.clone()),
            ..Default::default()
        };
        let tags = provider.get_tags(&container.image).await?;
        let candidates = tag::candidates(container, &tags)?;

        if container.image.digest.watch
            && let Some(repo) = container.image.digest.repo.clone()
        {
            let mut target = container.image.clone();
            if let Some(candidate) = candidates.first() {
                target.tag.value = candidate.clone();
            }
            let remote = provider.get_image_manifest_digest(&target, None).await?;
            result.digest = remote.digest;
            result.created = remote.created;

            if remote.version == 2 {
                let local = provider
                    .get_image_manifest_digest(&container.image, Some(&repo))
                    .await?;
                container.image.digest.value = local.digest;
            } else {
                // v1 manifests expose the config image id instead of a content digest
                let image = self.engine.inspect_image(&container.image.id).await?;
                container.image.digest.value = image.config_image;
            }
        }

        if let Some(candidate) = candidates.into_iter().next() {
            result.tag = Some(candidate);
        }
        Ok(result)
    }

    /// React to one engine event. Returns true when the container set changed and a
    /// (debounced) scan is due; otherwise refreshes the stored status.
    pub async fn handle_event(&self, event: &EngineEvent) -> bool {
        if event.changes_container_set() {
            return true;
        }
        let Some(id) = event.container_id() else {
            return false;
        };
        let Some(stored) = self.store.get(id).await else {
            return false;
        };
        match self.engine.inspect_container(id).await {
            Ok(Some(state)) if state.status != stored.status => {
                let previous = stored.status.clone();
                let status = state.status.clone();
                match self.store.modify(id, |c| c.status = status).await {
                    Ok(updated) => tracing::info!(
                        watcher = %self.name,
                        container = %updated.full_name(),
                        "Status changed from {} to {}",
                        previous,
                        updated.status
                    ),
                    Err(e) => tracing::warn!(watcher = %self.name, id = %id, error = %e, "Unable to update container status"),
                }
            }
            Ok(_) => {}
            Err(e) => {
                tracing::debug!(watcher = %self.name, id = %id, error = %e, "Unable to get container details");
            }
        }
        false
    }
}

/// Keep the stored notification when the incoming record has none.
fn carry_notification(existing: Option<&Container>, mut incoming: Container) -> Container {
    if incoming.notification.is_none() {
        incoming.notification = existing.and_then(|e| e.notification.clone());
    }
    incoming
}

/// Sends on `tx` at each scheduled time (local time).
async fn cron_scheduler(watcher: String, schedule: cron::Schedule, tx: mpsc::Sender<()>) {
    loop {
        let now = chrono::Local::now();
        let Some(next) = schedule.after(&now).next() else {
            tracing::warn!(watcher = %watcher, "Cron schedule has no upcoming time");
            return;
        };
        let delay = (next - now).to_std().unwrap_or(Duration::from_secs(1));
        tokio::time::sleep(delay).await;
        if tx.send(()).await.is_err() {
            break;
        }
    }
}

/// Follows the engine event stream, reconnecting after a delay when it ends.
/// Container-set changes are forwarded on `tx` for debouncing.
async fn event_listener(watcher: Arc<Watcher>, tx: mpsc::Sender<()>) {
    loop {
        match watcher.engine.events().await {
            Ok(reader) => {
                tracing::info!(watcher = %watcher.name, "Listening to docker events");
                let mut events = FramedRead::new(reader, EngineEventCodec::default());
                while let Some(next) = events.next().await {
                    match next {
                        Ok(event) => {
                            if watcher.handle_event(&event).await {
                                // A full channel already holds a pending scan
                                let _ = tx.try_send(());
                            }
                        }
                        Err(e) => {
                            tracing::warn!(watcher = %watcher.name, error = %e, "Docker event stream failed");
                            break;
                        }
                    }
                }
                tracing::debug!(watcher = %watcher.name, "Docker event stream ended");
            }
            Err(e) => {
                tracing::warn!(watcher = %watcher.name, error = %e, "Unable to listen to docker events");
            }
        }
        if tx.is_closed() {
            return;
        }
        tokio::time::sleep(EVENTS_RECONNECT_DELAY).await;
    }
}

/// Spawns the watcher loop. Exits when `shutdown_rx` flips to true.
pub fn spawn(watcher: Arc<Watcher>, mut shutdown_rx: watch::Receiver<bool>) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let (cron_tx, mut cron_rx) = mpsc::channel::<()>(1);
        let scheduler = match parse_cron(&watcher.config.cron) {
            Ok(schedule) => {
                tracing::info!(watcher = %watcher.name, cron = %watcher.config.cron, "Schedule watch cron");
                Some(tokio::spawn(cron_scheduler(watcher.name.clone(), schedule, cron_tx)))
            }
            Err(e) => {
                tracing::warn!(watcher = %watcher.name, cron = %watcher.config.cron, error = %e, "Invalid cron; scheduled scans disabled");
                None
            }
        };

        let (event_tx, mut event_rx) = mpsc::channel::<()>(1);
        let listener = watcher
            .config
            .watchevents
            .then(|| tokio::spawn(event_listener(watcher.clone(), event_tx)));

        let mut trigger_rx = watcher.bus.subscribe_trigger_watch();
        let mut start_at = watcher.config.watchatstart.then(|| Instant::now() + START_DELAY);
        let mut debounce_at: Option<Instant> = None;

        loop {
            tokio::select! {
                Some(()) = cron_rx.recv() => {
                    watcher.watch_from_cron().await;
                }
                Some(()) = event_rx.recv() => {
                    debounce_at = Some(Instant::now() + DEBOUNCE);
                }
                _ = sleep_until(debounce_at.unwrap_or_else(Instant::now)), if debounce_at.is_some() => {
                    debounce_at = None;
                    watcher.watch_from_cron().await;
                }
                _ = sleep_until(start_at.unwrap_or_else(Instant::now)), if start_at.is_some() => {
                    start_at = None;
                    watcher.watch_from_cron().await;
                }
                requested = trigger_rx.recv() => {
                    match requested {
                        Ok(name) if name == watcher.name => {
                            watcher.watch_from_cron().await;
                        }
                        Ok(_) => {}
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            tracing::debug!(watcher = %watcher.name, skipped = n, "Watch requests lagged");
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    }
                }
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        break;
                    }
                }
            }
        }

        if let Some(handle) = scheduler {
            handle.abort();
        }
        if let Some(handle) = listener {
            handle.abort();
        }
        tracing::debug!(watcher = %watcher.name, "Watcher shutting down");
    })
}
