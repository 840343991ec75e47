// Install orchestration: run the install action, wait for the engine to run the new
// image, force a rescan, then reconcile the store.

use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::time::{Duration, sleep, timeout};

use super::{Mode, Trigger, TriggerError};
use crate::config::InstallConfig;
use crate::engine::{ContainerEngine, EngineContainerState};
use crate::event::WatcherEvent;
use crate::models::{Container, Notification, NotificationLevel};
use crate::store::{ContainerQuery, ContainerStore};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum InstallPhase {
    Started,
    ScriptRunning,
    AwaitingImageUpdate,
    AwaitingWatcherRescan,
    Reconciled,
    Failed,
}

#[derive(Debug, thiserror::Error)]
pub enum InstallError {
    #[error("Install not enabled")]
    NotEnabled,
    #[error("Multiple install triggers are configured. Please ensure only one trigger has install enabled.")]
    Ambiguous,
    #[error("Trigger {0} runs in batch mode and cannot install")]
    BatchMode(String),
    #[error("Container {0} not found")]
    ContainerNotFound(String),
    #[error("No watcher {0} for this container")]
    UnknownWatcher(String),
    #[error("Install action failed: {0}")]
    Action(#[source] TriggerError),
    #[error("Container {name} did not run a new image within {}s", .after.as_secs())]
    ImageUpdateTimeout { name: String, after: Duration },
    #[error("Watcher {watcher} did not finish a rescan within {}s", .after.as_secs())]
    RescanTimeout { watcher: String, after: Duration },
    #[error("Watcher events closed while waiting for watcher {0}")]
    WatcherGone(String),
}

/// Result handed back to whoever asked for the install.
#[derive(Debug, Clone, Serialize)]
pub struct InstallOutcome {
    pub success: bool,
    pub message: String,
    pub phase: InstallPhase,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub container: Option<Container>,
}

#[derive(Debug, Clone)]
pub struct InstallTimings {
    pub poll_interval: Duration,
    pub image_update_timeout: Duration,
    pub rescan_timeout: Duration,
    pub cleanup_attempts: u32,
    pub cleanup_backoff: Duration,
}

impl From<&InstallConfig> for InstallTimings {
    fn from(config: &InstallConfig) -> Self {
        Self {
            poll_interval: Duration::from_millis(config.poll_interval_ms),
            image_update_timeout: Duration::from_secs(config.image_update_timeout_secs),
            rescan_timeout: Duration::from_secs(config.rescan_timeout_secs),
            cleanup_attempts: config.cleanup_attempts,
            cleanup_backoff: Duration::from_millis(config.cleanup_backoff_ms),
        }
    }
}

pub struct Installer {
    store: Arc<ContainerStore>,
    /// Engine per watcher name.
    engines: HashMap<String, Arc<dyn ContainerEngine>>,
    timings: InstallTimings,
}

impl Installer {
    pub fn new(
        store: Arc<ContainerStore>,
        engines: HashMap<String, Arc<dyn ContainerEngine>>,
        timings: InstallTimings,
    ) -> Self {
        Self {
            store,
            engines,
            timings,
        }
    }

    /// Refusals (unknown container, unusable trigger) are errors. Once started, failures
    /// come back as an unsuccessful outcome with an error notification on the container.
    pub async fn install(&self, trigger: &dyn Trigger, id: &str) -> Result<InstallOutcome, InstallError> {
        if !trigger.install_enabled() {
            return Err(InstallError::NotEnabled);
        }
        if trigger.common().mode == Mode::Batch {
            return Err(InstallError::BatchMode(trigger.id()));
        }
        let container = self
            .store
            .get(id)
            .await
            .ok_or_else(|| InstallError::ContainerNotFound(id.to_string()))?;
        let engine = self
            .engines
            .get(&container.watcher)
            .cloned()
            .ok_or_else(|| InstallError::UnknownWatcher(container.watcher.clone()))?;

        tracing::info!(trigger = %trigger.id(), container = %container.full_name(), phase = ?InstallPhase::Started, "Install started");
        self.notify(
            &container.id,
            NotificationLevel::Info,
            format!("Update of {} started", container.name),
        )
        .await;

        match self.run(trigger, &container, engine.as_ref()).await {
            Ok(updated) => {
                let target = container
                    .update_kind()
                    .remote_value
                    .unwrap_or_else(|| updated.image_id.clone());
                let message = format!("Container {} updated to {}", container.name, target);
                let stored = self
                    .notify(&updated.id, NotificationLevel::Success, message.clone())
                    .await;
                tracing::info!(container = %container.full_name(), phase = ?InstallPhase::Reconciled, "{}", message);
                Ok(InstallOutcome {
                    success: true,
                    message,
                    phase: InstallPhase::Reconciled,
                    container: stored,
                })
            }
            Err((phase, e)) => {
                let message = format!("Update of {} failed: {}", container.name, e);
                tracing::warn!(container = %container.full_name(), phase = ?phase, error = %e, "Install failed");
                let stored = self
                    .notify(&container.id, NotificationLevel::Error, message.clone())
                    .await;
                Ok(InstallOutcome {
                    success: false,
                    message,
                    phase: InstallPhase::Failed,
                    container: stored,
                })
            }
        }
    }

    async fn run(
        &self,
        trigger: &dyn Trigger,
        container: &Container,
        engine: &dyn ContainerEngine,
    ) -> Result<EngineContainerState, (InstallPhase, InstallError)> {
        tracing::debug!(container = %container.full_name(), phase = ?InstallPhase::ScriptRunning, "Install phase");
        trigger
            .install(container)
            .await
            .map_err(|e| (InstallPhase::ScriptRunning, InstallError::Action(e)))?;

        tracing::debug!(container = %container.full_name(), phase = ?InstallPhase::AwaitingImageUpdate, "Install phase");
        let updated = self
            .await_image_update(container, engine)
            .await
            .map_err(|e| (InstallPhase::AwaitingImageUpdate, e))?;

        tracing::debug!(container = %container.full_name(), phase = ?InstallPhase::AwaitingWatcherRescan, "Install phase");
        self.await_rescan(&container.watcher)
            .await
            .map_err(|e| (InstallPhase::AwaitingWatcherRescan, e))?;

        self.reconcile(container, &updated.id).await;
        Ok(updated)
    }

    /// Poll for a running container of the same name on a different image.
    async fn await_image_update(
        &self,
        container: &Container,
        engine: &dyn ContainerEngine,
    ) -> Result<EngineContainerState, InstallError> {
        let poll = async {
            loop {
                match engine.find_container_by_name(&container.name).await {
                    Ok(Some(state))
                        if state.image_id != container.image.id && state.status == "running" =>
                    {
                        return state;
                    }
                    Ok(_) => {}
                    Err(e) => {
                        tracing::debug!(container = %container.full_name(), error = %e, "Unable to find container");
                    }
                }
                sleep(self.timings.poll_interval).await;
            }
        };
        timeout(self.timings.image_update_timeout, poll)
            .await
            .map_err(|_| InstallError::ImageUpdateTimeout {
                name: container.name.clone(),
                after: self.timings.image_update_timeout,
            })
    }

    /// Request a scan and wait for that scan's start and stop. The receiver is dropped on
    /// every path, which unsubscribes it.
    async fn await_rescan(&self, watcher: &str) -> Result<(), InstallError> {
        let mut events = self.store.bus().subscribe_watcher();
        self.store.bus().request_watch(watcher);

        let wait = async {
            let mut started = false;
            loop {
                match events.recv().await {
                    Ok(WatcherEvent::Start { watcher: w }) if w == watcher => started = true,
                    Ok(WatcherEvent::Stop { watcher: w }) if w == watcher && started => return Ok(()),
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(_)) => {}
                    Err(broadcast::error::RecvError::Closed) => {
                        return Err(InstallError::WatcherGone(watcher.to_string()));
                    }
                }
            }
        };
        match timeout(self.timings.rescan_timeout, wait).await {
            Ok(result) => result,
            Err(_) => Err(InstallError::RescanTimeout {
                watcher: watcher.to_string(),
                after: self.timings.rescan_timeout,
            }),
        }
    }

    /// Delete every other record of the same (name, watcher). Engine-side removal is not
    /// synchronous, so each sweep waits out the back-off before checking again, for at most
    /// `cleanup_attempts` sweeps; leftovers are left to the next scan.
    async fn reconcile(&self, container: &Container, keep_id: &str) {
        let query = ContainerQuery::name_and_watcher(&container.name, &container.watcher);
        let others = |all: Vec<Container>| -> Vec<Container> {
            all.into_iter().filter(|c| c.id != keep_id).collect()
        };

        let mut remaining = others(self.store.list_all(&query).await);
        let mut attempt = 0;
        while !remaining.is_empty() && attempt < self.timings.cleanup_attempts {
            attempt += 1;
            for stale in &remaining {
                if let Err(e) = self.store.delete(&stale.id).await {
                    tracing::warn!(container = %stale.full_name(), id = %stale.id, error = %e, "Unable to delete old container record");
                }
            }
            sleep(self.timings.cleanup_backoff).await;
            remaining = others(self.store.list_all(&query).await);
        }
        if !remaining.is_empty() {
            tracing::warn!(
                container = %container.full_name(),
                remaining = remaining.len(),
                "Old container records still present after cleanup"
            );
        }
    }

    /// Attach a notification; a missing record is logged, not an error.
    async fn notify(&self, id: &str, level: NotificationLevel, message: String) -> Option<Container> {
        let notification = Notification::new(level, message);
        match self.store.modify(id, |c| c.notification = Some(notification)).await {
            Ok(container) => Some(container),
            Err(e) => {
                tracing::warn!(id = %id, error = %e, "Unable to store notification");
                None
            }
        }
    }
}
