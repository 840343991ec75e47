// Install orchestration tests: engine swap, forced rescan, reconciliation and failure paths

mod common;

use async_trait::async_trait;
use common::FakeEngine;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use tagwatch::engine::ContainerEngine;
use tagwatch::models::{Container, Notification, NotificationLevel, UpdateResult};
use tagwatch::store::ContainerStore;
use tagwatch::trigger::install::InstallTimings;
use tagwatch::trigger::{
    InstallError, InstallPhase, Installer, Mode, Trigger, TriggerCommon, TriggerError,
};
use tagwatch::watcher;
use tokio::sync::watch;
use tokio::time::Duration;

/// Install action that optionally recreates the container on a new image.
struct Recreate {
    engine: Arc<FakeEngine>,
    swap: bool,
    fail: bool,
    common: TriggerCommon,
}

impl Recreate {
    fn new(engine: Arc<FakeEngine>) -> Self {
        Self {
            engine,
            swap: true,
            fail: false,
            common: TriggerCommon::default(),
        }
    }
}

#[async_trait]
impl Trigger for Recreate {
    fn provider(&self) -> &'static str {
        "recreate"
    }

    fn name(&self) -> &str {
        "test"
    }

    fn common(&self) -> &TriggerCommon {
        &self.common
    }

    fn install_enabled(&self) -> bool {
        true
    }

    fn mask_configuration(&self) -> serde_json::Value {
        serde_json::json!({})
    }

    async fn trigger(&self, _container: &Container) -> Result<(), TriggerError> {
        Ok(())
    }

    async fn trigger_batch(&self, _containers: &[Container]) -> Result<(), TriggerError> {
        Ok(())
    }

    async fn install(&self, container: &Container) -> Result<(), TriggerError> {
        if self.fail {
            return Err(TriggerError::ScriptExit(2));
        }
        if self.swap {
            self.engine.remove(&container.id);
            self.engine.run("new", &container.name, "registry.test/app:1.3.0", &[]);
        }
        Ok(())
    }
}

fn timings() -> InstallTimings {
    InstallTimings {
        poll_interval: Duration::from_millis(10),
        image_update_timeout: Duration::from_millis(300),
        rescan_timeout: Duration::from_millis(300),
        cleanup_attempts: 2,
        cleanup_backoff: Duration::from_millis(10),
    }
}

/// Engine running `old` (app 1.2.0) and a store record for it with 1.3.0 available.
async fn setup() -> (Arc<FakeEngine>, Arc<ContainerStore>, Installer) {
    let engine = Arc::new(FakeEngine::default());
    engine.run("old", "app", "registry.test/app:1.2.0", &[]);
    let store = common::store();
    let mut old = common::container("old", "app", "1.2.0");
    old.result = Some(UpdateResult {
        tag: Some("1.3.0".into()),
        ..Default::default()
    });
    store.insert(old).await.unwrap();

    let mut engines: HashMap<String, Arc<dyn ContainerEngine>> = HashMap::new();
    engines.insert("local".into(), engine.clone());
    let installer = Installer::new(store.clone(), engines, timings());
    (engine, store, installer)
}

#[tokio::test]
async fn test_install_swaps_container_and_reconciles() {
    let (engine, store, installer) = setup().await;
    let w = common::watcher(
        engine.clone(),
        common::registries(&["1.2.0", "1.3.0"], None),
        store.clone(),
    );
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let handle = watcher::spawn(w, shutdown_rx);
    tokio::time::sleep(Duration::from_millis(50)).await;

    let trigger = Recreate::new(engine);
    let outcome = installer.install(&trigger, "old").await.unwrap();

    assert!(outcome.success, "{}", outcome.message);
    assert_eq!(outcome.phase, InstallPhase::Reconciled);
    assert_eq!(outcome.message, "Container app updated to 1.3.0");
    let updated = outcome.container.unwrap();
    assert_eq!(updated.id, "new");
    assert_eq!(
        updated.notification.map(|n| n.level),
        Some(NotificationLevel::Success)
    );
    assert!(store.get("old").await.is_none());
    assert_eq!(store.get("new").await.unwrap().image.tag.value, "1.3.0");
    assert_eq!(store.bus().watcher_listener_count(), 0);

    shutdown_tx.send(true).unwrap();
    handle.await.unwrap();
}

#[tokio::test]
async fn test_image_never_changing_fails_without_deleting() {
    let (engine, store, installer) = setup().await;
    let mut trigger = Recreate::new(engine);
    trigger.swap = false;

    let outcome = installer.install(&trigger, "old").await.unwrap();
    assert!(!outcome.success);
    assert_eq!(outcome.phase, InstallPhase::Failed);
    assert!(outcome.message.contains("did not run a new image"), "{}", outcome.message);

    let stored = store.get("old").await.unwrap();
    let notification = stored.notification.unwrap();
    assert_eq!(notification.level, NotificationLevel::Error);
    assert!(notification.message.starts_with("Update of app failed"));
    assert_eq!(store.bus().watcher_listener_count(), 0);
}

#[tokio::test]
async fn test_missing_rescan_times_out_and_unsubscribes() {
    let (engine, store, installer) = setup().await;
    let trigger = Recreate::new(engine);

    let outcome = installer.install(&trigger, "old").await.unwrap();
    assert!(!outcome.success);
    assert!(outcome.message.contains("did not finish a rescan"), "{}", outcome.message);
    assert!(store.get("old").await.is_some());
    assert_eq!(store.bus().watcher_listener_count(), 0);
}

#[tokio::test]
async fn test_failed_action_is_reported_on_container() {
    let (engine, store, installer) = setup().await;
    let mut trigger = Recreate::new(engine);
    trigger.fail = true;

    let outcome = installer.install(&trigger, "old").await.unwrap();
    assert!(!outcome.success);
    assert!(outcome.message.contains("Install action failed"));
    assert_eq!(
        store.get("old").await.unwrap().notification.map(|n| n.level),
        Some(NotificationLevel::Error)
    );
}

#[tokio::test]
async fn test_install_refusals() {
    let (engine, store, installer) = setup().await;
    let trigger = Recreate::new(engine.clone());
    assert!(matches!(
        installer.install(&trigger, "missing").await,
        Err(InstallError::ContainerNotFound(id)) if id == "missing"
    ));

    let mut remote = common::container("r1", "cache", "7.0.0");
    remote.watcher = "remote".into();
    store.insert(remote).await.unwrap();
    assert!(matches!(
        installer.install(&trigger, "r1").await,
        Err(InstallError::UnknownWatcher(w)) if w == "remote"
    ));

    let mut batch = Recreate::new(engine);
    batch.common.mode = Mode::Batch;
    assert!(matches!(
        installer.install(&batch, "old").await,
        Err(InstallError::BatchMode(_))
    ));

    // refusals leave no trace on the record
    assert!(store.get("old").await.unwrap().notification.is_none());
}

#[tokio::test]
async fn test_started_notification_is_visible_while_running() {
    let (engine, store, installer) = setup().await;
    let mut rx = store.bus().subscribe_containers();
    let mut trigger = Recreate::new(engine);
    trigger.swap = false;
    installer.install(&trigger, "old").await.unwrap();

    let mut levels = Vec::new();
    while let Ok(event) = rx.try_recv() {
        if let tagwatch::event::ContainerEvent::Updated(c) = event {
            levels.extend(c.notification.map(|n: Notification| n.level));
        }
    }
    assert_eq!(levels, vec![NotificationLevel::Info, NotificationLevel::Error]);
}

#[tokio::test]
async fn test_cleanup_gives_up_after_bounded_sweeps() {
    let (engine, store, installer) = setup().await;
    let bus = store.bus().clone();

    // answers rescan requests without touching the store
    let mut requests = bus.subscribe_trigger_watch();
    let scans = bus.clone();
    let watcher = tokio::spawn(async move {
        while let Ok(name) = requests.recv().await {
            scans.emit_watcher_start(&name);
            scans.emit_watcher_stop(&name);
        }
    });

    // the old record comes back after every deletion
    let mut removals = bus.subscribe_containers();
    let reinserting = store.clone();
    let deleted = Arc::new(AtomicU32::new(0));
    let counter = deleted.clone();
    let revive = tokio::spawn(async move {
        while let Ok(event) = removals.recv().await {
            if let tagwatch::event::ContainerEvent::Removed(c) = event {
                if c.id == "old" {
                    counter.fetch_add(1, Ordering::SeqCst);
                    reinserting.insert(c).await.unwrap();
                }
            }
        }
    });

    let outcome = installer
        .install(&Recreate::new(engine), "old")
        .await
        .unwrap();
    assert!(outcome.success, "{}", outcome.message);
    assert_eq!(outcome.phase, InstallPhase::Reconciled);

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(deleted.load(Ordering::SeqCst), timings().cleanup_attempts);
    assert!(store.get("old").await.is_some());
    revive.abort();
    watcher.abort();
}
