// In-process event bus: typed broadcast topics shared by watchers, store and triggers.
// Dropping a receiver unsubscribes it.

use std::sync::Arc;
use tokio::sync::broadcast;

use crate::models::{Container, ContainerReport};

const DEFAULT_CAPACITY: usize = 256;

#[derive(Debug, Clone)]
pub enum ContainerEvent {
    Added(Container),
    Updated(Container),
    Removed(Container),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatcherEvent {
    Start { watcher: String },
    Stop { watcher: String },
}

#[derive(Clone)]
pub struct EventBus {
    container_report: broadcast::Sender<ContainerReport>,
    container_reports: broadcast::Sender<Arc<Vec<ContainerReport>>>,
    container: broadcast::Sender<ContainerEvent>,
    watcher: broadcast::Sender<WatcherEvent>,
    trigger_watch: broadcast::Sender<String>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        Self {
            container_report: broadcast::channel(capacity).0,
            container_reports: broadcast::channel(capacity).0,
            container: broadcast::channel(capacity).0,
            watcher: broadcast::channel(capacity).0,
            trigger_watch: broadcast::channel(capacity).0,
        }
    }

    // Sends without receivers are not errors for a pub/sub bus.

    pub fn emit_container_report(&self, report: ContainerReport) {
        let _ = self.container_report.send(report);
    }

    pub fn emit_container_reports(&self, reports: Vec<ContainerReport>) {
        let _ = self.container_reports.send(Arc::new(reports));
    }

    pub fn emit_container_added(&self, container: &Container) {
        let _ = self.container.send(ContainerEvent::Added(container.clone()));
    }

    pub fn emit_container_updated(&self, container: &Container) {
        let _ = self.container.send(ContainerEvent::Updated(container.clone()));
    }

    pub fn emit_container_removed(&self, container: &Container) {
        let _ = self.container.send(ContainerEvent::Removed(container.clone()));
    }

    pub fn emit_watcher_start(&self, watcher: &str) {
        let _ = self.watcher.send(WatcherEvent::Start {
            watcher: watcher.to_string(),
        });
    }

    pub fn emit_watcher_stop(&self, watcher: &str) {
        let _ = self.watcher.send(WatcherEvent::Stop {
            watcher: watcher.to_string(),
        });
    }

    /// Ask the named watcher to scan now.
    pub fn request_watch(&self, watcher: &str) {
        let _ = self.trigger_watch.send(watcher.to_string());
    }

    pub fn subscribe_container_report(&self) -> broadcast::Receiver<ContainerReport> {
        self.container_report.subscribe()
    }

    pub fn subscribe_container_reports(&self) -> broadcast::Receiver<Arc<Vec<ContainerReport>>> {
        self.container_reports.subscribe()
    }

    pub fn subscribe_containers(&self) -> broadcast::Receiver<ContainerEvent> {
        self.container.subscribe()
    }

    pub fn subscribe_watcher(&self) -> broadcast::Receiver<WatcherEvent> {
        self.watcher.subscribe()
    }

    pub fn subscribe_trigger_watch(&self) -> broadcast::Receiver<String> {
        self.trigger_watch.subscribe()
    }

    /// Live watcher-event listeners; used to check that waits release their receiver.
    pub fn watcher_listener_count(&self) -> usize {
        self.watcher.receiver_count()
    }
}
