// Triggers: react to container reports (one by one or in batches) and optionally install updates

mod http;
pub mod install;
mod message;
mod ntfy;
pub mod output;
mod script;
mod telegram;

pub use http::Http;
pub use install::{InstallError, InstallOutcome, InstallPhase, Installer};
pub use ntfy::Ntfy;
pub use output::{OutputHub, OutputLine, OutputStream};
pub use script::Script;
pub use telegram::Telegram;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::{broadcast, watch};

use crate::component::ComponentError;
use crate::config::ComponentTables;
use crate::event::EventBus;
use crate::models::{Container, ContainerReport, SemverDiff, UpdateKindKind};

/// Registered provider types, sorted.
pub const PROVIDERS: &[&str] = &["http", "ntfy", "script", "telegram"];

#[derive(Debug, thiserror::Error)]
pub enum TriggerError {
    #[error("http: {0}")]
    Http(#[from] reqwest::Error),
    #[error("{url} returned {status}")]
    Status {
        url: String,
        status: reqwest::StatusCode,
    },
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("Script did not finish within {0} ms")]
    ScriptTimeout(u64),
    #[error("Script exited with code {0}")]
    ScriptExit(i32),
    #[error("Script was terminated by a signal")]
    ScriptSignal,
    #[error("Trigger {0} does not support batch mode")]
    BatchUnsupported(String),
    #[error("Trigger {0} cannot install updates")]
    InstallUnsupported(String),
}

/// Minimum update magnitude for a trigger to fire.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase", try_from = "String")]
pub enum Threshold {
    #[default]
    All,
    Major,
    Minor,
    Patch,
}

impl TryFrom<String> for Threshold {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        match value.to_lowercase().as_str() {
            "all" => Ok(Threshold::All),
            "major" => Ok(Threshold::Major),
            "minor" => Ok(Threshold::Minor),
            "patch" => Ok(Threshold::Patch),
            other => Err(format!(
                "threshold must be one of all, major, minor, patch (got {other:?})"
            )),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase", try_from = "String")]
pub enum Mode {
    #[default]
    Simple,
    Batch,
}

impl TryFrom<String> for Mode {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        match value.to_lowercase().as_str() {
            "simple" => Ok(Mode::Simple),
            "batch" => Ok(Mode::Batch),
            other => Err(format!("mode must be simple or batch (got {other:?})")),
        }
    }
}

/// Options shared by every trigger, flattened into each provider's table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TriggerCommon {
    #[serde(default = "enabled")]
    pub auto: bool,
    #[serde(default)]
    pub threshold: Threshold,
    #[serde(default)]
    pub mode: Mode,
    #[serde(default = "enabled")]
    pub once: bool,
    #[serde(default = "message::default_simple_title")]
    pub simpletitle: String,
    #[serde(default = "message::default_simple_body")]
    pub simplebody: String,
    #[serde(default = "message::default_batch_title")]
    pub batchtitle: String,
}

impl Default for TriggerCommon {
    fn default() -> Self {
        Self {
            auto: true,
            threshold: Threshold::All,
            mode: Mode::Simple,
            once: true,
            simpletitle: message::default_simple_title(),
            simplebody: message::default_simple_body(),
            batchtitle: message::default_batch_title(),
        }
    }
}

fn enabled() -> bool {
    true
}

#[async_trait]
pub trait Trigger: Send + Sync {
    /// Provider type, e.g. `http`.
    fn provider(&self) -> &'static str;

    fn name(&self) -> &str;

    fn id(&self) -> String {
        format!("{}.{}", self.provider(), self.name())
    }

    fn common(&self) -> &TriggerCommon;

    /// Whether this trigger carries the install capability.
    fn install_enabled(&self) -> bool {
        false
    }

    fn mask_configuration(&self) -> serde_json::Value;

    async fn trigger(&self, container: &Container) -> Result<(), TriggerError>;

    async fn trigger_batch(&self, containers: &[Container]) -> Result<(), TriggerError>;

    /// Perform the update of one container.
    async fn install(&self, _container: &Container) -> Result<(), TriggerError> {
        Err(TriggerError::InstallUnsupported(self.id()))
    }

    fn render_simple_title(&self, container: &Container) -> String {
        message::render_simple(&self.common().simpletitle, container)
    }

    fn render_simple_body(&self, container: &Container) -> String {
        message::render_simple(&self.common().simplebody, container)
    }

    fn render_batch_title(&self, containers: &[Container]) -> String {
        message::render_batch(&self.common().batchtitle, containers)
    }

    fn render_batch_body(&self, containers: &[Container]) -> String {
        containers
            .iter()
            .map(|c| format!("- {}\n", self.render_simple_body(c)))
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// Tag updates must reach the threshold. Digest updates and diffs that cannot be
/// classified (or are prerelease-only) always pass; `major` admits everything.
pub fn is_threshold_reached(container: &Container, threshold: Threshold) -> bool {
    let kind = container.update_kind();
    if kind.kind != UpdateKindKind::Tag {
        return true;
    }
    match (threshold, kind.semver_diff) {
        (Threshold::All | Threshold::Major, _) => true,
        (_, None | Some(SemverDiff::Unknown | SemverDiff::Prerelease)) => true,
        (Threshold::Minor, Some(diff)) => diff != SemverDiff::Major,
        (Threshold::Patch, Some(diff)) => diff == SemverDiff::Patch,
    }
}

/// One entry of a `name[:threshold]` list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TriggerRef {
    pub id: String,
    pub threshold: Threshold,
}

/// Parse a comma-separated `name[:threshold]` list. Unknown thresholds mean `all`.
pub fn parse_trigger_list(list: &str) -> Vec<TriggerRef> {
    list.split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(|entry| {
            let mut parts = entry.splitn(2, ':').map(str::trim);
            let id = parts.next().unwrap_or_default().to_lowercase();
            let threshold = parts
                .next()
                .and_then(|t| Threshold::try_from(t.to_string()).ok())
                .unwrap_or_default();
            TriggerRef { id, threshold }
        })
        .collect()
}

/// Whether `list` names this trigger (by id or bare name) with a threshold the update reaches.
fn is_listed(trigger_id: &str, trigger_name: &str, container: &Container, list: &str) -> bool {
    parse_trigger_list(list)
        .into_iter()
        .find(|r| r.id == trigger_id || r.id == trigger_name)
        .is_some_and(|r| is_threshold_reached(container, r.threshold))
}

/// Container-level include/exclude lists admit this trigger.
pub fn must_trigger(trigger_id: &str, trigger_name: &str, container: &Container) -> bool {
    let included = container
        .trigger_include
        .as_deref()
        .is_none_or(|list| is_listed(trigger_id, trigger_name, container, list));
    let excluded = container
        .trigger_exclude
        .as_deref()
        .is_some_and(|list| is_listed(trigger_id, trigger_name, container, list));
    included && !excluded
}

/// Full firing rule for one report.
pub fn should_fire(trigger: &dyn Trigger, report: &ContainerReport) -> bool {
    let common = trigger.common();
    (report.changed || !common.once)
        && report.container.update_available()
        && is_threshold_reached(&report.container, common.threshold)
        && must_trigger(&trigger.id(), &trigger.name().to_lowercase(), &report.container)
}

/// Build a trigger from its `(type, name)` and configuration table.
pub fn build(
    provider: &str,
    name: &str,
    config: toml::Value,
    http: reqwest::Client,
    output: OutputHub,
) -> Result<Arc<dyn Trigger>, ComponentError> {
    let provider = provider.to_lowercase();
    let name = name.to_lowercase();
    let id = format!("{provider}.{name}");
    let built: Arc<dyn Trigger> = match provider.as_str() {
        "http" => {
            let config: http::HttpConfig = config
                .try_into()
                .map_err(|e| ComponentError::invalid("trigger", &id, e))?;
            Arc::new(Http::new(&name, config, http)?)
        }
        "ntfy" => {
            let config: ntfy::NtfyConfig = config
                .try_into()
                .map_err(|e| ComponentError::invalid("trigger", &id, e))?;
            Arc::new(Ntfy::new(&name, config, http)?)
        }
        "script" => {
            let config: script::ScriptConfig = config
                .try_into()
                .map_err(|e| ComponentError::invalid("trigger", &id, e))?;
            Arc::new(Script::new(&name, config, output)?)
        }
        "telegram" => {
            let config: telegram::TelegramConfig = config
                .try_into()
                .map_err(|e| ComponentError::invalid("trigger", &id, e))?;
            Arc::new(Telegram::new(&name, config, http)?)
        }
        _ => {
            return Err(ComponentError::UnknownProvider {
                kind: "trigger",
                provider,
                available: PROVIDERS,
            });
        }
    };
    Ok(built)
}

/// Install capability across all triggers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstallAvailability {
    Disabled,
    Enabled,
    /// More than one trigger has install on; installs are refused.
    Ambiguous,
}

impl Serialize for InstallAvailability {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            InstallAvailability::Disabled => serializer.serialize_bool(false),
            InstallAvailability::Enabled => serializer.serialize_bool(true),
            InstallAvailability::Ambiguous => serializer.serialize_str("multiple"),
        }
    }
}

#[derive(Clone, Default)]
pub struct Triggers {
    triggers: Vec<Arc<dyn Trigger>>,
}

impl Triggers {
    pub fn new(triggers: Vec<Arc<dyn Trigger>>) -> Self {
        Self { triggers }
    }

    /// A trigger that fails to register is logged and skipped.
    pub fn from_config(configured: &ComponentTables, http: reqwest::Client, output: OutputHub) -> Self {
        let mut triggers = Vec::new();
        for (provider, entries) in configured {
            tracing::info!(provider = %provider, "Register all components of kind trigger");
            for (name, config) in entries {
                match build(provider, name, config.clone(), http.clone(), output.clone()) {
                    Ok(trigger) => {
                        tracing::info!(
                            trigger = %trigger.id(),
                            auto = trigger.common().auto,
                            "Registered trigger"
                        );
                        triggers.push(trigger);
                    }
                    Err(e) => tracing::warn!(error = %e, "Some triggers failed to register"),
                }
            }
        }
        Self { triggers }
    }

    pub fn all(&self) -> &[Arc<dyn Trigger>] {
        &self.triggers
    }

    pub fn get(&self, id: &str) -> Option<Arc<dyn Trigger>> {
        self.triggers.iter().find(|t| t.id() == id).cloned()
    }

    pub fn install_availability(&self) -> InstallAvailability {
        match self.triggers.iter().filter(|t| t.install_enabled()).count() {
            0 => InstallAvailability::Disabled,
            1 => InstallAvailability::Enabled,
            _ => InstallAvailability::Ambiguous,
        }
    }

    /// The single trigger allowed to install.
    pub fn install_trigger(&self) -> Result<Arc<dyn Trigger>, InstallError> {
        let mut installers = self.triggers.iter().filter(|t| t.install_enabled());
        match (installers.next(), installers.next()) {
            (None, _) => Err(InstallError::NotEnabled),
            (Some(_), Some(_)) => Err(InstallError::Ambiguous),
            (Some(trigger), None) => Ok(trigger.clone()),
        }
    }
}

fn dispatch_report(triggers: &Triggers, report: &ContainerReport) {
    for trigger in triggers.all() {
        let common = trigger.common();
        if !common.auto || common.mode != Mode::Simple || !should_fire(trigger.as_ref(), report) {
            continue;
        }
        let trigger = trigger.clone();
        let container = report.container.clone();
        tokio::spawn(async move {
            tracing::debug!(trigger = %trigger.id(), container = %container.full_name(), "Run");
            if let Err(e) = trigger.trigger(&container).await {
                tracing::warn!(trigger = %trigger.id(), container = %container.full_name(), error = %e, "Trigger failed");
            }
        });
    }
}

fn dispatch_batch(triggers: &Triggers, reports: &[ContainerReport]) {
    for trigger in triggers.all() {
        let common = trigger.common();
        if !common.auto || common.mode != Mode::Batch {
            continue;
        }
        let containers: Vec<Container> = reports
            .iter()
            .filter(|r| should_fire(trigger.as_ref(), r))
            .map(|r| r.container.clone())
            .collect();
        if containers.is_empty() {
            continue;
        }
        let trigger = trigger.clone();
        tokio::spawn(async move {
            tracing::debug!(trigger = %trigger.id(), count = containers.len(), "Run batch");
            if let Err(e) = trigger.trigger_batch(&containers).await {
                tracing::warn!(trigger = %trigger.id(), error = %e, "Batch trigger failed");
            }
        });
    }
}

/// Spawns the dispatcher feeding reports to auto triggers. Subscribes before returning,
/// so reports emitted after this call are seen.
pub fn spawn(triggers: Triggers, bus: &EventBus, mut shutdown_rx: watch::Receiver<bool>) -> tokio::task::JoinHandle<()> {
    let mut report_rx = bus.subscribe_container_report();
    let mut batch_rx = bus.subscribe_container_reports();
    tokio::spawn(async move {
        loop {
            tokio::select! {
                report = report_rx.recv() => match report {
                    Ok(report) => dispatch_report(&triggers, &report),
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        tracing::warn!(skipped = n, "Trigger dispatcher lagged behind container reports");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
                reports = batch_rx.recv() => match reports {
                    Ok(reports) => dispatch_batch(&triggers, &reports),
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        tracing::warn!(skipped = n, "Trigger dispatcher lagged behind batch reports");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        break;
                    }
                }
            }
        }
        tracing::debug!("Trigger dispatcher shutting down");
    })
}
