// Script trigger: runs a local executable with the container's update details

use async_trait::async_trait;
use serde::Deserialize;
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::time::{Duration, timeout};

use super::output::{OutputHub, OutputSink, OutputStream};
use super::{Mode, Trigger, TriggerCommon, TriggerError};
use crate::component::ComponentError;
use crate::models::Container;

#[derive(Debug, Clone, Deserialize)]
pub struct ScriptConfig {
    pub path: String,
    #[serde(default)]
    pub install: bool,
    /// Milliseconds.
    #[serde(default = "default_timeout")]
    pub timeout: u64,
    #[serde(flatten)]
    pub common: TriggerCommon,
}

fn default_timeout() -> u64 {
    300_000
}

pub struct Script {
    name: String,
    config: ScriptConfig,
    output: OutputHub,
}

impl Script {
    pub fn new(name: &str, config: ScriptConfig, output: OutputHub) -> Result<Self, ComponentError> {
        let id = format!("script.{name}");
        if config.path.trim().is_empty() {
            return Err(ComponentError::invalid("trigger", id, "\"path\" is required"));
        }
        if config.common.mode == Mode::Batch {
            return Err(ComponentError::invalid(
                "trigger",
                id,
                "batch mode is not supported by script triggers",
            ));
        }
        if config.timeout == 0 {
            return Err(ComponentError::invalid("trigger", id, "\"timeout\" must be > 0"));
        }
        Ok(Self {
            name: name.to_string(),
            config,
            output,
        })
    }

    /// Positional arguments: name, image name, current value, target value, watcher,
    /// compose project.
    fn arguments(container: &Container) -> Vec<String> {
        let kind = container.update_kind();
        vec![
            container.name.clone(),
            container.image.name.clone(),
            kind.local_value.unwrap_or_else(|| "unknown".into()),
            kind.remote_value.unwrap_or_else(|| "unknown".into()),
            container.watcher.clone(),
            container.compose_project.clone().unwrap_or_default(),
        ]
    }

    async fn execute(&self, container: &Container, action: &str) -> Result<(), TriggerError> {
        let args = Self::arguments(container);
        tracing::info!(
            trigger = %self.id(),
            container = %container.full_name(),
            action,
            command = %format!("{} {}", self.config.path, args.join(" ")),
            "Executing script"
        );

        let sink = self.output.start(&container.id, &container.name);
        let result = self.run(&args, &sink).await;
        sink.finish(result.is_ok());
        if let Err(e) = &result {
            tracing::warn!(trigger = %self.id(), container = %container.full_name(), error = %e, "Script execution failed");
        }
        result
    }

    async fn run(&self, args: &[String], sink: &OutputSink) -> Result<(), TriggerError> {
        let mut child = Command::new(&self.config.path)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();

        let completed = timeout(Duration::from_millis(self.config.timeout), async {
            tokio::join!(
                pump(stdout, OutputStream::Stdout, sink),
                pump(stderr, OutputStream::Stderr, sink)
            );
            child.wait().await
        })
        .await;

        let status = match completed {
            Ok(status) => status?,
            Err(_) => {
                if let Err(e) = child.kill().await {
                    tracing::debug!(error = %e, "Unable to kill timed out script");
                }
                return Err(TriggerError::ScriptTimeout(self.config.timeout));
            }
        };
        match status.code() {
            Some(0) => Ok(()),
            Some(code) => Err(TriggerError::ScriptExit(code)),
            None => Err(TriggerError::ScriptSignal),
        }
    }
}

/// Forward each line of one output stream to the sink.
async fn pump<R: AsyncRead + Unpin>(reader: Option<R>, stream: OutputStream, sink: &OutputSink) {
    let Some(reader) = reader else {
        return;
    };
    let mut lines = BufReader::new(reader).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                tracing::debug!(stream = ?stream, line = %line, "Script output");
                sink.line(stream, line);
            }
            Ok(None) => break,
            Err(e) => {
                tracing::debug!(error = %e, "Script output unreadable");
                break;
            }
        }
    }
}

#[async_trait]
impl Trigger for Script {
    fn provider(&self) -> &'static str {
        "script"
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn common(&self) -> &TriggerCommon {
        &self.config.common
    }

    fn install_enabled(&self) -> bool {
        self.config.install
    }

    fn mask_configuration(&self) -> serde_json::Value {
        serde_json::json!({
            "path": self.config.path,
            "install": self.config.install,
            "timeout": self.config.timeout,
            "auto": self.config.common.auto,
            "threshold": self.config.common.threshold,
            "mode": self.config.common.mode,
            "once": self.config.common.once,
        })
    }

    async fn trigger(&self, container: &Container) -> Result<(), TriggerError> {
        if self.config.install {
            tracing::debug!(trigger = %self.id(), "Skipping trigger action because install is enabled");
            return Ok(());
        }
        self.execute(container, "trigger").await
    }

    async fn trigger_batch(&self, _containers: &[Container]) -> Result<(), TriggerError> {
        Err(TriggerError::BatchUnsupported(self.id()))
    }

    async fn install(&self, container: &Container) -> Result<(), TriggerError> {
        if !self.config.install {
            return Err(TriggerError::InstallUnsupported(self.id()));
        }
        self.execute(container, "install").await
    }
}
