// Ntfy trigger: publishes the rendered title and body to a ntfy topic

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{Trigger, TriggerCommon, TriggerError};
use crate::component::{ComponentError, mask};
use crate::models::Container;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct NtfyAuth {
    pub user: Option<String>,
    pub password: Option<String>,
    /// Access token; wins over user and password.
    pub token: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NtfyConfig {
    #[serde(default = "default_url")]
    pub url: String,
    pub topic: Option<String>,
    pub priority: Option<u8>,
    pub auth: Option<NtfyAuth>,
    #[serde(flatten)]
    pub common: TriggerCommon,
}

fn default_url() -> String {
    "https://ntfy.sh".into()
}

/// JSON publish body.
#[derive(Debug, Serialize)]
struct Message<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    topic: Option<&'a str>,
    title: String,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    priority: Option<u8>,
}

pub struct Ntfy {
    name: String,
    config: NtfyConfig,
    client: reqwest::Client,
}

impl Ntfy {
    pub fn new(name: &str, config: NtfyConfig, http: reqwest::Client) -> Result<Self, ComponentError> {
        let id = format!("ntfy.{name}");
        let url = reqwest::Url::parse(&config.url)
            .map_err(|e| ComponentError::invalid("trigger", &id, format!("\"url\" {e}")))?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(ComponentError::invalid(
                "trigger",
                id,
                "\"url\" must be an http or https uri",
            ));
        }
        if config.priority.is_some_and(|p| p > 5) {
            return Err(ComponentError::invalid(
                "trigger",
                id,
                "\"priority\" must be between 0 and 5",
            ));
        }
        Ok(Self {
            name: name.to_string(),
            config,
            client: http,
        })
    }

    async fn publish(&self, title: String, message: String) -> Result<(), TriggerError> {
        let body = Message {
            topic: self.config.topic.as_deref(),
            title,
            message,
            priority: self.config.priority,
        };
        let mut request = self.client.post(&self.config.url).json(&body);
        if let Some(auth) = &self.config.auth {
            if let Some(token) = &auth.token {
                request = request.bearer_auth(token);
            } else if let (Some(user), Some(password)) = (&auth.user, &auth.password) {
                request = request.basic_auth(user, Some(password));
            }
        }

        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(TriggerError::Status {
                url: self.config.url.clone(),
                status,
            });
        }
        tracing::debug!(trigger = %self.id(), topic = ?self.config.topic, "Ntfy message published");
        Ok(())
    }
}

#[async_trait]
impl Trigger for Ntfy {
    fn provider(&self) -> &'static str {
        "ntfy"
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn common(&self) -> &TriggerCommon {
        &self.config.common
    }

    fn mask_configuration(&self) -> Value {
        let auth = self.config.auth.as_ref().map(|a| {
            serde_json::json!({
                "user": a.user,
                "password": a.password.as_deref().map(mask),
                "token": a.token.as_deref().map(mask),
            })
        });
        serde_json::json!({
            "url": self.config.url,
            "topic": self.config.topic,
            "priority": self.config.priority,
            "auth": auth,
            "auto": self.config.common.auto,
            "threshold": self.config.common.threshold,
            "mode": self.config.common.mode,
            "once": self.config.common.once,
        })
    }

    async fn trigger(&self, container: &Container) -> Result<(), TriggerError> {
        self.publish(
            self.render_simple_title(container),
            self.render_simple_body(container),
        )
        .await
    }

    async fn trigger_batch(&self, containers: &[Container]) -> Result<(), TriggerError> {
        self.publish(
            self.render_batch_title(containers),
            self.render_batch_body(containers),
        )
        .await
    }
}
