// HTTP trigger: sends container details to a webhook (GET query or POST JSON body)

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::{Trigger, TriggerCommon, TriggerError};
use crate::component::{ComponentError, mask};
use crate::models::Container;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HttpMethod {
    Get,
    #[default]
    Post,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum AuthKind {
    #[default]
    Basic,
    Bearer,
}

#[derive(Debug, Clone, Deserialize)]
pub struct HttpAuth {
    #[serde(rename = "type", default)]
    pub kind: AuthKind,
    pub user: Option<String>,
    pub password: Option<String>,
    pub bearer: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct HttpConfig {
    pub url: String,
    #[serde(default)]
    pub method: HttpMethod,
    pub auth: Option<HttpAuth>,
    pub proxy: Option<String>,
    #[serde(default)]
    pub install: bool,
    #[serde(flatten)]
    pub common: TriggerCommon,
}

pub struct Http {
    name: String,
    config: HttpConfig,
    client: reqwest::Client,
}

impl Http {
    pub fn new(name: &str, config: HttpConfig, http: reqwest::Client) -> Result<Self, ComponentError> {
        let id = format!("http.{name}");
        let url = reqwest::Url::parse(&config.url)
            .map_err(|e| ComponentError::invalid("trigger", &id, format!("\"url\" {e}")))?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(ComponentError::invalid(
                "trigger",
                id,
                "\"url\" must be an http or https uri",
            ));
        }
        let client = match &config.proxy {
            Some(proxy) => {
                let proxy = reqwest::Proxy::all(proxy)
                    .map_err(|e| ComponentError::invalid("trigger", &id, format!("\"proxy\" {e}")))?;
                reqwest::Client::builder()
                    .proxy(proxy)
                    .build()
                    .map_err(|e| ComponentError::invalid("trigger", &id, e))?
            }
            None => http,
        };
        Ok(Self {
            name: name.to_string(),
            config,
            client,
        })
    }

    /// `body` is a JSON object; `actionType` is added to it.
    async fn send(&self, body: Map<String, Value>, action: &str) -> Result<(), TriggerError> {
        let mut request = match self.config.method {
            HttpMethod::Post => {
                let mut body = body;
                body.insert("actionType".into(), Value::String(action.into()));
                self.client.post(&self.config.url).json(&body)
            }
            HttpMethod::Get => {
                let mut query: Vec<(String, String)> = body
                    .into_iter()
                    .map(|(k, v)| {
                        let v = match v {
                            Value::String(s) => s,
                            other => other.to_string(),
                        };
                        (k, v)
                    })
                    .collect();
                query.push(("actionType".into(), action.into()));
                self.client.get(&self.config.url).query(&query)
            }
        };
        if let Some(auth) = &self.config.auth {
            request = match auth.kind {
                AuthKind::Basic => request.basic_auth(
                    auth.user.clone().unwrap_or_default(),
                    auth.password.clone(),
                ),
                AuthKind::Bearer => request.bearer_auth(auth.bearer.clone().unwrap_or_default()),
            };
        }

        tracing::info!(trigger = %self.id(), action, url = %self.config.url, "Sending HTTP request");
        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            tracing::warn!(trigger = %self.id(), action, status = %status, "HTTP request failed");
            return Err(TriggerError::Status {
                url: self.config.url.clone(),
                status,
            });
        }
        tracing::debug!(trigger = %self.id(), action, "HTTP request successful");
        Ok(())
    }

    fn single_body(&self, container: &Container) -> Map<String, Value> {
        match self.config.method {
            HttpMethod::Post => match container.to_document() {
                Value::Object(map) => map,
                _ => Map::new(),
            },
            HttpMethod::Get => container.flatten().into_iter().collect(),
        }
    }

    /// Containers keyed by their position in the batch.
    fn batch_body(&self, containers: &[Container]) -> Map<String, Value> {
        let mut body = Map::new();
        for (i, container) in containers.iter().enumerate() {
            match self.config.method {
                HttpMethod::Post => {
                    body.insert(i.to_string(), container.to_document());
                }
                HttpMethod::Get => {
                    for (k, v) in container.flatten() {
                        body.insert(format!("{i}_{k}"), v);
                    }
                }
            }
        }
        body
    }
}

#[async_trait]
impl Trigger for Http {
    fn provider(&self) -> &'static str {
        "http"
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

    fn mask_configuration(&self) -> Value {
        let auth = self.config.auth.as_ref().map(|a| {
            serde_json::json!({
                "type": a.kind,
                "user": a.user,
                "password": a.password.as_deref().map(mask),
                "bearer": a.bearer.as_deref().map(mask),
            })
        });
        serde_json::json!({
            "url": self.config.url,
            "method": self.config.method,
            "auth": auth,
            "proxy": self.config.proxy,
            "install": self.config.install,
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
        self.send(self.single_body(container), "trigger").await
    }

    async fn trigger_batch(&self, containers: &[Container]) -> Result<(), TriggerError> {
        if self.config.install {
            tracing::debug!(trigger = %self.id(), "Skipping batch trigger action because install is enabled");
            return Ok(());
        }
        self.send(self.batch_body(containers), "triggerBatch").await
    }

    async fn install(&self, container: &Container) -> Result<(), TriggerError> {
        if !self.config.install {
            return Err(TriggerError::InstallUnsupported(self.id()));
        }
        self.send(self.single_body(container), "install").await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(table: &str) -> HttpConfig {
        toml::from_str(table).unwrap()
    }

    #[test]
    fn defaults_and_common_options_are_read() {
        let c = config("url = \"https://hooks.example.com/x\"\nthreshold = \"Minor\"\nonce = false\n");
        assert_eq!(c.method, HttpMethod::Post);
        assert!(!c.install);
        assert_eq!(c.common.threshold, super::super::Threshold::Minor);
        assert!(!c.common.once);
        assert!(c.common.auto);
    }

    #[test]
    fn rejects_non_http_url() {
        let c = config("url = \"ftp://example.com\"\n");
        assert!(Http::new("hook", c, reqwest::Client::new()).is_err());
    }

    #[test]
    fn masks_secrets() {
        let c = config(
            "url = \"https://hooks.example.com\"\n[auth]\ntype = \"BEARER\"\nbearer = \"abcdef\"\n",
        );
        let http = Http::new("hook", c, reqwest::Client::new()).unwrap();
        let masked = http.mask_configuration();
        assert_eq!(masked["auth"]["bearer"], "a****f");
        assert_eq!(masked["auth"]["type"], "BEARER");
    }
}
