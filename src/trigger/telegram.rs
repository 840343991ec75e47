// Telegram trigger: sends the rendered message through the Bot API

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{Trigger, TriggerCommon, TriggerError};
use crate::component::{ComponentError, mask};
use crate::models::Container;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String")]
pub enum MessageFormat {
    #[default]
    Markdown,
    Html,
}

impl TryFrom<String> for MessageFormat {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        match value.to_lowercase().as_str() {
            "markdown" => Ok(MessageFormat::Markdown),
            "html" => Ok(MessageFormat::Html),
            other => Err(format!("messageformat must be Markdown or HTML (got {other:?})")),
        }
    }
}

impl MessageFormat {
    fn parse_mode(self) -> &'static str {
        match self {
            MessageFormat::Markdown => "MarkdownV2",
            MessageFormat::Html => "HTML",
        }
    }

    fn escape(self, text: &str) -> String {
        match self {
            MessageFormat::Markdown => escape_markdown(text),
            MessageFormat::Html => escape_html(text),
        }
    }

    fn bold(self, text: &str) -> String {
        match self {
            MessageFormat::Markdown => format!("*{}*", escape_markdown(text)),
            MessageFormat::Html => format!("<b>{}</b>", escape_html(text)),
        }
    }
}

/// Characters MarkdownV2 reserves.
fn escape_markdown(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        if "\\_*`|!.[](){}>+#=~-".contains(c) {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

fn escape_html(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}

#[derive(Debug, Clone, Deserialize)]
pub struct TelegramConfig {
    pub bottoken: String,
    pub chatid: String,
    #[serde(default)]
    pub disabletitle: bool,
    #[serde(default)]
    pub messageformat: MessageFormat,
    /// Bot API root, for self-hosted Bot API servers.
    #[serde(default = "default_url")]
    pub url: String,
    #[serde(flatten)]
    pub common: TriggerCommon,
}

fn default_url() -> String {
    "https://api.telegram.org".into()
}

#[derive(Debug, Serialize)]
struct SendMessage<'a> {
    chat_id: &'a str,
    text: String,
    parse_mode: &'static str,
}

pub struct Telegram {
    name: String,
    config: TelegramConfig,
    client: reqwest::Client,
}

impl Telegram {
    pub fn new(name: &str, config: TelegramConfig, http: reqwest::Client) -> Result<Self, ComponentError> {
        let id = format!("telegram.{name}");
        if config.bottoken.trim().is_empty() {
            return Err(ComponentError::invalid("trigger", id, "\"bottoken\" is required"));
        }
        if config.chatid.trim().is_empty() {
            return Err(ComponentError::invalid("trigger", id, "\"chatid\" is required"));
        }
        reqwest::Url::parse(&config.url)
            .map_err(|e| ComponentError::invalid("trigger", &id, format!("\"url\" {e}")))?;
        Ok(Self {
            name: name.to_string(),
            config,
            client: http,
        })
    }

    /// Bold title, blank line, escaped body; just the body when titles are disabled.
    fn compose(&self, title: &str, body: &str) -> String {
        let format = self.config.messageformat;
        if self.config.disabletitle {
            format.escape(body)
        } else {
            format!("{}\n\n{}", format.bold(title), format.escape(body))
        }
    }

    async fn send_message(&self, text: String) -> Result<(), TriggerError> {
        let url = format!(
            "{}/bot{}/sendMessage",
            self.config.url.trim_end_matches('/'),
            self.config.bottoken
        );
        let body = SendMessage {
            chat_id: &self.config.chatid,
            text,
            parse_mode: self.config.messageformat.parse_mode(),
        };
        let response = self.client.post(&url).json(&body).send().await?;
        let status = response.status();
        if !status.is_success() {
            // the url embeds the bot token
            return Err(TriggerError::Status {
                url: format!("{}/bot{}/sendMessage", self.config.url, mask(&self.config.bottoken)),
                status,
            });
        }
        tracing::debug!(trigger = %self.id(), "Telegram message sent");
        Ok(())
    }
}

#[async_trait]
impl Trigger for Telegram {
    fn provider(&self) -> &'static str {
        "telegram"
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn common(&self) -> &TriggerCommon {
        &self.config.common
    }

    fn mask_configuration(&self) -> Value {
        serde_json::json!({
            "bottoken": mask(&self.config.bottoken),
            "chatid": mask(&self.config.chatid),
            "disabletitle": self.config.disabletitle,
            "messageformat": match self.config.messageformat {
                MessageFormat::Markdown => "Markdown",
                MessageFormat::Html => "HTML",
            },
            "auto": self.config.common.auto,
            "threshold": self.config.common.threshold,
            "mode": self.config.common.mode,
            "once": self.config.common.once,
        })
    }

    async fn trigger(&self, container: &Container) -> Result<(), TriggerError> {
        let text = self.compose(
            &self.render_simple_title(container),
            &self.render_simple_body(container),
        );
        self.send_message(text).await
    }

    async fn trigger_batch(&self, containers: &[Container]) -> Result<(), TriggerError> {
        let text = self.compose(
            &self.render_batch_title(containers),
            &self.render_batch_body(containers),
        );
        self.send_message(text).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn telegram(table: &str) -> Telegram {
        let config: TelegramConfig = toml::from_str(table).unwrap();
        Telegram::new("chat", config, reqwest::Client::new()).unwrap()
    }

    #[test]
    fn markdown_reserved_characters_are_escaped() {
        assert_eq!(escape_markdown("app 1.2.0 (x)"), "app 1\\.2\\.0 \\(x\\)");
        assert_eq!(escape_markdown("a_b*c"), "a\\_b\\*c");
    }

    #[test]
    fn markdown_message_has_bold_title() {
        let t = telegram("bottoken = \"123:abc\"\nchatid = \"42\"\n");
        assert_eq!(
            t.compose("New tag", "Update to 2.0.0"),
            "*New tag*\n\nUpdate to 2\\.0\\.0"
        );
    }

    #[test]
    fn html_format_and_disabled_title() {
        let t = telegram("bottoken = \"123:abc\"\nchatid = \"42\"\nmessageformat = \"html\"\n");
        assert_eq!(t.config.messageformat.parse_mode(), "HTML");
        assert_eq!(t.compose("a<b", "x & y"), "<b>a&lt;b</b>\n\nx &amp; y");

        let t = telegram("bottoken = \"123:abc\"\nchatid = \"42\"\ndisabletitle = true\n");
        assert_eq!(t.compose("ignored", "body."), "body\\.");
    }

    #[test]
    fn requires_token_and_chat() {
        let config: TelegramConfig = toml::from_str("bottoken = \"\"\nchatid = \"42\"\n").unwrap();
        assert!(Telegram::new("chat", config, reqwest::Client::new()).is_err());
        assert!(toml::from_str::<TelegramConfig>("chatid = \"42\"\n").is_err());
        assert!(toml::from_str::<TelegramConfig>("bottoken = \"1\"\nchatid = \"2\"\nmessageformat = \"rtf\"\n").is_err());
    }

    #[test]
    fn masks_token_and_chat() {
        let masked = telegram("bottoken = \"123:abc\"\nchatid = \"4242\"\n").mask_configuration();
        assert_eq!(masked["bottoken"], "1*****c");
        assert_eq!(masked["chatid"], "4**2");
        assert_eq!(masked["messageformat"], "Markdown");
    }
}
