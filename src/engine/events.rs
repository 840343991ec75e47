// Engine event stream: newline-delimited JSON split across arbitrary chunks

use bytes::BytesMut;
use serde::Deserialize;
use std::collections::HashMap;
use tokio_util::codec::Decoder;

use super::EngineError;

/// Container lifecycle actions the watchers subscribe to.
pub const WATCHED_ACTIONS: &[&str] = &[
    "create", "destroy", "start", "stop", "pause", "unpause", "die", "update",
];

#[derive(Debug, Clone, Default, Deserialize)]
pub struct EventActor {
    #[serde(rename = "ID", default)]
    pub id: Option<String>,
    #[serde(rename = "Attributes", default)]
    pub attributes: HashMap<String, String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EngineEvent {
    #[serde(rename = "Action")]
    pub action: String,
    #[serde(default)]
    pub id: Option<String>,
    #[serde(rename = "Actor", default)]
    pub actor: EventActor,
}

impl EngineEvent {
    pub fn container_id(&self) -> Option<&str> {
        self.id.as_deref().or(self.actor.id.as_deref())
    }

    /// Create and destroy change the container set; everything else only its status.
    pub fn changes_container_set(&self) -> bool {
        matches!(self.action.as_str(), "create" | "destroy")
    }
}

/// Splits on `\n` and parses each complete line. Incomplete data stays buffered;
/// lines that fail to parse are logged and skipped.
#[derive(Debug, Default)]
pub struct EngineEventCodec {
    skipped: u64,
}

impl EngineEventCodec {
    pub fn skipped(&self) -> u64 {
        self.skipped
    }

    fn parse_line(&mut self, line: &[u8]) -> Option<EngineEvent> {
        let text = String::from_utf8_lossy(line);
        let text = text.trim();
        if text.is_empty() {
            return None;
        }
        match serde_json::from_str::<EngineEvent>(text) {
            Ok(event) => Some(event),
            Err(e) => {
                self.skipped += 1;
                tracing::warn!(error = %e, line = %text, "Skipping invalid engine event");
                None
            }
        }
    }
}

impl Decoder for EngineEventCodec {
    type Item = EngineEvent;
    type Error = EngineError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        while let Some(newline) = src.iter().position(|b| *b == b'\n') {
            let line = src.split_to(newline + 1);
            if let Some(event) = self.parse_line(&line[..newline]) {
                return Ok(Some(event));
            }
        }
        Ok(None)
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if let Some(event) = self.decode(src)? {
            return Ok(Some(event));
        }
        if src.is_empty() {
            return Ok(None);
        }
        let rest = src.split_to(src.len());
        Ok(self.parse_line(&rest))
    }
}
