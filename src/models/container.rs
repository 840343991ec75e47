// Container record: stored fields, validation and computed update state

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

use crate::tag;
use crate::template;

pub const DEFAULT_DISPLAY_ICON: &str = "mdi:docker";
pub const DEFAULT_STATUS: &str = "unknown";

#[derive(Debug, thiserror::Error)]
pub enum ValidationError {
    #[error("malformed container document: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("\"{field}\" must not be empty")]
    Empty { field: &'static str },
    #[error("\"{field}\" must be an ISO 8601 date, got {value:?}")]
    InvalidDate { field: &'static str, value: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Container {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub display_name: String,
    #[serde(default)]
    pub display_icon: String,
    #[serde(default)]
    pub status: String,
    pub watcher: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub include_tags: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exclude_tags: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transform_tags: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub link_template: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trigger_include: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trigger_exclude: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compose_project: Option<String>,
    pub image: Image,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<UpdateResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ContainerError>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notification: Option<Notification>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Image {
    pub id: String,
    pub registry: ImageRegistry,
    pub name: String,
    pub tag: ImageTag,
    pub digest: ImageDigest,
    pub architecture: String,
    pub os: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub variant: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageRegistry {
    pub name: String,
    pub url: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageTag {
    pub value: String,
    #[serde(default)]
    pub semver: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ImageDigest {
    #[serde(default)]
    pub watch: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repo: Option<String>,
}

/// Latest known remote state for the image.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UpdateResult {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tag: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub digest: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContainerError {
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NotificationLevel {
    Info,
    Success,
    Warning,
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    pub message: String,
    pub level: NotificationLevel,
    #[serde(default = "Utc::now")]
    pub at: DateTime<Utc>,
}

impl Notification {
    pub fn new(level: NotificationLevel, message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            level,
            at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UpdateKindKind {
    Tag,
    Digest,
    Unknown,
}

/// Semver magnitude with pre-kinds collapsed into their base kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SemverDiff {
    Major,
    Minor,
    Patch,
    Prerelease,
    Unknown,
}

impl SemverDiff {
    pub fn as_str(&self) -> &'static str {
        match self {
            SemverDiff::Major => "major",
            SemverDiff::Minor => "minor",
            SemverDiff::Patch => "patch",
            SemverDiff::Prerelease => "prerelease",
            SemverDiff::Unknown => "unknown",
        }
    }
}

impl From<Option<tag::VersionDiff>> for SemverDiff {
    fn from(diff: Option<tag::VersionDiff>) -> Self {
        use tag::VersionDiff::*;
        match diff {
            Some(Major | Premajor) => SemverDiff::Major,
            Some(Minor | Preminor) => SemverDiff::Minor,
            Some(Patch | Prepatch) => SemverDiff::Patch,
            Some(Prerelease) => SemverDiff::Prerelease,
            None => SemverDiff::Unknown,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateKind {
    pub kind: UpdateKindKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub local_value: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote_value: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub semver_diff: Option<SemverDiff>,
}

impl UpdateKind {
    pub fn unknown() -> Self {
        Self {
            kind: UpdateKindKind::Unknown,
            local_value: None,
            remote_value: None,
            semver_diff: None,
        }
    }
}

fn require(field: &'static str, value: &str) -> Result<(), ValidationError> {
    if value.is_empty() {
        return Err(ValidationError::Empty { field });
    }
    Ok(())
}

fn require_date(field: &'static str, value: Option<&str>) -> Result<(), ValidationError> {
    match value {
        Some(v) if DateTime::parse_from_rfc3339(v).is_err() => Err(ValidationError::InvalidDate {
            field,
            value: v.to_string(),
        }),
        _ => Ok(()),
    }
}

fn same_instant(a: &str, b: &str) -> bool {
    match (
        DateTime::parse_from_rfc3339(a),
        DateTime::parse_from_rfc3339(b),
    ) {
        (Ok(a), Ok(b)) => a == b,
        _ => a == b,
    }
}

impl Container {
    /// Parse and validate a JSON document (computed keys are ignored).
    pub fn from_value(value: Value) -> Result<Self, ValidationError> {
        let container: Container = serde_json::from_value(value)?;
        container.validate()
    }

    /// Apply defaults and check required fields. Malformed input is rejected, never coerced.
    pub fn validate(mut self) -> Result<Self, ValidationError> {
        require("id", &self.id)?;
        require("name", &self.name)?;
        require("watcher", &self.watcher)?;
        require("image.id", &self.image.id)?;
        require("image.registry.name", &self.image.registry.name)?;
        require("image.registry.url", &self.image.registry.url)?;
        require("image.name", &self.image.name)?;
        require("image.tag.value", &self.image.tag.value)?;
        require("image.architecture", &self.image.architecture)?;
        require("image.os", &self.image.os)?;
        require_date("image.created", self.image.created.as_deref())?;
        if let Some(result) = &self.result {
            if let Some(tag) = &result.tag {
                require("result.tag", tag)?;
            }
            require_date("result.created", result.created.as_deref())?;
        }
        if let Some(error) = &self.error {
            require("error.message", &error.message)?;
        }

        if self.display_name.is_empty() {
            self.display_name = self.name.clone();
        }
        if self.display_icon.is_empty() {
            self.display_icon = DEFAULT_DISPLAY_ICON.to_string();
        }
        if self.status.is_empty() {
            self.status = DEFAULT_STATUS.to_string();
        }
        Ok(self)
    }

    /// Business id used in logs: `<watcher>_<name>`.
    pub fn full_name(&self) -> String {
        format!("{}_{}", self.watcher, self.name)
    }

    pub fn is_running(&self) -> bool {
        self.status == "running"
    }

    /// Digest comparison wins when watched and known on both sides; otherwise tags
    /// (after transform) are compared, with the created date as a fallback.
    pub fn update_available(&self) -> bool {
        let Some(result) = &self.result else {
            return false;
        };
        if self.image.digest.watch
            && let (Some(local), Some(remote)) = (&self.image.digest.value, &result.digest)
        {
            return local != remote;
        }

        let formula = self.transform_tags.as_deref();
        let local = tag::transform(formula, &self.image.tag.value);
        let remote = result.tag.as_deref().map(|t| tag::transform(formula, t));
        let mut available = remote.as_deref() != Some(local.as_str());

        if let (Some(local_created), Some(remote_created)) =
            (&self.image.created, &result.created)
        {
            available = available || !same_instant(local_created, remote_created);
        }
        available
    }

    pub fn update_kind(&self) -> UpdateKind {
        let Some(result) = &self.result else {
            return UpdateKind::unknown();
        };
        if !self.update_available() {
            return UpdateKind::unknown();
        }

        if result.tag.as_deref() != Some(self.image.tag.value.as_str()) {
            let semver_diff = if self.image.tag.semver {
                let formula = self.transform_tags.as_deref();
                let local = tag::transform(formula, &self.image.tag.value);
                let remote = result
                    .tag
                    .as_deref()
                    .map(|t| tag::transform(formula, t))
                    .unwrap_or_default();
                SemverDiff::from(tag::diff(&local, &remote))
            } else {
                SemverDiff::Unknown
            };
            return UpdateKind {
                kind: UpdateKindKind::Tag,
                local_value: Some(self.image.tag.value.clone()),
                remote_value: result.tag.clone(),
                semver_diff: Some(semver_diff),
            };
        }
        if self.image.digest.value != result.digest {
            return UpdateKind {
                kind: UpdateKindKind::Digest,
                local_value: self.image.digest.value.clone(),
                remote_value: result.digest.clone(),
                semver_diff: None,
            };
        }
        UpdateKind::unknown()
    }

    /// True when `previous` is absent or its result differs in tag, digest or created date.
    pub fn result_changed(&self, previous: Option<&Container>) -> bool {
        let Some(previous) = previous else {
            return true;
        };
        let mine = self.result.clone().unwrap_or_default();
        let theirs = previous.result.clone().unwrap_or_default();
        mine.tag != theirs.tag || mine.digest != theirs.digest || mine.created != theirs.created
    }

    /// Link rendered for the running tag.
    pub fn link(&self) -> Option<String> {
        self.render_link(&self.image.tag.value)
    }

    /// Link rendered for the remote tag.
    pub fn result_link(&self) -> Option<String> {
        let tag = self.result.as_ref()?.tag.as_deref()?;
        self.render_link(tag)
    }

    fn render_link(&self, original: &str) -> Option<String> {
        let link_template = self.link_template.as_deref()?;
        let transformed = tag::transform(self.transform_tags.as_deref(), original);
        let version = if self.image.tag.semver {
            tag::parse(&transformed)
        } else {
            None
        };
        let rendered = template::render(link_template, |key| match key {
            "original" | "raw" => Some(original.to_string()),
            "transformed" => Some(transformed.clone()),
            "major" => Some(version.as_ref().map(|v| v.major.to_string()).unwrap_or_default()),
            "minor" => Some(version.as_ref().map(|v| v.minor.to_string()).unwrap_or_default()),
            "patch" => Some(version.as_ref().map(|v| v.patch.to_string()).unwrap_or_default()),
            "prerelease" => Some(
                version
                    .as_ref()
                    .and_then(|v| v.pre.as_str().split('.').next().map(str::to_string))
                    .unwrap_or_default(),
            ),
            _ => None,
        });
        Some(rendered)
    }

    /// JSON document including computed fields (`updateAvailable`, `updateKind`, links).
    pub fn to_document(&self) -> Value {
        let mut doc = match serde_json::to_value(self) {
            Ok(Value::Object(map)) => map,
            _ => Map::new(),
        };
        doc.insert(
            "updateAvailable".into(),
            Value::Bool(self.update_available()),
        );
        doc.insert(
            "updateKind".into(),
            serde_json::to_value(self.update_kind()).unwrap_or(Value::Null),
        );
        if let Some(link) = self.link() {
            doc.insert("link".into(), Value::String(link));
        }
        if let Some(link) = self.result_link()
            && let Some(Value::Object(result)) = doc.get_mut("result")
        {
            result.insert("link".into(), Value::String(link));
        }
        Value::Object(doc)
    }

    /// Flat `_`-joined snake_case view of the document, for k/v integrations.
    pub fn flatten(&self) -> BTreeMap<String, Value> {
        let mut out = BTreeMap::new();
        flatten_into(&mut out, None, &self.to_document());
        out
    }
}

fn flatten_into(out: &mut BTreeMap<String, Value>, prefix: Option<&str>, value: &Value) {
    match value {
        Value::Object(map) if !map.is_empty() => {
            for (key, child) in map {
                let key = snake_case(key);
                let path = match prefix {
                    Some(p) => format!("{p}_{key}"),
                    None => key,
                };
                flatten_into(out, Some(&path), child);
            }
        }
        Value::Array(items) if !items.is_empty() => {
            for (i, child) in items.iter().enumerate() {
                let path = match prefix {
                    Some(p) => format!("{p}_{i}"),
                    None => i.to_string(),
                };
                flatten_into(out, Some(&path), child);
            }
        }
        _ => {
            if let Some(p) = prefix {
                out.insert(p.to_string(), value.clone());
            }
        }
    }
}

fn snake_case(key: &str) -> String {
    let mut out = String::with_capacity(key.len() + 4);
    let mut prev_lower = false;
    for c in key.chars() {
        if c.is_ascii_uppercase() {
            if prev_lower {
                out.push('_');
            }
            out.push(c.to_ascii_lowercase());
            prev_lower = false;
        } else if c.is_ascii_alphanumeric() {
            out.push(c);
            prev_lower = true;
        } else {
            if !out.ends_with('_') && !out.is_empty() {
                out.push('_');
            }
            prev_lower = false;
        }
    }
    out.trim_end_matches('_').to_string()
}
