// Title and body templates with a fixed placeholder set

use crate::models::Container;
use crate::template;

pub(super) fn default_simple_title() -> String {
    "New ${kind} found for container ${name}".into()
}

pub(super) fn default_simple_body() -> String {
    "Container ${name} running with ${kind} ${local} can be updated to ${kind} ${remote}\n${link}"
        .into()
}

pub(super) fn default_batch_title() -> String {
    "${count} updates available".into()
}

/// Placeholders: `id`, `name`, `displayName`, `watcher`, `kind`, `semver`, `local`,
/// `remote`, `link`. Missing values render empty; trailing whitespace is trimmed.
pub(super) fn render_simple(template: &str, container: &Container) -> String {
    let kind = container.update_kind();
    let link = container.result_link();
    let rendered = template::render(template, |key| match key {
        "id" => Some(container.id.clone()),
        "name" => Some(container.name.clone()),
        "displayName" => Some(container.display_name.clone()),
        "watcher" => Some(container.watcher.clone()),
        "kind" => Some(
            serde_json::to_value(kind.kind)
                .ok()
                .and_then(|v| v.as_str().map(str::to_string))
                .unwrap_or_default(),
        ),
        "semver" => Some(
            kind.semver_diff
                .map(|d| d.as_str().to_string())
                .unwrap_or_default(),
        ),
        "local" => Some(kind.local_value.clone().unwrap_or_default()),
        "remote" => Some(kind.remote_value.clone().unwrap_or_default()),
        "link" => Some(link.clone().unwrap_or_default()),
        _ => None,
    });
    rendered.trim_end().to_string()
}

/// Placeholder: `count`.
pub(super) fn render_batch(template: &str, containers: &[Container]) -> String {
    template::render(template, |key| match key {
        "count" => Some(containers.len().to_string()),
        _ => None,
    })
}
