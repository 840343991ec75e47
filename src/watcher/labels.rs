// Container labels driving watch policy

pub const WATCH: &str = "tagwatch.watch";
pub const WATCH_DIGEST: &str = "tagwatch.watch.digest";
pub const TAG_INCLUDE: &str = "tagwatch.tag.include";
pub const TAG_EXCLUDE: &str = "tagwatch.tag.exclude";
pub const TAG_TRANSFORM: &str = "tagwatch.tag.transform";
pub const LINK_TEMPLATE: &str = "tagwatch.link.template";
pub const DISPLAY_NAME: &str = "tagwatch.display.name";
pub const DISPLAY_ICON: &str = "tagwatch.display.icon";
pub const TRIGGER_INCLUDE: &str = "tagwatch.trigger.include";
pub const TRIGGER_EXCLUDE: &str = "tagwatch.trigger.exclude";
pub const COMPOSE_PROJECT: &str = "com.docker.compose.project";

fn flag(value: Option<&String>) -> Option<bool> {
    value
        .filter(|v| !v.is_empty())
        .map(|v| v.eq_ignore_ascii_case("true"))
}

/// An explicit label wins over the watcher default.
pub fn is_container_to_watch(label: Option<&String>, watch_by_default: bool) -> bool {
    flag(label).unwrap_or(watch_by_default)
}

/// Semver images watch digests only on opt-in; other images unless opted out.
pub fn is_digest_to_watch(label: Option<&String>, is_semver: bool) -> bool {
    flag(label).unwrap_or(!is_semver)
}
