// Container model tests: document shape, validation, update state

mod common;

use serde_json::json;
use tagwatch::models::*;

#[test]
fn test_document_is_camel_case_with_computed_fields() {
    let mut c = common::container("c1", "app", "1.2.0");
    c.result = Some(UpdateResult {
        tag: Some("2.0.0".into()),
        ..Default::default()
    });
    let doc = c.to_document();
    assert_eq!(doc["displayName"], "app");
    assert_eq!(doc["displayIcon"], DEFAULT_DISPLAY_ICON);
    assert_eq!(doc["image"]["registry"]["name"], "fake.test");
    assert_eq!(doc["updateAvailable"], true);
    assert_eq!(
        doc["updateKind"],
        json!({
            "kind": "tag",
            "localValue": "1.2.0",
            "remoteValue": "2.0.0",
            "semverDiff": "major",
        })
    );
    assert!(doc.get("error").is_none());
}

#[test]
fn test_from_value_ignores_computed_keys() {
    let mut c = common::container("c1", "app", "1.2.0");
    c.result = Some(UpdateResult {
        tag: Some("1.3.0".into()),
        ..Default::default()
    });
    let back = Container::from_value(c.to_document()).unwrap();
    assert_eq!(back, c);
}

#[test]
fn test_from_value_rejects_missing_required_fields() {
    let mut doc = common::container("c1", "app", "1.2.0").to_document();
    doc["image"]["tag"]["value"] = json!("");
    let err = Container::from_value(doc).unwrap_err();
    assert!(matches!(err, ValidationError::Empty { field: "image.tag.value" }));

    let mut doc = common::container("c1", "app", "1.2.0").to_document();
    doc.as_object_mut().unwrap().remove("watcher");
    assert!(matches!(
        Container::from_value(doc),
        Err(ValidationError::Malformed(_))
    ));
}

#[test]
fn test_no_result_means_no_update() {
    let c = common::container("c1", "app", "1.2.0");
    assert!(!c.update_available());
    assert_eq!(c.update_kind(), UpdateKind::unknown());
}

#[test]
fn test_same_tag_is_not_an_update() {
    let mut c = common::container("c1", "app", "1.2.0");
    c.result = Some(UpdateResult {
        tag: Some("1.2.0".into()),
        ..Default::default()
    });
    assert!(!c.update_available());
}

#[test]
fn test_semver_diff_collapses_pre_kinds() {
    let mut c = common::container("c1", "app", "1.2.0");
    c.result = Some(UpdateResult {
        tag: Some("1.3.0-rc.1".into()),
        ..Default::default()
    });
    assert_eq!(c.update_kind().semver_diff, Some(SemverDiff::Minor));

    c.result = Some(UpdateResult {
        tag: Some("1.2.1".into()),
        ..Default::default()
    });
    assert_eq!(c.update_kind().semver_diff, Some(SemverDiff::Patch));
}

#[test]
fn test_non_semver_tag_change_has_unknown_diff() {
    let mut c = common::container("c1", "app", "stable");
    c.result = Some(UpdateResult {
        tag: Some("edge".into()),
        ..Default::default()
    });
    let kind = c.update_kind();
    assert_eq!(kind.kind, UpdateKindKind::Tag);
    assert_eq!(kind.semver_diff, Some(SemverDiff::Unknown));
}

#[test]
fn test_watched_digest_change_is_a_digest_update() {
    let mut c = common::container("c1", "app", "latest");
    c.image.digest = ImageDigest {
        watch: true,
        value: Some("sha256:aaa".into()),
        repo: Some("sha256:aaa".into()),
    };
    c.result = Some(UpdateResult {
        tag: Some("latest".into()),
        digest: Some("sha256:bbb".into()),
        created: None,
    });
    assert!(c.update_available());
    let kind = c.update_kind();
    assert_eq!(kind.kind, UpdateKindKind::Digest);
    assert_eq!(kind.local_value.as_deref(), Some("sha256:aaa"));
    assert_eq!(kind.remote_value.as_deref(), Some("sha256:bbb"));
    assert_eq!(kind.semver_diff, None);

    c.result = Some(UpdateResult {
        tag: Some("latest".into()),
        digest: Some("sha256:aaa".into()),
        created: None,
    });
    assert!(!c.update_available());
}

#[test]
fn test_transform_applies_before_comparison() {
    let mut c = common::container("c1", "app", "1.2.0-alpine");
    c.transform_tags = Some(r"^(\d+\.\d+\.\d+)-alpine$ => $1".into());
    c.result = Some(UpdateResult {
        tag: Some("1.2.0-alpine".into()),
        ..Default::default()
    });
    assert!(!c.update_available());

    c.result = Some(UpdateResult {
        tag: Some("2.0.0-alpine".into()),
        ..Default::default()
    });
    let kind = c.update_kind();
    assert_eq!(kind.semver_diff, Some(SemverDiff::Major));
    assert_eq!(kind.remote_value.as_deref(), Some("2.0.0-alpine"));
}

#[test]
fn test_result_changed_compares_tag_digest_and_created() {
    let mut previous = common::container("c1", "app", "1.2.0");
    previous.result = Some(UpdateResult {
        tag: Some("1.3.0".into()),
        ..Default::default()
    });
    let mut current = previous.clone();
    assert!(current.result_changed(None));
    assert!(!current.result_changed(Some(&previous)));

    current.result = Some(UpdateResult {
        tag: Some("1.3.0".into()),
        digest: Some("sha256:new".into()),
        created: None,
    });
    assert!(current.result_changed(Some(&previous)));
}

#[test]
fn test_flatten_produces_snake_case_paths() {
    let mut c = common::container("c1", "app", "1.2.0");
    c.labels.insert("com.example.team".into(), "ops".into());
    c.result = Some(UpdateResult {
        tag: Some("1.3.0".into()),
        ..Default::default()
    });
    let flat = c.flatten();
    assert_eq!(flat["image_registry_name"], "fake.test");
    assert_eq!(flat["update_available"], true);
    assert_eq!(flat["update_kind_semver_diff"], "minor");
    assert_eq!(flat["display_name"], "app");
    assert_eq!(flat["labels_com_example_team"], "ops");
}

#[test]
fn test_notification_level_serializes_lowercase() {
    let n = Notification::new(NotificationLevel::Success, "done");
    let value = serde_json::to_value(&n).unwrap();
    assert_eq!(value["level"], "success");
    assert_eq!(value["message"], "done");
}
