// Integration tests: HTTP and WebSocket endpoints

mod common;

use async_trait::async_trait;
use axum::http::StatusCode;
use axum_test::TestServer;
use common::FakeEngine;
use std::collections::HashMap;
use std::sync::Arc;
use tagwatch::config::AppConfig;
use tagwatch::engine::ContainerEngine;
use tagwatch::models::{Container, UpdateResult};
use tagwatch::routes::{self, AppDeps};
use tagwatch::store::ContainerStore;
use tagwatch::trigger::{
    Installer, OutputHub, OutputStream, Trigger, TriggerCommon, TriggerError, Triggers,
};
use tokio::time::Duration;

struct Installable {
    common: TriggerCommon,
}

#[async_trait]
impl Trigger for Installable {
    fn provider(&self) -> &'static str {
        "noop"
    }

    fn name(&self) -> &str {
        "install"
    }

    fn common(&self) -> &TriggerCommon {
        &self.common
    }

    fn install_enabled(&self) -> bool {
        true
    }

    fn mask_configuration(&self) -> serde_json::Value {
        serde_json::json!({ "token": "s*****t" })
    }

    async fn trigger(&self, _container: &Container) -> Result<(), TriggerError> {
        Ok(())
    }

    async fn trigger_batch(&self, _containers: &[Container]) -> Result<(), TriggerError> {
        Ok(())
    }
}

struct TestApp {
    app: axum::Router,
    store: Arc<ContainerStore>,
    engine: Arc<FakeEngine>,
    output: OutputHub,
}

fn test_app_with(config_text: &str, triggers: Triggers) -> TestApp {
    let config = AppConfig::load_from_str(config_text).unwrap();
    let store = common::store();
    let engine = Arc::new(FakeEngine::default());
    let registries = common::registries(&["1.2.0", "1.3.0"], None);
    let watcher = common::watcher(engine.clone(), registries.clone(), store.clone());
    let output = OutputHub::new(Duration::from_secs(60));

    let mut engines: HashMap<String, Arc<dyn ContainerEngine>> = HashMap::new();
    engines.insert("local".into(), engine.clone());
    let installer = Arc::new(Installer::new(
        store.clone(),
        engines,
        (&config.install).into(),
    ));
    let app = routes::app(
        AppDeps {
            store: store.clone(),
            watchers: vec![watcher],
            registries,
            triggers,
            installer,
            output: output.clone(),
        },
        config,
    );
    TestApp {
        app,
        store,
        engine,
        output,
    }
}

fn test_app() -> TestApp {
    test_app_with(common::TEST_CONFIG, Triggers::default())
}

fn with_update(id: &str, name: &str, tag: &str, remote: &str) -> Container {
    let mut c = common::container(id, name, tag);
    c.result = Some(UpdateResult {
        tag: Some(remote.into()),
        ..Default::default()
    });
    c
}

#[tokio::test]
async fn test_version_endpoint() {
    let server = TestServer::new(test_app().app);
    let response = server.get("/version").await;
    response.assert_status_ok();
    let json: serde_json::Value = response.json();
    assert_eq!(json.get("name").and_then(|v| v.as_str()), Some("tagwatch"));
    assert!(json.get("version").and_then(|v| v.as_str()).is_some());
}

#[tokio::test]
async fn test_list_containers_dedups_and_filters() {
    let t = test_app();
    let mut stopped = with_update("old", "app", "1.2.0", "1.3.0");
    stopped.status = "exited".into();
    t.store.insert(stopped).await.unwrap();
    t.store.insert(with_update("new", "app", "1.2.0", "1.3.0")).await.unwrap();
    t.store.insert(common::container("db", "db", "15.0.0")).await.unwrap();
    let server = TestServer::new(t.app);

    let all: Vec<serde_json::Value> = server.get("/api/containers").await.json();
    let ids: Vec<&str> = all.iter().filter_map(|c| c["id"].as_str()).collect();
    assert_eq!(ids, vec!["new", "db"]);
    assert_eq!(all[0]["updateAvailable"], true);
    assert_eq!(all[0]["install"], false);

    let updates: Vec<serde_json::Value> = server
        .get("/api/containers")
        .add_query_param("updateAvailable", "true")
        .await
        .json();
    assert_eq!(updates.len(), 1);
    assert_eq!(updates[0]["id"], "new");
}

#[tokio::test]
async fn test_get_container_and_not_found() {
    let t = test_app();
    t.store.insert(with_update("c1", "app", "1.2.0", "1.3.0")).await.unwrap();
    let server = TestServer::new(t.app);

    let response = server.get("/api/containers/c1").await;
    response.assert_status_ok();
    let json: serde_json::Value = response.json();
    assert_eq!(json["updateKind"]["semverDiff"], "minor");

    server
        .get("/api/containers/missing")
        .await
        .assert_status_not_found();
}

#[tokio::test]
async fn test_delete_is_forbidden_unless_enabled() {
    let t = test_app();
    t.store.insert(common::container("c1", "app", "1.2.0")).await.unwrap();
    let server = TestServer::new(t.app);
    server
        .delete("/api/containers/c1")
        .await
        .assert_status(StatusCode::FORBIDDEN);
    assert!(t.store.get("c1").await.is_some());
}

#[tokio::test]
async fn test_delete_when_enabled() {
    let config = common::TEST_CONFIG.replace(
        "host = \"0.0.0.0\"",
        "host = \"0.0.0.0\"\ndelete_enabled = true",
    );
    let t = test_app_with(&config, Triggers::default());
    t.store.insert(common::container("c1", "app", "1.2.0")).await.unwrap();
    let server = TestServer::new(t.app);

    server
        .delete("/api/containers/c1")
        .await
        .assert_status(StatusCode::NO_CONTENT);
    assert!(t.store.get("c1").await.is_none());
    server
        .delete("/api/containers/c1")
        .await
        .assert_status_not_found();
}

#[tokio::test]
async fn test_watch_all_scans_engine() {
    let t = test_app();
    t.engine.run("c1", "app", "registry.test/app:1.2.0", &[]);
    let server = TestServer::new(t.app);

    let listed: Vec<serde_json::Value> = server.post("/api/containers/watch").await.json();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0]["result"]["tag"], "1.3.0");
    assert_eq!(listed[0]["updateKind"]["kind"], "tag");
}

#[tokio::test]
async fn test_watch_one_container() {
    let t = test_app();
    t.engine.run("c1", "app", "registry.test/app:1.2.0", &[]);
    t.store.insert(common::container("c1", "app", "1.2.0")).await.unwrap();
    t.store.insert(common::container("gone", "db", "15.0.0")).await.unwrap();
    let server = TestServer::new(t.app);

    let response = server.post("/api/containers/c1/watch").await;
    response.assert_status_ok();
    let json: serde_json::Value = response.json();
    assert_eq!(json["result"]["tag"], "1.3.0");

    server
        .post("/api/containers/gone/watch")
        .await
        .assert_status_not_found();
}

#[tokio::test]
async fn test_install_requires_an_install_trigger() {
    let t = test_app();
    t.store.insert(common::container("c1", "app", "1.2.0")).await.unwrap();
    let server = TestServer::new(t.app);
    let response = server.post("/api/containers/c1/install").await;
    response.assert_status(StatusCode::FORBIDDEN);
    let json: serde_json::Value = response.json();
    assert_eq!(json["error"], "Install not enabled");
}

#[tokio::test]
async fn test_install_unknown_container_is_not_found() {
    let triggers = Triggers::new(vec![Arc::new(Installable {
        common: TriggerCommon::default(),
    })]);
    let t = test_app_with(common::TEST_CONFIG, triggers);
    t.store.insert(common::container("c1", "app", "1.2.0")).await.unwrap();
    let server = TestServer::new(t.app);

    let listed: Vec<serde_json::Value> = server.get("/api/containers").await.json();
    assert_eq!(listed[0]["install"], true);
    server
        .post("/api/containers/missing/install")
        .await
        .assert_status_not_found();
}

#[tokio::test]
async fn test_failed_install_returns_outcome() {
    let triggers = Triggers::new(vec![Arc::new(Installable {
        common: TriggerCommon::default(),
    })]);
    let t = test_app_with(common::TEST_CONFIG, triggers);
    t.engine.run("c1", "app", "registry.test/app:1.2.0", &[]);
    t.store.insert(with_update("c1", "app", "1.2.0", "1.3.0")).await.unwrap();
    let server = TestServer::new(t.app);

    // the trigger has no install action, so the install fails right away
    let response = server.post("/api/containers/c1/install").await;
    response.assert_status(StatusCode::INTERNAL_SERVER_ERROR);
    let json: serde_json::Value = response.json();
    assert_eq!(json["outcome"]["success"], false);
    assert_eq!(json["outcome"]["phase"], "failed");
    assert_eq!(json["outcome"]["container"]["notification"]["level"], "error");
}

#[tokio::test]
async fn test_logs_endpoint() {
    let t = test_app();
    let server = TestServer::new(t.app);
    server
        .get("/api/containers/c1/logs")
        .await
        .assert_status_not_found();

    let sink = t.output.start("c1", "app");
    sink.line(OutputStream::Stdout, "pulling".into());
    let json: serde_json::Value = server.get("/api/containers/app/logs").await.json();
    assert_eq!(json["lines"][0]["line"], "pulling");
    assert_eq!(json["finished"], false);

    sink.finish(true);
    let json: serde_json::Value = server.get("/api/containers/c1/logs").await.json();
    assert_eq!(json["finished"], true);
    assert_eq!(json["success"], true);
}

#[tokio::test]
async fn test_component_listings() {
    let triggers = Triggers::new(vec![Arc::new(Installable {
        common: TriggerCommon::default(),
    })]);
    let server = TestServer::new(test_app_with(common::TEST_CONFIG, triggers).app);

    let watchers: Vec<serde_json::Value> = server.get("/api/watchers").await.json();
    assert_eq!(watchers[0]["id"], "docker.local");
    assert_eq!(watchers[0]["configuration"]["cron"], "0 * * * *");

    let registries: Vec<serde_json::Value> = server.get("/api/registries").await.json();
    assert_eq!(registries[0]["id"], "fake.test");
    assert_eq!(registries[0]["type"], "fake");

    let triggers: Vec<serde_json::Value> = server.get("/api/triggers").await.json();
    assert_eq!(triggers[0]["id"], "noop.install");
    assert_eq!(triggers[0]["configuration"]["token"], "s*****t");
}

// --- WebSocket tests (require http_transport + ws feature) ---
// Receive until we get valid JSON (server may send Ping first).

async fn receive_first_json_text(ws: &mut axum_test::TestWebSocket) -> serde_json::Value {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(3);
    loop {
        let text = ws.receive_text().await;
        if let Ok(v) = serde_json::from_str::<serde_json::Value>(&text) {
            return v;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting for JSON"
        );
    }
}

#[tokio::test]
async fn test_ws_containers_streams_store_changes() {
    let t = test_app();
    let store = t.store.clone();
    let server = TestServer::builder().http_transport().build(t.app);
    let mut ws = server
        .get_websocket("/ws/containers")
        .await
        .into_websocket()
        .await;

    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        store.insert(common::container("c1", "app", "1.2.0")).await.unwrap();
    });
    let message = receive_first_json_text(&mut ws).await;
    assert_eq!(message["type"], "added");
    assert_eq!(message["container"]["id"], "c1");
    assert_eq!(message["container"]["updateAvailable"], false);
}

#[tokio::test]
async fn test_ws_logs_replays_backlog_then_finish() {
    let t = test_app();
    let sink = t.output.start("c1", "app");
    sink.line(OutputStream::Stderr, "warming up".into());
    let server = TestServer::builder().http_transport().build(t.app);
    let mut ws = server
        .get_websocket("/ws/containers/c1/logs")
        .await
        .into_websocket()
        .await;

    let first = receive_first_json_text(&mut ws).await;
    assert_eq!(first["type"], "line");
    assert_eq!(first["line"]["line"], "warming up");
    assert_eq!(first["line"]["stream"], "stderr");

    sink.finish(false);
    let done = receive_first_json_text(&mut ws).await;
    assert_eq!(done["type"], "finished");
    assert_eq!(done["success"], false);
}
