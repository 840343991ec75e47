// REST handlers: containers, watch, install, script logs, component listings

use axum::{
    Json,
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
};
use futures_util::future::join_all;
use serde_json::{Value, json};

use super::AppState;
use crate::models::Container;
use crate::store::ContainerQuery;
use crate::trigger::InstallError;
use crate::version::{NAME, VERSION};

fn error(status: StatusCode, message: impl Into<String>) -> Response {
    (status, Json(json!({ "error": message.into() }))).into_response()
}

/// Container document plus whether the install action is usable.
fn listing_document(state: &AppState, container: &Container) -> Value {
    let mut doc = container.to_document();
    if let Value::Object(map) = &mut doc {
        map.insert(
            "install".into(),
            serde_json::to_value(state.triggers.install_availability()).unwrap_or(Value::Bool(false)),
        );
    }
    doc
}

async fn listing(state: &AppState, query: &ContainerQuery) -> Vec<Value> {
    state
        .store
        .list(query)
        .await
        .iter()
        .map(|c| listing_document(state, c))
        .collect()
}

/// GET /version: returns service name and version (from Cargo.toml at build time).
pub(super) async fn version_handler() -> impl IntoResponse {
    Json(json!({
        "name": NAME,
        "version": VERSION,
    }))
}

/// GET /api/containers: current containers, one per (name, watcher, registry).
pub(super) async fn list_containers(
    State(state): State<AppState>,
    Query(query): Query<ContainerQuery>,
) -> impl IntoResponse {
    Json(listing(&state, &query).await)
}

pub(super) async fn get_container(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    match state.store.get(&id).await {
        Some(container) => Json(container.to_document()).into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

pub(super) async fn delete_container(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    if !state.config.server.delete_enabled {
        return StatusCode::FORBIDDEN.into_response();
    }
    if state.store.get(&id).await.is_none() {
        return StatusCode::NOT_FOUND.into_response();
    }
    match state.store.delete(&id).await {
        Ok(_) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => error(
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("Error when deleting container {id} ({e})"),
        ),
    }
}

/// POST /api/containers/watch: scan every watcher, then list.
pub(super) async fn watch_all(
    State(state): State<AppState>,
    Query(query): Query<ContainerQuery>,
) -> impl IntoResponse {
    join_all(state.watchers.values().map(|w| w.watch())).await;
    Json(listing(&state, &query).await)
}

/// POST /api/containers/{id}/watch: re-check one container if it still exists.
pub(super) async fn watch_one(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    let Some(container) = state.store.get(&id).await else {
        return StatusCode::NOT_FOUND.into_response();
    };
    let Some(watcher) = state.watchers.get(&container.watcher) else {
        return error(
            StatusCode::INTERNAL_SERVER_ERROR,
            format!(
                "No provider found for container {id} and provider {}",
                container.watcher
            ),
        );
    };
    let containers = match watcher.get_containers().await {
        Ok(containers) => containers,
        Err(e) => {
            return error(
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("Error when watching container {id} ({e})"),
            );
        }
    };
    let Some(found) = containers.into_iter().find(|c| c.id == id) else {
        return StatusCode::NOT_FOUND.into_response();
    };
    match watcher.watch_container(found).await {
        Some(report) => Json(report.container.to_document()).into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

/// POST /api/containers/{id}/install: run the install orchestration.
pub(super) async fn install(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    let trigger = match state.triggers.install_trigger() {
        Ok(trigger) => trigger,
        Err(e @ InstallError::NotEnabled) => return error(StatusCode::FORBIDDEN, e.to_string()),
        Err(e) => return error(StatusCode::BAD_REQUEST, e.to_string()),
    };
    match state.installer.install(trigger.as_ref(), &id).await {
        Ok(outcome) if outcome.success => Json(outcome).into_response(),
        Ok(outcome) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({
                "error": format!("Error when installing container {id} ({})", outcome.message),
                "outcome": outcome,
            })),
        )
            .into_response(),
        Err(InstallError::ContainerNotFound(_)) => StatusCode::NOT_FOUND.into_response(),
        Err(e) => error(StatusCode::BAD_REQUEST, e.to_string()),
    }
}

/// GET /api/containers/{id}/logs: script output so far (id or container name).
pub(super) async fn container_logs(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    match state.output.subscribe(&id) {
        Some(subscription) => Json(json!({
            "lines": subscription.backlog,
            "finished": subscription.finished.is_some(),
            "success": subscription.finished,
        }))
        .into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

pub(super) async fn list_watchers(State(state): State<AppState>) -> impl IntoResponse {
    let watchers: Vec<Value> = state
        .watchers
        .values()
        .map(|w| {
            let config = w.config();
            json!({
                "id": format!("docker.{}", w.name()),
                "name": w.name(),
                "configuration": {
                    "socket": config.socket,
                    "host": config.host,
                    "port": config.port,
                    "cron": config.cron,
                    "watchbydefault": config.watchbydefault,
                    "watchall": config.watchall,
                    "watchevents": config.watchevents,
                    "watchatstart": config.watchatstart,
                },
            })
        })
        .collect();
    Json(watchers)
}

pub(super) async fn list_registries(State(state): State<AppState>) -> impl IntoResponse {
    let registries: Vec<Value> = state
        .registries
        .all()
        .iter()
        .map(|r| {
            json!({
                "id": r.id(),
                "type": r.provider(),
                "name": r.name(),
                "configuration": r.mask_configuration(),
            })
        })
        .collect();
    Json(registries)
}

pub(super) async fn list_triggers(State(state): State<AppState>) -> impl IntoResponse {
    let triggers: Vec<Value> = state
        .triggers
        .all()
        .iter()
        .map(|t| {
            json!({
                "id": t.id(),
                "type": t.provider(),
                "name": t.name(),
                "configuration": t.mask_configuration(),
            })
        })
        .collect();
    Json(triggers)
}
