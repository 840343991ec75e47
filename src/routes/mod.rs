// HTTP + WebSocket routes

mod http;
mod ws;

use axum::{
    Router,
    routing::{get, post},
};
use std::collections::BTreeMap;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};

use crate::config::AppConfig;
use crate::registry::Registries;
use crate::store::ContainerStore;
use crate::trigger::{Installer, OutputHub, Triggers};
use crate::watcher::Watcher;

#[derive(Clone)]
pub(crate) struct AppState {
    pub(crate) store: Arc<ContainerStore>,
    pub(crate) watchers: Arc<BTreeMap<String, Arc<Watcher>>>,
    pub(crate) registries: Registries,
    pub(crate) triggers: Triggers,
    pub(crate) installer: Arc<Installer>,
    pub(crate) output: OutputHub,
    pub(crate) config: AppConfig,
}

/// Components the routes read from.
pub struct AppDeps {
    pub store: Arc<ContainerStore>,
    pub watchers: Vec<Arc<Watcher>>,
    pub registries: Registries,
    pub triggers: Triggers,
    pub installer: Arc<Installer>,
    pub output: OutputHub,
}

pub fn app(deps: AppDeps, config: AppConfig) -> Router {
    let watchers = deps
        .watchers
        .into_iter()
        .map(|w| (w.name().to_string(), w))
        .collect();
    let state = AppState {
        store: deps.store,
        watchers: Arc::new(watchers),
        registries: deps.registries,
        triggers: deps.triggers,
        installer: deps.installer,
        output: deps.output,
        config,
    };
    Router::new()
        .route("/version", get(http::version_handler)) // GET /version
        .route("/api/containers", get(http::list_containers)) // GET /api/containers
        .route("/api/containers/watch", post(http::watch_all)) // POST /api/containers/watch
        .route(
            "/api/containers/{id}",
            get(http::get_container).delete(http::delete_container),
        ) // GET, DELETE /api/containers/{id}
        .route("/api/containers/{id}/watch", post(http::watch_one)) // POST /api/containers/{id}/watch
        .route("/api/containers/{id}/install", post(http::install)) // POST /api/containers/{id}/install
        .route("/api/containers/{id}/logs", get(http::container_logs)) // GET /api/containers/{id}/logs
        .route("/api/watchers", get(http::list_watchers)) // GET /api/watchers
        .route("/api/registries", get(http::list_registries)) // GET /api/registries
        .route("/api/triggers", get(http::list_triggers)) // GET /api/triggers
        .route("/ws/containers", get(ws::ws_containers)) // WS /ws/containers
        .route("/ws/containers/{id}/logs", get(ws::ws_container_logs)) // WS /ws/containers/{id}/logs
        .layer(CorsLayer::new().allow_origin(Any))
        .with_state(state)
}
