// WebSocket handlers: store changes and live script output

use axum::{
    extract::{
        Path, State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    http::StatusCode,
    response::{IntoResponse, Response},
};
use bytes::Bytes;
use tokio::sync::broadcast;
use tokio::time::{Duration, timeout};

use super::AppState;
use crate::event::ContainerEvent;
use crate::trigger::output::{OutputEvent, OutputSubscription};

pub(super) const WS_PING_INTERVAL: Duration = Duration::from_secs(30);
pub(super) const WS_SEND_TIMEOUT: Duration = Duration::from_secs(10);

/// False when the client is gone or too slow.
async fn send_json(socket: &mut WebSocket, value: &serde_json::Value) -> bool {
    let text = value.to_string();
    matches!(
        timeout(WS_SEND_TIMEOUT, socket.send(Message::Text(text.into()))).await,
        Ok(Ok(()))
    )
}

async fn send_ping(socket: &mut WebSocket) -> bool {
    matches!(
        timeout(WS_SEND_TIMEOUT, socket.send(Message::Ping(Bytes::new()))).await,
        Ok(Ok(()))
    )
}

pub(super) async fn ws_containers(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    let mut rx = state.store.bus().subscribe_containers();
    ws.on_upgrade(move |socket| async move {
        stream_containers(socket, &mut rx).await;
    })
}

async fn stream_containers(mut socket: WebSocket, rx: &mut broadcast::Receiver<ContainerEvent>) {
    tracing::info!("Client connected to containers stream");
    let mut ping_interval = tokio::time::interval(WS_PING_INTERVAL);
    ping_interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    loop {
        tokio::select! {
            result = rx.recv() => {
                match result {
                    Ok(event) => {
                        let (kind, container) = match &event {
                            ContainerEvent::Added(c) => ("added", c),
                            ContainerEvent::Updated(c) => ("updated", c),
                            ContainerEvent::Removed(c) => ("removed", c),
                        };
                        let message = serde_json::json!({ "type": kind, "container": container.to_document() });
                        if !send_json(&mut socket, &message).await {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        tracing::warn!("WebSocket /ws/containers client lagged, skipped {} messages", n);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
            _ = ping_interval.tick() => {
                if !send_ping(&mut socket).await {
                    break;
                }
            }
        }
    }
}

/// Backlog first, then live lines until the script finishes.
pub(super) async fn ws_container_logs(
    ws: WebSocketUpgrade,
    Path(id): Path<String>,
    State(state): State<AppState>,
) -> Response {
    let Some(subscription) = state.output.subscribe(&id) else {
        return StatusCode::NOT_FOUND.into_response();
    };
    ws.on_upgrade(move |socket| async move {
        stream_logs(socket, subscription).await;
    })
    .into_response()
}

async fn stream_logs(mut socket: WebSocket, subscription: OutputSubscription) {
    let OutputSubscription {
        backlog,
        finished,
        mut feed,
    } = subscription;
    tracing::info!("Client connected to script output stream");

    for line in &backlog {
        let message = serde_json::json!({ "type": "line", "line": line });
        if !send_json(&mut socket, &message).await {
            return;
        }
    }
    if let Some(success) = finished {
        let _ = send_json(&mut socket, &serde_json::json!({ "type": "finished", "success": success })).await;
        return;
    }

    let mut ping_interval = tokio::time::interval(WS_PING_INTERVAL);
    ping_interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    loop {
        tokio::select! {
            result = feed.recv() => {
                match result {
                    Ok(OutputEvent::Line(line)) => {
                        let message = serde_json::json!({ "type": "line", "line": line });
                        if !send_json(&mut socket, &message).await {
                            break;
                        }
                    }
                    Ok(OutputEvent::Finished { success }) => {
                        let _ = send_json(&mut socket, &serde_json::json!({ "type": "finished", "success": success })).await;
                        break;
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        tracing::warn!("WebSocket script output client lagged, skipped {} lines", n);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
            _ = ping_interval.tick() => {
                if !send_ping(&mut socket).await {
                    break;
                }
            }
        }
    }
}
