use axum::{
    extract::{
        Extension, Path,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    http::HeaderMap,
    response::{IntoResponse, Response},
};
use std::sync::Arc;
use tracing::debug;

use super::cookies::read_cookie;
use super::errors::ApiError;
use super::types::ErrorResponse;
use crate::authflow::FlowService;
use crate::authflow::notify::{CHANGED, Subscription};
use crate::authflow::session::USER_AGENT_COOKIE;

/// Push a `changed` text frame whenever the flow advances.
///
/// Frames never carry state; clients re-fetch with `/v1/authflows/get`.
#[utoipa::path(
    get,
    path = "/v1/authflows/ws/{workflow_id}",
    params(
        ("workflow_id" = String, Path, description = "Workflow id")
    ),
    responses(
        (status = 101, description = "Switching to WebSocket"),
        (status = 404, description = "Unknown or expired flow", body = ErrorResponse)
    ),
    tag = "authflow"
)]
pub async fn websocket(
    ws: WebSocketUpgrade,
    headers: HeaderMap,
    Path(workflow_id): Path<String>,
    service: Extension<Arc<FlowService>>,
) -> Response {
    let subscription = service.subscribe(&workflow_id);
    let user_agent = read_cookie(&headers, USER_AGENT_COOKIE);
    if let Err(err) = service
        .get(&workflow_id, None, user_agent.as_deref())
        .await
    {
        return ApiError::from(err).into_response();
    }
    ws.on_upgrade(move |socket| watch(socket, subscription))
}

async fn watch(mut socket: WebSocket, mut subscription: Subscription) {
    loop {
        tokio::select! {
            changed = subscription.changed() => {
                if !changed || socket.send(Message::Text(CHANGED.into())).await.is_err() {
                    break;
                }
            }
            incoming = socket.recv() => match incoming {
                Some(Ok(Message::Close(_)) | Err(_)) | None => break,
                Some(Ok(_)) => {}
            },
        }
    }
    debug!(workflow_id = subscription.workflow_id(), "flow watcher closed");
}
