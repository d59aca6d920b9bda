//! `/health`: build metadata plus a probe of the flow store.

use crate::GIT_COMMIT_HASH;
use crate::authflow::FlowService;
use axum::{
    body::Body,
    extract::Extension,
    http::{HeaderMap, HeaderValue, Method, StatusCode},
    response::{IntoResponse, Json},
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::time::{Duration, timeout};
use tracing::{Instrument, debug, error, info_span, warn};
use utoipa::ToSchema;

const HEALTH_STORE_TIMEOUT_SECONDS: u64 = 2;

#[derive(ToSchema, Serialize, Deserialize, Debug)]
pub struct Health {
    commit: String,
    name: String,
    version: String,
    /// `memory` or `postgres`.
    backend: String,
    store: String,
}

#[utoipa::path(
    get,
    path = "/health",
    responses(
        (status = 200, description = "Flow store is reachable", body = Health),
        (status = 503, description = "Flow store is unreachable", body = Health)
    ),
    tag = "health",
)]
/// Report build metadata and whether the flow store answers.
///
/// `OPTIONS` returns the same status and `X-App` header without a body.
pub async fn health(method: Method, service: Extension<Arc<FlowService>>) -> impl IntoResponse {
    let store = service.store();
    let span = info_span!("store.ping", backend = store.backend());
    let healthy = match timeout(
        Duration::from_secs(HEALTH_STORE_TIMEOUT_SECONDS),
        store.ping().instrument(span),
    )
    .await
    {
        Ok(Ok(())) => true,
        Ok(Err(err)) => {
            error!("Flow store ping failed: {err}");
            false
        }
        Err(_) => {
            warn!("Flow store health check timed out");
            false
        }
    };

    let health = Health {
        commit: GIT_COMMIT_HASH.to_string(),
        name: env!("CARGO_PKG_NAME").to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        backend: store.backend().to_string(),
        store: if healthy { "ok" } else { "error" }.to_string(),
    };

    let body = if method == Method::GET {
        Json(&health).into_response()
    } else {
        Body::empty().into_response()
    };

    let short_hash = health.commit.get(0..7).unwrap_or_default();
    let mut headers = HeaderMap::new();
    match format!("{}:{}:{}", health.name, health.version, short_hash).parse::<HeaderValue>() {
        Ok(value) => {
            headers.insert("X-App", value);
        }
        Err(err) => debug!("Failed to parse X-App header: {}", err),
    }

    let status = if healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, headers, body)
}
