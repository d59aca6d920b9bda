use axum::{
    Json,
    extract::Extension,
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
};
use std::sync::Arc;

use super::cookies::read_cookie;
use super::errors::ApiError;
use super::types::{ErrorResponse, FlowResponse, GetRequest};
use crate::authflow::session::USER_AGENT_COOKIE;
use crate::authflow::{FlowError, FlowService};

/// Read the state of a flow without changing it.
#[utoipa::path(
    post,
    path = "/v1/authflows/get",
    request_body = GetRequest,
    responses(
        (status = 200, description = "Current state", body = FlowResponse),
        (status = 404, description = "Unknown or expired flow", body = ErrorResponse)
    ),
    tag = "authflow"
)]
pub async fn get(
    headers: HeaderMap,
    service: Extension<Arc<FlowService>>,
    payload: Option<Json<GetRequest>>,
) -> Response {
    let Some(Json(request)) = payload else {
        return ApiError::from(FlowError::InvalidInput("missing payload".to_string()))
            .into_response();
    };
    let user_agent = read_cookie(&headers, USER_AGENT_COOKIE);
    match service
        .get(
            &request.id,
            request.instance_id.as_deref(),
            user_agent.as_deref(),
        )
        .await
    {
        Ok(output) => (StatusCode::OK, Json(FlowResponse::from(output))).into_response(),
        Err(err) => ApiError::from(err).into_response(),
    }
}
