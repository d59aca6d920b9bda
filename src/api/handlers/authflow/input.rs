use axum::{
    Json,
    extract::Extension,
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
};
use std::sync::Arc;

use super::cookies::read_cookie;
use super::errors::ApiError;
use super::types::{ErrorResponse, FlowResponse, InputRequest};
use crate::authflow::session::USER_AGENT_COOKIE;
use crate::authflow::{FlowError, FlowService};

/// Feed one input, or a batch of inputs, to a flow.
#[utoipa::path(
    post,
    path = "/v1/authflows/input",
    request_body = InputRequest,
    responses(
        (status = 200, description = "Input accepted", body = FlowResponse),
        (status = 400, description = "Input not accepted in the current state", body = ErrorResponse),
        (status = 404, description = "Unknown or expired flow", body = ErrorResponse),
        (status = 409, description = "Stale instance id", body = ErrorResponse),
        (status = 422, description = "Input rejected by the step", body = ErrorResponse),
        (status = 429, description = "Rate limited", body = ErrorResponse)
    ),
    tag = "authflow"
)]
pub async fn input(
    headers: HeaderMap,
    service: Extension<Arc<FlowService>>,
    payload: Option<Json<InputRequest>>,
) -> Response {
    let Some(Json(request)) = payload else {
        return ApiError::from(FlowError::InvalidInput("missing payload".to_string()))
            .into_response();
    };
    let user_agent = read_cookie(&headers, USER_AGENT_COOKIE);
    let instance_id = request.instance_id.as_deref();

    let result = match (&request.input, &request.batch_input) {
        (Some(input), None) => {
            service
                .feed_input(&request.id, instance_id, input, user_agent.as_deref())
                .await
        }
        (None, Some(batch)) => {
            service
                .batch_input(&request.id, instance_id, batch, user_agent.as_deref())
                .await
        }
        _ => {
            return ApiError::from(FlowError::InvalidInput(
                "exactly one of `input` or `batch_input` is required".to_string(),
            ))
            .into_response();
        }
    };

    match result {
        Ok(output) => (StatusCode::OK, Json(FlowResponse::from(output))).into_response(),
        Err(err) => ApiError::from(err).into_response(),
    }
}
