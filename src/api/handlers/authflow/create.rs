use axum::{
    Json,
    extract::Extension,
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
};
use std::sync::Arc;

use super::cookies::{read_cookie, set_cookies};
use super::errors::ApiError;
use super::types::{CreateFlowRequest, ErrorResponse, FlowResponse};
use crate::authflow::session::{OAUTH_SESSION_COOKIE, SessionRequest, USER_AGENT_COOKIE};
use crate::authflow::{FlowError, FlowReference, FlowService, FlowType};

/// Create a flow and return the first action.
///
/// Always sets the user-agent cookie. An OAuth session cookie that no longer
/// resolves is cleared.
#[utoipa::path(
    post,
    path = "/v1/authflows",
    request_body = CreateFlowRequest,
    responses(
        (status = 200, description = "Flow created", body = FlowResponse),
        (status = 400, description = "Invalid batch input", body = ErrorResponse),
        (status = 404, description = "Unknown flow", body = ErrorResponse),
        (status = 422, description = "Batch input rejected by a step", body = ErrorResponse)
    ),
    tag = "authflow"
)]
pub async fn create(
    headers: HeaderMap,
    service: Extension<Arc<FlowService>>,
    payload: Option<Json<CreateFlowRequest>>,
) -> Response {
    let Some(Json(request)) = payload else {
        return ApiError::from(FlowError::InvalidInput("missing payload".to_string()))
            .into_response();
    };
    let flow_type: FlowType = match request.flow_type.parse() {
        Ok(flow_type) => flow_type,
        Err(_) => {
            return ApiError::from(FlowError::UnknownFlow(format!(
                "{}/{}",
                request.flow_type, request.name
            )))
            .into_response();
        }
    };
    let reference = FlowReference::new(flow_type, &request.name);

    let oauth_session_id = read_cookie(&headers, OAUTH_SESSION_COOKIE);
    let user_agent_id = read_cookie(&headers, USER_AGENT_COOKIE);
    let session = match service
        .resolve_session(SessionRequest {
            oauth_session_id: oauth_session_id.as_deref(),
            user_agent_id: user_agent_id.as_deref(),
            url_query: request.url_query.as_deref(),
        })
        .await
    {
        Ok(session) => session,
        Err(err) => return ApiError::from(err).into_response(),
    };

    let batch = request.batch_input.unwrap_or_default();
    match service.create_with_batch(&reference, session, &batch).await {
        Ok(output) => {
            let mut headers = HeaderMap::new();
            set_cookies(&mut headers, &output.cookies);
            (StatusCode::OK, headers, Json(FlowResponse::from(output))).into_response()
        }
        Err(err) => ApiError::from(err).into_response(),
    }
}
