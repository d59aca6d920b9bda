//! Flow errors as HTTP responses.

use axum::{
    Json,
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
};
use tracing::error;

use super::cookies::set_cookies;
use super::types::{ErrorDetail, ErrorResponse, FlowResponse};
use crate::authflow::{DomainError, FlowError, ServiceError};

#[derive(Debug)]
pub struct ApiError(pub ServiceError);

impl From<ServiceError> for ApiError {
    fn from(err: ServiceError) -> Self {
        Self(err)
    }
}

impl From<FlowError> for ApiError {
    fn from(err: FlowError) -> Self {
        Self(err.into())
    }
}

#[must_use]
pub fn status_code(err: &FlowError) -> StatusCode {
    match err {
        FlowError::InvalidInputKind { .. } | FlowError::InvalidInput(_) | FlowError::Registry(_) => {
            StatusCode::BAD_REQUEST
        }
        FlowError::NotFound | FlowError::UnknownFlow(_) => StatusCode::NOT_FOUND,
        FlowError::Conflict => StatusCode::CONFLICT,
        FlowError::Domain(DomainError::RateLimited) => StatusCode::TOO_MANY_REQUESTS,
        FlowError::Domain(_) => StatusCode::UNPROCESSABLE_ENTITY,
        FlowError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let ServiceError { error: err, state } = self.0;
        let status = status_code(&err);
        let message = match &err {
            FlowError::Internal(inner) => {
                error!("authflow request failed: {inner:#}");
                "internal error".to_string()
            }
            other => other.to_string(),
        };

        let mut headers = HeaderMap::new();
        if let Some(state) = &state {
            set_cookies(&mut headers, &state.cookies);
        }
        let body = ErrorResponse {
            error: ErrorDetail {
                reason: err.reason().to_string(),
                message,
            },
            state: state.map(|state| FlowResponse::from(*state)),
        };
        (status, headers, Json(body)).into_response()
    }
}
