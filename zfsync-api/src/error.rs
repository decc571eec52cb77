//! Standardized error handling for API responses
//!
//! Every HTTP error renders a `{"detail": ...}` JSON body.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use tracing::error;

/// Standard API error response body
#[derive(Debug, Serialize)]
pub struct ErrorDetail {
    pub detail: String,
}

/// API error with its HTTP status
#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub detail: String,
}

impl ApiError {
    pub fn new(status: StatusCode, detail: impl Into<String>) -> Self {
        Self {
            status,
            detail: detail.into(),
        }
    }

    pub fn not_found(what: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, format!("{} not found", what.into()))
    }

    pub fn bad_request(detail: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, detail)
    }

    // Conflicts surface as 400 with the reason in the body
    pub fn conflict(detail: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, detail)
    }

    pub fn forbidden(detail: impl Into<String>) -> Self {
        Self::new(StatusCode::FORBIDDEN, detail)
    }

    pub fn unauthorized() -> Self {
        Self::new(StatusCode::UNAUTHORIZED, "Authentication required")
    }

    pub fn internal(detail: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, detail)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if self.status.is_server_error() {
            error!("API error {}: {}", self.status, self.detail);
        }
        (
            self.status,
            Json(ErrorDetail {
                detail: self.detail,
            }),
        )
            .into_response()
    }
}

impl From<zfsync_common::Error> for ApiError {
    fn from(err: zfsync_common::Error) -> Self {
        use zfsync_common::Error;
        match &err {
            Error::NotFound(_) => ApiError::new(StatusCode::NOT_FOUND, err.to_string()),
            Error::Conflict(_) | Error::Invariant(_) | Error::BadRequest(_) => {
                ApiError::new(StatusCode::BAD_REQUEST, err.to_string())
            }
            Error::Unauthorized => ApiError::unauthorized(),
            Error::Forbidden(_) => ApiError::new(StatusCode::FORBIDDEN, err.to_string()),
            _ => {
                error!("Internal error: {}", err);
                ApiError::internal(err.to_string())
            }
        }
    }
}

pub type ApiResult<T> = std::result::Result<T, ApiError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_mapping() {
        let err: ApiError = zfsync_common::Error::NotFound("Node 3".to_string()).into();
        assert_eq!(err.status, StatusCode::NOT_FOUND);

        let err: ApiError = zfsync_common::Error::Conflict("duplicate name".to_string()).into();
        assert_eq!(err.status, StatusCode::BAD_REQUEST);

        let err: ApiError =
            zfsync_common::Error::Invariant("node referenced by jobs".to_string()).into();
        assert_eq!(err.status, StatusCode::BAD_REQUEST);

        let err: ApiError = zfsync_common::Error::Internal("boom".to_string()).into();
        assert_eq!(err.status, StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn test_detail_body() {
        let err = ApiError::not_found("Job 9");
        let body = serde_json::to_string(&ErrorDetail {
            detail: err.detail.clone(),
        })
        .unwrap();
        assert_eq!(body, r#"{"detail":"Job 9 not found"}"#);
    }
}
