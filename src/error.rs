//! 统一的 API 错误类型，以及引擎错误到 HTTP 状态码的一一映射。

use axum::http::{HeaderMap, HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use tracing::error;

use crate::config::TUS_VERSION;
use crate::engine::UploadError;
use crate::http::{TUS_VERSION_HEADER, UPLOAD_OFFSET};

#[derive(Debug)]
pub enum ApiError {
    BadRequest(String),
    NotFound,
    Gone,
    Conflict { offset: u64 },
    PayloadTooLarge(String),
    UnsupportedMediaType,
    PreconditionFailed,
    ServiceUnavailable(u64),
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg).into_response(),
            ApiError::NotFound => StatusCode::NOT_FOUND.into_response(),
            ApiError::Gone => StatusCode::GONE.into_response(),
            ApiError::Conflict { offset } => {
                let mut headers = HeaderMap::new();
                headers.insert(UPLOAD_OFFSET, HeaderValue::from(offset));
                (StatusCode::CONFLICT, headers, "upload offset mismatch").into_response()
            }
            ApiError::PayloadTooLarge(msg) => (StatusCode::PAYLOAD_TOO_LARGE, msg).into_response(),
            ApiError::UnsupportedMediaType => (
                StatusCode::UNSUPPORTED_MEDIA_TYPE,
                "content type must be application/offset+octet-stream",
            )
                .into_response(),
            ApiError::PreconditionFailed => {
                let mut headers = HeaderMap::new();
                headers.insert(TUS_VERSION_HEADER, HeaderValue::from_static(TUS_VERSION));
                (
                    StatusCode::PRECONDITION_FAILED,
                    headers,
                    "unsupported tus protocol version",
                )
                    .into_response()
            }
            ApiError::ServiceUnavailable(retry_after) => {
                let mut headers = HeaderMap::new();
                if retry_after > 0 {
                    headers.insert(header::RETRY_AFTER, HeaderValue::from(retry_after));
                }
                (StatusCode::SERVICE_UNAVAILABLE, headers, "temporarily unavailable")
                    .into_response()
            }
            ApiError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg).into_response(),
        }
    }
}

impl From<UploadError> for ApiError {
    fn from(error: UploadError) -> Self {
        match error {
            UploadError::Validation(msg) => ApiError::BadRequest(msg),
            UploadError::TooLarge { .. } => ApiError::PayloadTooLarge(error.to_string()),
            UploadError::NotFound(_) => ApiError::NotFound,
            UploadError::Gone(_) => ApiError::Gone,
            UploadError::Conflict { expected, .. } => ApiError::Conflict { offset: expected },
            UploadError::Timeout(_) => ApiError::ServiceUnavailable(1),
            UploadError::Allocation(_)
            | UploadError::Io(_)
            | UploadError::StoreUnavailable(_)
            | UploadError::Internal(_) => {
                error!(error = %error, "upload request failed");
                ApiError::Internal("internal server error".into())
            }
        }
    }
}
