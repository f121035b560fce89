//! API Error Handling
//!
//! Engine errors become JSON bodies carrying the request id and a message
//! that is safe to show to a player.

use crate::errors::{ErrorClass, TrackerError, TreasuryError, WagerError};
use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::{error, warn};

/// Top-level API error response with request tracking
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub request_id: String,
    pub error: ErrorBody,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    /// NOT_FOUND, BAD_REQUEST, UNAUTHORIZED, REJECTED, TRY_AGAIN, UNDER_REVIEW
    pub code: String,
    pub message: String,
}

#[derive(Debug)]
pub struct ApiError {
    pub kind: ApiErrorKind,
    pub request_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApiErrorKind {
    NotFound(String),
    BadRequest(String),
    Unauthorized(String),
    /// Refused by policy; the message says what to change.
    Rejected(String),
    TryAgain(String),
    UnderReview(String),
}

impl ApiError {
    pub fn not_found(request_id: String, message: String) -> Self {
        Self {
            kind: ApiErrorKind::NotFound(message),
            request_id,
        }
    }

    pub fn bad_request(request_id: String, message: String) -> Self {
        Self {
            kind: ApiErrorKind::BadRequest(message),
            request_id,
        }
    }

    pub fn unauthorized(request_id: String, message: String) -> Self {
        Self {
            kind: ApiErrorKind::Unauthorized(message),
            request_id,
        }
    }

    /// Classify an engine error. Internals of fatal errors are logged here
    /// and never reach the response body.
    pub fn from_wager(request_id: String, err: WagerError) -> Self {
        let message = err.user_message();
        let kind = match (&err, err.class()) {
            (WagerError::Tracker(TrackerError::RequestNotFound(_)), _)
            | (WagerError::Treasury(TreasuryError::EntryNotFound(_)), _) => ApiErrorKind::NotFound(message),
            (_, ErrorClass::Rejected) => ApiErrorKind::Rejected(message),
            (_, ErrorClass::Transient) => {
                warn!(request_id = %request_id, error = %err, "Transient failure");
                ApiErrorKind::TryAgain(message)
            }
            (_, class) => {
                error!(request_id = %request_id, error = %err, %class, "Request needs review");
                ApiErrorKind::UnderReview(message)
            }
        };
        Self { kind, request_id }
    }
}

impl fmt::Display for ApiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (_, code, message) = self.parts();
        write!(f, "[{}] {}: {}", self.request_id, code, message)
    }
}

impl std::error::Error for ApiError {}

impl ApiError {
    fn parts(&self) -> (StatusCode, &'static str, &str) {
        match &self.kind {
            ApiErrorKind::NotFound(msg) => (StatusCode::NOT_FOUND, "NOT_FOUND", msg),
            ApiErrorKind::BadRequest(msg) => (StatusCode::BAD_REQUEST, "BAD_REQUEST", msg),
            ApiErrorKind::Unauthorized(msg) => (StatusCode::UNAUTHORIZED, "UNAUTHORIZED", msg),
            ApiErrorKind::Rejected(msg) => (StatusCode::UNPROCESSABLE_ENTITY, "REJECTED", msg),
            ApiErrorKind::TryAgain(msg) => (StatusCode::SERVICE_UNAVAILABLE, "TRY_AGAIN", msg),
            ApiErrorKind::UnderReview(msg) => (StatusCode::CONFLICT, "UNDER_REVIEW", msg),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code, message) = self.parts();
        let body = Json(ErrorResponse {
            request_id: self.request_id.clone(),
            error: ErrorBody {
                code: code.to_string(),
                message: message.to_string(),
            },
        });
        (status, body).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::{ChainError, ResolutionError, TRY_AGAIN_MESSAGE, UNDER_REVIEW_MESSAGE};
    use crate::types::RequestId;

    #[test]
    fn test_classes_map_to_status() {
        let transient = ApiError::from_wager("r1".into(), ChainError::Timeout(10).into());
        assert_eq!(transient.kind, ApiErrorKind::TryAgain(TRY_AGAIN_MESSAGE.to_string()));

        let fatal = ApiError::from_wager(
            "r2".into(),
            ResolutionError::ScanLimitExceeded { subject: "handle".into(), limit: 4 }.into(),
        );
        assert_eq!(fatal.kind, ApiErrorKind::UnderReview(UNDER_REVIEW_MESSAGE.to_string()));
        assert_eq!(fatal.into_response().status(), StatusCode::CONFLICT);

        let missing = ApiError::from_wager(
            "r3".into(),
            TrackerError::RequestNotFound(RequestId::from_digest(&[1u8; 32])).into(),
        );
        assert_eq!(missing.into_response().status(), StatusCode::NOT_FOUND);

        let policy = ApiError::from_wager("r4".into(), TreasuryError::InvalidAmount.into());
        assert_eq!(policy.into_response().status(), StatusCode::UNPROCESSABLE_ENTITY);
    }
}
