//! HTTP error envelope: `{"error": {"code": "...", "message": "..."}}`.

use crate::auth::{AuthError, CredentialError};
use crate::cardtoken::CardTokenError;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use serde::Serialize;

/// Stable error codes clients can switch on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    ValidationError,
    Unauthorized,
    Conflict,
    NotFound,
    RateLimited,
    InternalError,
}

impl ErrorCode {
    pub fn status(self) -> StatusCode {
        match self {
            Self::ValidationError => StatusCode::BAD_REQUEST,
            Self::Unauthorized => StatusCode::UNAUTHORIZED,
            Self::Conflict => StatusCode::CONFLICT,
            Self::NotFound => StatusCode::NOT_FOUND,
            Self::RateLimited => StatusCode::TOO_MANY_REQUESTS,
            Self::InternalError => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiError {
    pub code: ErrorCode,
    pub message: String,
}

impl ApiError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::ValidationError, message)
    }

    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Unauthorized, message)
    }

    pub fn rate_limited() -> Self {
        Self::new(
            ErrorCode::RateLimited,
            "Too many requests. Please retry later.",
        )
    }

    pub fn internal() -> Self {
        Self::new(ErrorCode::InternalError, "Internal server error")
    }

    pub fn status(&self) -> StatusCode {
        self.code.status()
    }
}

impl From<AuthError> for ApiError {
    fn from(err: AuthError) -> Self {
        match err {
            AuthError::InvalidToken(CardTokenError::Entropy(ref e)) => {
                tracing::error!(error = %e, "Entropy source failed");
                Self::internal()
            }
            AuthError::InvalidToken(_) => Self::validation("Invalid card"),
            AuthError::PairMismatch
            | AuthError::LegacyRoleOrder
            | AuthError::PairExpired
            | AuthError::WrongRole(_)
            | AuthError::ConfirmationRequired
            | AuthError::InvalidInput(_) => Self::validation(err.to_string()),
            AuthError::PrimaryAlreadyRegistered
            | AuthError::BackupAlreadyRegistered
            | AuthError::PairAlreadyRegistered => {
                Self::new(ErrorCode::Conflict, err.to_string())
            }
            AuthError::CardNotFound | AuthError::UserNotFound => {
                Self::new(ErrorCode::NotFound, err.to_string())
            }
            AuthError::CardRevoked
            | AuthError::InvalidCredentials
            | AuthError::SessionRevoked
            | AuthError::SessionUnknown => Self::unauthorized(err.to_string()),
            AuthError::Credential(CredentialError::Signing(ref e)) => {
                tracing::error!(error = %e, "Failed to sign credential");
                Self::internal()
            }
            AuthError::Credential(_) => Self::unauthorized("Invalid or expired session"),
            AuthError::Password(ref e) => {
                tracing::error!(error = %e, "Password hashing failed");
                Self::internal()
            }
            AuthError::Store(ref e) => {
                tracing::error!(error = %e, "Store error");
                Self::internal()
            }
        }
    }
}

#[derive(Serialize)]
struct ErrorBody<'a> {
    error: ErrorDetail<'a>,
}

#[derive(Serialize)]
struct ErrorDetail<'a> {
    code: ErrorCode,
    message: &'a str,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: ErrorDetail {
                code: self.code,
                message: &self.message,
            },
        };
        (self.status(), Json(body)).into_response()
    }
}

/// Success envelope: `{"data": ...}`.
pub fn data<T: Serialize>(value: T) -> Json<serde_json::Value> {
    Json(serde_json::json!({ "data": value }))
}
