//! Structured API error responses with error codes
//!
//! Every failing endpoint answers with `{"error": {"code", "numeric_code",
//! "message", ...}}` and an `x-error-code` header. Absence of data is not an
//! error and never goes through here.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};

use crate::infra::InventoryError;

// ============================================================================
// Error Codes
// ============================================================================

/// Stable, machine-readable error codes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    // Validation errors (3xxx)
    /// Request body is malformed
    InvalidRequestBody,
    /// Field value is invalid
    InvalidFieldValue,
    /// Quantity is negative
    InvalidQuantity,

    // Conflict errors (5xxx)
    /// Expected version did not match
    VersionConflict,

    // State errors (7xxx)
    /// Change log read was not contiguous
    SequenceGap,

    // Infrastructure errors (8xxx)
    /// Database operation failed
    DatabaseError,
    /// A dependency is not ready
    ServiceUnavailable,
    /// Internal server error
    InternalError,
}

impl ErrorCode {
    pub fn numeric_code(&self) -> u32 {
        match self {
            ErrorCode::InvalidRequestBody => 3001,
            ErrorCode::InvalidFieldValue => 3003,
            ErrorCode::InvalidQuantity => 3008,
            ErrorCode::VersionConflict => 5003,
            ErrorCode::SequenceGap => 7003,
            ErrorCode::DatabaseError => 8001,
            ErrorCode::ServiceUnavailable => 8002,
            ErrorCode::InternalError => 8999,
        }
    }

    pub fn http_status(&self) -> StatusCode {
        match self {
            ErrorCode::InvalidRequestBody => StatusCode::BAD_REQUEST,
            ErrorCode::InvalidFieldValue | ErrorCode::InvalidQuantity => {
                StatusCode::UNPROCESSABLE_ENTITY
            }
            ErrorCode::VersionConflict | ErrorCode::SequenceGap => StatusCode::CONFLICT,
            ErrorCode::DatabaseError | ErrorCode::InternalError => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
            ErrorCode::ServiceUnavailable => StatusCode::SERVICE_UNAVAILABLE,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::InvalidRequestBody => "INVALID_REQUEST_BODY",
            ErrorCode::InvalidFieldValue => "INVALID_FIELD_VALUE",
            ErrorCode::InvalidQuantity => "INVALID_QUANTITY",
            ErrorCode::VersionConflict => "VERSION_CONFLICT",
            ErrorCode::SequenceGap => "SEQUENCE_GAP",
            ErrorCode::DatabaseError => "DATABASE_ERROR",
            ErrorCode::ServiceUnavailable => "SERVICE_UNAVAILABLE",
            ErrorCode::InternalError => "INTERNAL_ERROR",
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Structured Error Response
// ============================================================================

/// Structured error response for API endpoints
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiError {
    pub error: ErrorDetails,
}

/// Detailed error information
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorDetails {
    pub code: ErrorCode,
    pub numeric_code: u32,
    pub message: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl ApiError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            error: ErrorDetails {
                code,
                numeric_code: code.numeric_code(),
                message: message.into(),
                details: None,
            },
        }
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.error.details = Some(details);
        self
    }

    pub fn status(&self) -> StatusCode {
        self.error.code.http_status()
    }

    pub fn invalid_body(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::InvalidRequestBody, message)
    }

    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::ServiceUnavailable, message)
    }
}

impl From<InventoryError> for ApiError {
    fn from(err: InventoryError) -> Self {
        match &err {
            InventoryError::InvalidInput { field, .. } => {
                let field = field.clone();
                ApiError::new(ErrorCode::InvalidFieldValue, err.to_string())
                    .with_details(serde_json::json!({ "field": field }))
            }
            InventoryError::InvalidQuantity(_) => {
                ApiError::new(ErrorCode::InvalidQuantity, err.to_string())
            }
            InventoryError::VersionConflict {
                expected, actual, ..
            } => {
                let details = serde_json::json!({ "expected": expected, "actual": actual });
                ApiError::new(ErrorCode::VersionConflict, err.to_string()).with_details(details)
            }
            InventoryError::SequenceGap { .. } => {
                ApiError::new(ErrorCode::SequenceGap, err.to_string())
            }
            InventoryError::Database(_) | InventoryError::Migration(_) => {
                tracing::error!(error = %err, "Database error in API handler");
                ApiError::new(ErrorCode::DatabaseError, "database operation failed")
            }
            InventoryError::Cancelled => ApiError::unavailable("service is shutting down"),
            InventoryError::NotFound { .. }
            | InventoryError::Configuration(_)
            | InventoryError::Internal(_) => {
                tracing::error!(error = %err, "Internal error in API handler");
                ApiError::new(ErrorCode::InternalError, "internal error")
            }
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let code = self.error.code.as_str();
        let mut response = (status, Json(self)).into_response();

        response.headers_mut().insert(
            axum::http::header::HeaderName::from_static("x-error-code"),
            axum::http::HeaderValue::from_static(code),
        );

        response
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codes_serialize_screaming_snake_case() {
        let json = serde_json::to_value(ErrorCode::VersionConflict).unwrap();
        assert_eq!(json, "VERSION_CONFLICT");
        assert_eq!(ErrorCode::InvalidQuantity.to_string(), "INVALID_QUANTITY");
    }

    #[test]
    fn test_invalid_input_maps_to_422() {
        let err: ApiError = InventoryError::InvalidInput {
            field: "store".into(),
            reason: "must not be empty".into(),
        }
        .into();

        assert_eq!(err.status(), StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(err.error.details.unwrap()["field"], "store");
    }

    #[test]
    fn test_version_conflict_maps_to_409() {
        let err: ApiError = InventoryError::VersionConflict {
            store: "Berlin".into(),
            item: "Widget-001".into(),
            expected: 1,
            actual: 3,
        }
        .into();

        assert_eq!(err.status(), StatusCode::CONFLICT);
        assert_eq!(err.error.numeric_code, 5003);
    }

    #[test]
    fn test_internal_errors_hide_details() {
        let err: ApiError = InventoryError::Internal("secret path /var/db".into()).into();
        assert_eq!(err.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert!(!err.error.message.contains("/var/db"));
    }

    #[test]
    fn test_response_carries_error_code_header() {
        let response = ApiError::invalid_body("bad json").into_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(response.headers()["x-error-code"], "INVALID_REQUEST_BODY");
    }
}
