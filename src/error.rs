//! Error types for the Sightline engine
//!
//! - `thiserror` for the error definitions
//! - Domain-specific variants so callers can tell a bad request from a broken catalog
//! - HTTP status code mapping for API responses

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use std::borrow::Cow;
use thiserror::Error;

/// Result type alias for Sightline operations
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for the Sightline engine
#[derive(Debug, Error)]
pub enum Error {
    // ========================================================================
    // Configuration Errors
    // ========================================================================
    #[error("Configuration error: {message}")]
    Config {
        message: Cow<'static, str>,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidConfig {
        key: &'static str,
        message: Cow<'static, str>,
    },

    // ========================================================================
    // Catalog Errors
    // ========================================================================
    #[error("Catalog error: {message}")]
    Catalog { message: Cow<'static, str> },

    #[error("Entity not found: {entity_type} with id {id}")]
    NotFound {
        entity_type: &'static str,
        id: String,
    },

    // ========================================================================
    // Request Errors
    // ========================================================================
    #[error("Bad request: {message}")]
    BadRequest { message: Cow<'static, str> },

    #[error("Could not resolve a city for this request")]
    CityUnresolved { client_ip: Option<String> },

    // ========================================================================
    // Serialization / IO Errors
    // ========================================================================
    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // ========================================================================
    // Generic Errors
    // ========================================================================
    #[error("Internal server error")]
    Internal {
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },
}

impl Error {
    /// Create a catalog error
    pub fn catalog(message: impl Into<Cow<'static, str>>) -> Self {
        Self::Catalog {
            message: message.into(),
        }
    }

    /// Create a bad request error
    pub fn bad_request(message: impl Into<Cow<'static, str>>) -> Self {
        Self::BadRequest {
            message: message.into(),
        }
    }

    /// Create a not found error
    pub fn not_found(entity_type: &'static str, id: impl Into<String>) -> Self {
        Self::NotFound {
            entity_type,
            id: id.into(),
        }
    }

    /// Create an internal error
    pub fn internal(source: impl std::error::Error + Send + Sync + 'static) -> Self {
        Self::Internal {
            source: Some(Box::new(source)),
        }
    }

    // ========================================================================
    // Error Classification
    // ========================================================================

    /// Returns true if this error should be logged at error level
    fn is_error_level(&self) -> bool {
        matches!(
            self,
            Error::Config { .. } | Error::Catalog { .. } | Error::Internal { .. } | Error::Io(_)
        )
    }

    /// Get HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            Error::BadRequest { .. } | Error::CityUnresolved { .. } | Error::Json(_) => {
                StatusCode::BAD_REQUEST
            }
            Error::NotFound { .. } => StatusCode::NOT_FOUND,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Get error code for API responses
    pub fn error_code(&self) -> &'static str {
        match self {
            Error::Config { .. } | Error::InvalidConfig { .. } => "CONFIG_ERROR",
            Error::Catalog { .. } => "CATALOG_ERROR",
            Error::NotFound { .. } => "NOT_FOUND",
            Error::BadRequest { .. } => "BAD_REQUEST",
            Error::CityUnresolved { .. } => "CITY_UNRESOLVED",
            Error::Json(_) => "SERIALIZATION_ERROR",
            Error::Io(_) | Error::Internal { .. } => "INTERNAL_ERROR",
        }
    }
}

// ============================================================================
// Error Response for API
// ============================================================================

/// API error response body
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: ErrorBody,
}

#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub code: &'static str,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let code = self.error_code();

        if self.is_error_level() {
            tracing::error!("Request failed: {:?}", self);
        }

        // Don't expose internal error details
        let message = if status == StatusCode::INTERNAL_SERVER_ERROR {
            "An internal error occurred".to_string()
        } else {
            self.to_string()
        };

        let details = match &self {
            Error::CityUnresolved { client_ip } => Some(serde_json::json!({
                "source": "unresolved",
                "clientIp": client_ip,
            })),
            _ => None,
        };

        let body = ErrorResponse {
            error: ErrorBody {
                code,
                message,
                details,
            },
        };

        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_status_codes() {
        assert_eq!(
            Error::not_found("media", "m1").status_code(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            Error::bad_request("invalid").status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            Error::CityUnresolved { client_ip: None }.status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            Error::Internal { source: None }.status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn test_error_codes_are_stable() {
        let invalid = Error::InvalidConfig {
            key: "ML_FACTORS",
            message: "zero".into(),
        };
        assert_eq!(invalid.error_code(), "CONFIG_ERROR");
        assert_eq!(invalid.status_code(), StatusCode::INTERNAL_SERVER_ERROR);
        assert!(!invalid.is_error_level());
        assert!(Error::Config {
            message: "failed to load .env".into(),
            source: None,
        }
        .is_error_level());
        assert_eq!(
            Error::CityUnresolved { client_ip: Some("1.2.3.4".into()) }.error_code(),
            "CITY_UNRESOLVED"
        );
    }
}
