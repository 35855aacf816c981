//! Standardized conversion of registry HTTP failures into typed errors

use crate::error::{RegistryApiError, RegistryErrorCode, SyncError};
use reqwest::StatusCode;
use serde::Deserialize;

#[derive(Debug, Deserialize)]
struct ErrorEnvelope {
    #[serde(default)]
    errors: Vec<ErrorDetail>,
}

#[derive(Debug, Deserialize)]
struct ErrorDetail {
    code: String,
    #[serde(default)]
    message: String,
}

/// Standard error handler for registry HTTP responses
pub struct HttpErrorHandler;

impl HttpErrorHandler {
    /// Build a [`RegistryApiError`] from a failed response status and body
    ///
    /// The body is expected to be a Registry v2 `{"errors": [...]}` envelope
    /// (`{"errors":[{"code":..,"message":..}]}`); anything else falls back to a
    /// status-derived message.
    pub fn registry_error(status: StatusCode, body: &str, operation: &str) -> RegistryApiError {
        if let Ok(envelope) = serde_json::from_str::<ErrorEnvelope>(body) {
            if let Some(first) = envelope.errors.first() {
                let message = if first.message.is_empty() {
                    format!("{} failed", operation)
                } else {
                    format!("{} failed: {}", operation, first.message)
                };
                return RegistryApiError::new(
                    status.as_u16(),
                    Some(RegistryErrorCode::parse(&first.code)),
                    message,
                );
            }
        }

        let message = match status.as_u16() {
            401 => format!("Unauthorized to perform {} operation", operation),
            403 => format!("Forbidden: insufficient permissions for {}", operation),
            404 => format!("Resource not found for {}", operation),
            429 => format!("Rate limited during {}", operation),
            500 => format!("Registry server error during {}", operation),
            502 | 503 => format!("Registry unavailable for {}", operation),
            _ => format!("{} failed (status {})", operation, status),
        };
        let message = if body.trim().is_empty() {
            message
        } else {
            format!("{}: {}", message, body.trim())
        };

        RegistryApiError::new(status.as_u16(), None, message)
    }

    /// Tag listing is special: a refusal to enumerate tags is tolerated by callers
    pub fn tag_listing_error(status: StatusCode, body: &str, repository: &str) -> SyncError {
        match status.as_u16() {
            401 | 403 => SyncError::TagListingDenied {
                repository: repository.to_string(),
                reason: Self::registry_error(status, body, "tag listing").message,
            },
            _ => SyncError::Registry(Self::registry_error(status, body, "tag listing")),
        }
    }
}
