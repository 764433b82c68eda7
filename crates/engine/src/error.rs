//! Engine error types.
//!
//! Errors follow the JSON:API error-object shape: every client-facing
//! failure carries a list of error objects with a `source.pointer` locating
//! the offending part of the request.

use serde::Serialize;
use thiserror::Error;

/// A single JSON:API error object.
#[derive(Debug, Clone, Serialize)]
pub struct ErrorObject {
    /// Human-readable description of the problem.
    pub detail: String,

    /// Location of the problem in the request document.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<ErrorSource>,
}

/// Pointer to the part of the request that caused an error.
#[derive(Debug, Clone, Serialize)]
pub struct ErrorSource {
    /// JSON pointer or dotted query path (e.g. `filter.target.name`).
    pub pointer: String,
}

impl ErrorObject {
    /// Create an error object with a source pointer.
    pub fn new(detail: impl Into<String>, pointer: impl Into<String>) -> Self {
        Self {
            detail: detail.into(),
            source: Some(ErrorSource {
                pointer: pointer.into(),
            }),
        }
    }

    /// Create an error object without a source pointer.
    pub fn bare(detail: impl Into<String>) -> Self {
        Self {
            detail: detail.into(),
            source: None,
        }
    }
}

/// Engine errors.
#[derive(Debug, Error)]
pub enum ApiError {
    /// Malformed filter, field, or relationship-type input. Client-fixable.
    #[error("validation failed")]
    Validation(Vec<ErrorObject>),

    /// A referenced entity or relation target does not exist.
    #[error("resource not found")]
    NotFound(Vec<ErrorObject>),

    /// Uniqueness or integrity violation surfaced from storage.
    #[error("conflict")]
    Conflict(Vec<ErrorObject>),

    /// Structurally valid but semantically wrong payload.
    #[error("unprocessable request")]
    Unprocessable(Vec<ErrorObject>),

    /// The requested operation is not available for the target type.
    #[error("method not allowed")]
    MethodNotAllowed(Vec<ErrorObject>),

    /// Unexpected storage or driver failure.
    #[error("internal error")]
    Internal(#[from] anyhow::Error),
}

impl ApiError {
    /// Single-object validation error.
    pub fn validation(detail: impl Into<String>, pointer: impl Into<String>) -> Self {
        ApiError::Validation(vec![ErrorObject::new(detail, pointer)])
    }

    /// Single-object not-found error.
    pub fn not_found(detail: impl Into<String>, pointer: impl Into<String>) -> Self {
        ApiError::NotFound(vec![ErrorObject::new(detail, pointer)])
    }

    /// Single-object unprocessable error.
    pub fn unprocessable(detail: impl Into<String>, pointer: impl Into<String>) -> Self {
        ApiError::Unprocessable(vec![ErrorObject::new(detail, pointer)])
    }

    /// Single-object method-not-allowed error.
    pub fn method_not_allowed(detail: impl Into<String>, pointer: impl Into<String>) -> Self {
        ApiError::MethodNotAllowed(vec![ErrorObject::new(detail, pointer)])
    }

    /// HTTP status code this error maps to.
    pub fn status(&self) -> u16 {
        match self {
            ApiError::Validation(_) => 400,
            ApiError::NotFound(_) => 404,
            ApiError::Conflict(_) => 409,
            ApiError::Unprocessable(_) => 422,
            ApiError::MethodNotAllowed(_) => 405,
            ApiError::Internal(_) => 500,
        }
    }

    /// Prefix every source pointer with `prefix`.
    ///
    /// Used by the atomic executor to tag a failure with the index of the
    /// operation that raised it. Errors without a pointer gain one so the
    /// failing operation is always locatable.
    pub fn with_pointer_prefix(self, prefix: &str) -> Self {
        fn rewrite(mut errors: Vec<ErrorObject>, prefix: &str) -> Vec<ErrorObject> {
            for e in &mut errors {
                e.source = Some(ErrorSource {
                    pointer: match e.source.take() {
                        Some(s) if !s.pointer.is_empty() => {
                            format!("{}/{}", prefix, s.pointer.trim_start_matches('/'))
                        }
                        _ => prefix.to_string(),
                    },
                });
            }
            errors
        }

        match self {
            ApiError::Validation(e) => ApiError::Validation(rewrite(e, prefix)),
            ApiError::NotFound(e) => ApiError::NotFound(rewrite(e, prefix)),
            ApiError::Conflict(e) => ApiError::Conflict(rewrite(e, prefix)),
            ApiError::Unprocessable(e) => ApiError::Unprocessable(rewrite(e, prefix)),
            ApiError::MethodNotAllowed(e) => ApiError::MethodNotAllowed(rewrite(e, prefix)),
            other @ ApiError::Internal(_) => other,
        }
    }

    /// Render as a JSON:API error document.
    ///
    /// Internal errors show their real message only when `debug` is set;
    /// otherwise a generic message is returned and the cause is logged.
    pub fn to_document(&self, debug: bool) -> serde_json::Value {
        let errors: Vec<ErrorObject> = match self {
            ApiError::Validation(e)
            | ApiError::NotFound(e)
            | ApiError::Conflict(e)
            | ApiError::Unprocessable(e)
            | ApiError::MethodNotAllowed(e) => e.clone(),
            ApiError::Internal(cause) => {
                tracing::error!(error = %cause, "internal engine error");
                if debug {
                    vec![ErrorObject::bare(format!("{cause:#}"))]
                } else {
                    vec![ErrorObject::bare("internal server error")]
                }
            }
        };
        serde_json::json!({ "errors": errors })
    }
}

/// Result type alias using ApiError.
pub type ApiResult<T> = Result<T, ApiError>;
