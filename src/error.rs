// Copyright (c) 2024-2025 Jesse Morgan
// Licensed under the MIT License. See LICENSE file for details.

//! Engine error taxonomy.
//!
//! Every failure a caller can observe is one of these variants, carrying a
//! stable reason code plus a human-readable message. Internal detail (query
//! text, stack context) stays in the tracing log; it never reaches a client.
//! Store-layer errors always roll the surrounding transaction back, so no
//! partial mutation is observable.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;
use std::fmt;

/// Structured failure with a stable reason code.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(tag = "error_type", rename_all = "snake_case")]
pub enum EngineError {
    /// Malformed or out-of-range input, rejected at the boundary (400).
    Validation { code: String, message: String },
    /// Unknown token/session/binding (404).
    NotFound { code: String, message: String },
    /// Token or PIN past its validity (410).
    Expired { code: String, message: String },
    /// Signature invalid, version stale, or session/binding mismatch (401).
    Unauthorized { code: String, message: String },
    /// Double-claim, role mismatch, or a mutation against a terminal
    /// session (409).
    Conflict { code: String, message: String },
    /// The caller's role lacks permission (403).
    Forbidden { code: String, message: String },
    /// Storage-layer failure. Logged internally, opaque to clients (500).
    Internal { code: String, message: String },
}

impl EngineError {
    pub fn validation(code: &str, message: impl Into<String>) -> Self {
        Self::Validation {
            code: code.to_string(),
            message: message.into(),
        }
    }

    pub fn not_found(code: &str, message: impl Into<String>) -> Self {
        Self::NotFound {
            code: code.to_string(),
            message: message.into(),
        }
    }

    pub fn expired(code: &str, message: impl Into<String>) -> Self {
        Self::Expired {
            code: code.to_string(),
            message: message.into(),
        }
    }

    pub fn unauthorized(code: &str, message: impl Into<String>) -> Self {
        Self::Unauthorized {
            code: code.to_string(),
            message: message.into(),
        }
    }

    pub fn conflict(code: &str, message: impl Into<String>) -> Self {
        Self::Conflict {
            code: code.to_string(),
            message: message.into(),
        }
    }

    pub fn forbidden(code: &str, message: impl Into<String>) -> Self {
        Self::Forbidden {
            code: code.to_string(),
            message: message.into(),
        }
    }

    /// Storage failures are logged with full detail here, then surfaced
    /// as an opaque internal error.
    pub fn internal(message: impl Into<String>) -> Self {
        let message = message.into();
        tracing::error!(detail = %message, "storage error");
        Self::Internal {
            code: "INTERNAL".to_string(),
            message: "internal error".to_string(),
        }
    }

    /// Stable reason code for this error.
    pub fn code(&self) -> &str {
        match self {
            Self::Validation { code, .. }
            | Self::NotFound { code, .. }
            | Self::Expired { code, .. }
            | Self::Unauthorized { code, .. }
            | Self::Conflict { code, .. }
            | Self::Forbidden { code, .. }
            | Self::Internal { code, .. } => code,
        }
    }

    /// User-facing message.
    pub fn message(&self) -> &str {
        match self {
            Self::Validation { message, .. }
            | Self::NotFound { message, .. }
            | Self::Expired { message, .. }
            | Self::Unauthorized { message, .. }
            | Self::Conflict { message, .. }
            | Self::Forbidden { message, .. }
            | Self::Internal { message, .. } => message,
        }
    }

    /// HTTP status this error maps to at the adapter.
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::Validation { .. } => StatusCode::BAD_REQUEST,
            Self::NotFound { .. } => StatusCode::NOT_FOUND,
            Self::Expired { .. } => StatusCode::GONE,
            Self::Unauthorized { .. } => StatusCode::UNAUTHORIZED,
            Self::Conflict { .. } => StatusCode::CONFLICT,
            Self::Forbidden { .. } => StatusCode::FORBIDDEN,
            Self::Internal { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl fmt::Display for EngineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code(), self.message())
    }
}

impl std::error::Error for EngineError {}

/// Wire shape for failed requests.
#[derive(Debug, Clone, Serialize)]
pub struct ErrorResponse {
    pub error: EngineError,
    pub status: u16,
}

impl IntoResponse for EngineError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let response = ErrorResponse {
            status: status.as_u16(),
            error: self,
        };

        let body = serde_json::to_string(&response).unwrap_or_else(|_| {
            r#"{"error":{"error_type":"internal","code":"INTERNAL","message":"internal error"},"status":500}"#
                .to_string()
        });

        (status, [("content-type", "application/json")], body).into_response()
    }
}
