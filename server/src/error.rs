//! Error types for the control plane

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use thiserror::Error;

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for the control plane
#[derive(Debug, Error)]
pub enum Error {
    // Workspace errors (2000-2999)
    #[error("Workspace not found: {0}")]
    WorkspaceNotFound(String),

    #[error("Cannot change desired state from {from} to {to}")]
    InvalidDesiredState { from: String, to: String },

    #[error("Workspace quota exceeded: {0}")]
    QuotaExceeded(String),

    // Devfile errors (3000-3999)
    #[error("Devfile not found: {0}")]
    DevfileNotFound(String),

    #[error("Invalid devfile: {0}")]
    DevfileInvalid(String),

    // Agent errors (5000-5999)
    #[error("Agent not found: {0}")]
    AgentNotFound(String),

    #[error("Agent already exists: {0}")]
    AgentAlreadyExists(String),

    #[error("Workspaces are not configured for agent {0}")]
    AgentConfigNotFound(i64),

    #[error("Workspaces are disabled for agent {0}")]
    AgentDisabled(i64),

    #[error("Invalid agent configuration: {0}")]
    InvalidAgentConfig(String),

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    // Reconciliation item errors (4000-4099), never surfaced to the agent
    #[error("Unknown workspace reported by agent: {0}")]
    UnknownWorkspace(String),

    #[error("Invalid workspace agent info: {0}")]
    InvalidAgentInfo(String),

    // Infrastructure errors (6000-6999)
    #[error("Database error: {0}")]
    DatabaseError(String),

    // General errors (1000-1999)
    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Get the error code
    pub fn code(&self) -> u32 {
        match self {
            // Workspace errors (2000-2999)
            Error::WorkspaceNotFound(_) => 2001,
            Error::InvalidDesiredState { .. } => 2002,
            Error::QuotaExceeded(_) => 2003,

            // Devfile errors (3000-3999)
            Error::DevfileNotFound(_) => 3001,
            Error::DevfileInvalid(_) => 3002,

            // Reconciliation item errors (4000-4099)
            Error::UnknownWorkspace(_) => 4001,
            Error::InvalidAgentInfo(_) => 4002,

            // Agent errors (5000-5999)
            Error::AgentNotFound(_) => 5001,
            Error::AgentAlreadyExists(_) => 5002,
            Error::AgentConfigNotFound(_) => 5003,
            Error::AgentDisabled(_) => 5004,
            Error::InvalidAgentConfig(_) => 5005,
            Error::Unauthorized(_) => 5006,

            // Infrastructure errors (6000-6999)
            Error::DatabaseError(_) => 6001,

            // General errors (1000-1999)
            Error::InvalidParameter(_) => 1002,
            Error::Internal(_) => 1003,
        }
    }

    /// Get the HTTP status code
    pub fn status_code(&self) -> StatusCode {
        match self {
            Error::WorkspaceNotFound(_)
            | Error::AgentNotFound(_)
            | Error::DevfileNotFound(_)
            | Error::UnknownWorkspace(_) => StatusCode::NOT_FOUND,

            Error::InvalidDesiredState { .. } | Error::AgentAlreadyExists(_) => {
                StatusCode::CONFLICT
            }

            Error::QuotaExceeded(_) => StatusCode::FORBIDDEN,

            Error::Unauthorized(_) => StatusCode::UNAUTHORIZED,

            Error::DevfileInvalid(_)
            | Error::AgentConfigNotFound(_)
            | Error::AgentDisabled(_)
            | Error::InvalidAgentConfig(_)
            | Error::InvalidAgentInfo(_) => StatusCode::UNPROCESSABLE_ENTITY,

            Error::InvalidParameter(_) => StatusCode::BAD_REQUEST,

            Error::DatabaseError(_) | Error::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

/// API error response
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub code: u32,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            tracing::error!(code = self.code(), "{}", self);
        }
        let body = ErrorResponse {
            code: self.code(),
            message: self.to_string(),
            details: None,
        };

        (status, Json(body)).into_response()
    }
}

// Implement From for common error types
impl From<sqlx::Error> for Error {
    fn from(err: sqlx::Error) -> Self {
        Error::DatabaseError(err.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Internal(err.to_string())
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Internal(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert_eq!(
            Error::Unauthorized("missing token".into()).status_code(),
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(
            Error::DatabaseError("locked".into()).status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
        assert_eq!(
            Error::InvalidDesiredState {
                from: "Terminated".into(),
                to: "Running".into()
            }
            .status_code(),
            StatusCode::CONFLICT
        );
        assert_eq!(Error::QuotaExceeded("user".into()).code(), 2003);
    }
}
