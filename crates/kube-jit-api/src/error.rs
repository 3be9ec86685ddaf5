//! Error types for the API
//!
//! Every handler returns [`Error`]; its `IntoResponse` impl produces the
//! `{"error": ..., "status": ...}` envelope. Store and cluster failures are
//! logged with detail and reported to the caller opaquely.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use tracing::error;

use crate::store::StoreError;

/// Result type for API operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error type for API operations
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Malformed input or a request the policy refuses
    #[error("bad request: {0}")]
    BadRequest(String),

    /// Namespace is not adopted on the target cluster
    #[error("invalid namespace: {0}")]
    InvalidNamespace(String),

    /// Cluster is not configured
    #[error("unknown cluster: {0}")]
    ClusterUnknown(String),

    /// Missing or invalid session, bad callback signature
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    /// Authenticated but not allowed
    #[error("forbidden: {0}")]
    Forbidden(String),

    /// Request id does not exist
    #[error("not found: {0}")]
    NotFound(String),

    /// The request is in a state that does not allow the operation
    #[error("conflict: {0}")]
    Conflict(String),

    /// Persistent store failure
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// Target cluster unreachable or credentials could not be minted
    #[error("cluster error [{cluster}]: {message}")]
    Cluster {
        /// Cluster name
        cluster: String,
        /// What failed
        message: String,
        /// Whether retrying can help
        retryable: bool,
    },

    /// Upstream identity provider failure
    #[error("identity provider error: {0}")]
    Identity(String),

    /// Anything else
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Cluster error that a retry may fix
    pub fn cluster(cluster: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Cluster {
            cluster: cluster.into(),
            message: message.into(),
            retryable: true,
        }
    }

    /// Cluster error that needs an operator to fix
    pub fn cluster_permanent(cluster: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Cluster {
            cluster: cluster.into(),
            message: message.into(),
            retryable: false,
        }
    }

    /// Whether the operation that produced this error may succeed if retried
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Cluster { retryable, .. } => *retryable,
            Error::Store(_) | Error::Identity(_) | Error::Internal(_) => true,
            _ => false,
        }
    }

    /// HTTP status for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            Error::BadRequest(_) | Error::InvalidNamespace(_) | Error::ClusterUnknown(_) => {
                StatusCode::BAD_REQUEST
            }
            Error::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            Error::Forbidden(_) => StatusCode::FORBIDDEN,
            Error::NotFound(_) => StatusCode::NOT_FOUND,
            Error::Conflict(_) => StatusCode::CONFLICT,
            Error::Identity(_) => StatusCode::BAD_GATEWAY,
            Error::Store(_) | Error::Cluster { .. } | Error::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let message = match &self {
            Error::Store(_) | Error::Cluster { .. } | Error::Internal(_) => {
                error!(error = %self, "request failed");
                "internal server error".to_string()
            }
            Error::Identity(_) => {
                error!(error = %self, "identity provider failed");
                "identity provider unavailable".to_string()
            }
            _ => self.to_string(),
        };

        let body = serde_json::json!({
            "error": message,
            "status": status.as_u16()
        });

        (status, axum::Json(body)).into_response()
    }
}

impl From<kube_jit_common::Error> for Error {
    fn from(e: kube_jit_common::Error) -> Self {
        match e {
            kube_jit_common::Error::Credentials {
                cluster,
                message,
                retryable,
                ..
            } => Error::Cluster {
                cluster,
                message,
                retryable,
            },
            kube_jit_common::Error::Validation { message, .. } => Error::BadRequest(message),
            other => Error::Internal(other.to_string()),
        }
    }
}

impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        Error::Identity(e.to_string())
    }
}
