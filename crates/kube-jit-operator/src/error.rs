//! Reconciler error type

use thiserror::Error;

use crate::callback::CallbackError;

/// Errors surfaced by the kube-jit reconcilers
///
/// Anything returned from a reconcile lands in the controller's error policy
/// and is requeued. Conditions that should not be retried (a request failing
/// validation, an undeliverable callback) are handled inside the reconciler
/// and never show up here.
#[derive(Debug, Error)]
pub enum ReconcileError {
    /// Shared kube-jit error (Kubernetes API, serialization, ...)
    #[error(transparent)]
    Common(#[from] kube_jit_common::Error),

    /// Raw Kubernetes API error
    #[error("kubernetes error: {0}")]
    Kube(#[from] kube::Error),

    /// KubeJitConfig is missing or invalid
    #[error("configuration error: {0}")]
    Config(String),

    /// Reading or writing the on-disk config cache failed
    #[error("config cache {path}: {message}")]
    ConfigCache {
        /// Cache file path
        path: String,
        /// What failed
        message: String,
    },

    /// Callback to the API failed
    #[error(transparent)]
    Callback(#[from] CallbackError),

    /// Object is missing metadata the reconciler depends on
    #[error("{kind} {name} is missing {field}")]
    MissingMetadata {
        /// Resource kind
        kind: &'static str,
        /// Object name
        name: String,
        /// Missing field
        field: &'static str,
    },
}

impl ReconcileError {
    /// Whether requeueing can resolve the error
    pub fn is_retryable(&self) -> bool {
        match self {
            ReconcileError::Common(e) => e.is_retryable(),
            ReconcileError::Kube(_) => true,
            ReconcileError::Config(_) => true,
            ReconcileError::ConfigCache { .. } => true,
            ReconcileError::Callback(e) => e.is_retryable(),
            ReconcileError::MissingMetadata { .. } => false,
        }
    }
}

/// Result alias for reconciler operations
pub type Result<T> = std::result::Result<T, ReconcileError>;
