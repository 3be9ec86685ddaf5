//! Error types shared by the kube-jit API and operator
//!
//! Errors are structured with fields to aid debugging in production.
//! Each variant carries the context an operator needs: the cluster or
//! JitRequest involved and whether retrying can help.

use thiserror::Error;

/// Default context value when no specific context is available
pub const UNKNOWN_CONTEXT: &str = "unknown";

/// Main error type for kube-jit operations
#[derive(Debug, Error)]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes error: {source}")]
    Kube {
        /// The underlying kube-rs error
        #[from]
        source: kube::Error,
    },

    /// Validation error for a JitRequest or configuration object
    #[error("validation error for {resource}: {message}")]
    Validation {
        /// Name of the object that failed validation
        resource: String,
        /// Description of what's invalid
        message: String,
        /// The invalid field path (e.g., "spec.clusterRole")
        field: Option<String>,
    },

    /// Credential acquisition for a target cluster failed
    #[error("credential error [{provider}] for {cluster}: {message}")]
    Credentials {
        /// Name of the target cluster
        cluster: String,
        /// Credential provider (gke, aks, generic)
        provider: String,
        /// Description of what failed
        message: String,
        /// Whether this error is retryable
        retryable: bool,
    },

    /// Callback to the API failed
    #[error("callback error for ticket {ticket}: {message}")]
    Callback {
        /// API ticket id the callback was reporting on
        ticket: String,
        /// Description of what failed
        message: String,
    },

    /// Serialization/deserialization error
    #[error("serialization error: {message}")]
    Serialization {
        /// Description of what failed
        message: String,
        /// The resource kind being serialized (if known)
        kind: Option<String>,
    },

    /// Internal/operational error
    #[error("internal error [{context}]: {message}")]
    Internal {
        /// Description of what failed
        message: String,
        /// Context where the error occurred (e.g., "reconciler", "config-cache")
        context: String,
    },
}

impl Error {
    /// Create a validation error with the given message
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation {
            resource: UNKNOWN_CONTEXT.to_string(),
            message: msg.into(),
            field: None,
        }
    }

    /// Create a validation error for a named object
    pub fn validation_for(resource: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Validation {
            resource: resource.into(),
            message: msg.into(),
            field: None,
        }
    }

    /// Create a validation error for a named object and field path
    pub fn validation_for_field(
        resource: impl Into<String>,
        field: impl Into<String>,
        msg: impl Into<String>,
    ) -> Self {
        Self::Validation {
            resource: resource.into(),
            message: msg.into(),
            field: Some(field.into()),
        }
    }

    /// Create a retryable credential error
    pub fn credentials(
        cluster: impl Into<String>,
        provider: impl Into<String>,
        msg: impl Into<String>,
    ) -> Self {
        Self::Credentials {
            cluster: cluster.into(),
            provider: provider.into(),
            message: msg.into(),
            retryable: true,
        }
    }

    /// Create a non-retryable credential error (e.g., malformed cluster config)
    pub fn credentials_permanent(
        cluster: impl Into<String>,
        provider: impl Into<String>,
        msg: impl Into<String>,
    ) -> Self {
        Self::Credentials {
            cluster: cluster.into(),
            provider: provider.into(),
            message: msg.into(),
            retryable: false,
        }
    }

    /// Create a callback error for a ticket
    pub fn callback(ticket: impl ToString, msg: impl Into<String>) -> Self {
        Self::Callback {
            ticket: ticket.to_string(),
            message: msg.into(),
        }
    }

    /// Create a serialization error with the given message
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization {
            message: msg.into(),
            kind: None,
        }
    }

    /// Create a serialization error with resource kind context
    pub fn serialization_for_kind(kind: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Serialization {
            message: msg.into(),
            kind: Some(kind.into()),
        }
    }

    /// Create an internal error with the given message
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: UNKNOWN_CONTEXT.to_string(),
        }
    }

    /// Create an internal error with context
    pub fn internal_with_context(context: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: context.into(),
        }
    }

    /// Check if this error is retryable
    ///
    /// Validation and serialization errors need a spec or config fix.
    /// Kubernetes 4xx responses are permanent except for 409 conflicts and 429 throttling.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Kube { source } => match source {
                kube::Error::Api(ae) => {
                    !(400..500).contains(&ae.code) || ae.code == 409 || ae.code == 429
                }
                _ => true,
            },
            Error::Validation { .. } => false,
            Error::Credentials { retryable, .. } => *retryable,
            Error::Callback { .. } => true,
            Error::Serialization { .. } => false,
            Error::Internal { .. } => true,
        }
    }

    /// Get the cluster name if this error is associated with a specific cluster
    pub fn cluster(&self) -> Option<&str> {
        match self {
            Error::Credentials { cluster, .. } => Some(cluster),
            _ => None,
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::serialization(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn api_error(code: u16) -> Error {
        Error::Kube {
            source: kube::Error::Api(kube::error::ErrorResponse {
                status: "Failure".to_string(),
                message: "boom".to_string(),
                reason: "Test".to_string(),
                code,
            }),
        }
    }

    /// Story: a disallowed cluster role is a permanent failure
    ///
    /// The reconciler must reject the request instead of requeueing forever.
    #[test]
    fn story_validation_errors_are_permanent() {
        let err = Error::validation_for_field(
            "jit-3",
            "spec.clusterRole",
            "ClusterRole 'cluster-admin' is not allowed",
        );
        assert!(err.to_string().contains("jit-3"));
        assert!(err.to_string().contains("cluster-admin"));
        assert!(!err.is_retryable());

        match err {
            Error::Validation { field, .. } => {
                assert_eq!(field.as_deref(), Some("spec.clusterRole"))
            }
            _ => panic!("Expected Validation variant"),
        }
    }

    /// Story: credential failures surface the cluster for the 5xx path
    #[test]
    fn story_credential_errors_carry_cluster_context() {
        let err = Error::credentials("prod-gke", "gke", "metadata server unreachable");
        assert_eq!(err.cluster(), Some("prod-gke"));
        assert!(err.is_retryable());
        assert!(err.to_string().contains("[gke]"));

        let err = Error::credentials_permanent("prod-aks", "aks", "missing subscription");
        assert!(!err.is_retryable());
    }

    #[test]
    fn kube_client_errors_are_classified_by_status() {
        assert!(!api_error(403).is_retryable());
        assert!(!api_error(404).is_retryable());
        assert!(api_error(409).is_retryable());
        assert!(api_error(429).is_retryable());
        assert!(api_error(503).is_retryable());
    }

    #[test]
    fn callback_errors_name_the_ticket() {
        let err = Error::callback(17, "connection refused");
        assert_eq!(
            err.to_string(),
            "callback error for ticket 17: connection refused"
        );
        assert!(err.is_retryable());
    }
}
