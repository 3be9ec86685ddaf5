//! Common types for kube-jit: CRDs, errors, and Kubernetes utilities

#![deny(missing_docs)]

pub mod clock;
pub mod crd;
pub mod error;
pub mod events;
pub mod kube_utils;
pub mod retry;
pub mod telemetry;

pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

/// API group for all kube-jit CRDs
pub const JIT_API_GROUP: &str = "jit.kubejit.io";

/// Label marking a namespace as adopted by kube-jit
pub const ADOPT_LABEL: &str = "jit.kubejit.io/adopt";

/// Label selector for adopted namespaces (for Kubernetes API queries)
pub const ADOPT_LABEL_SELECTOR: &str = "jit.kubejit.io/adopt=true";

/// Namespace annotation carrying the directory group id allowed to approve access
pub const GROUP_ID_ANNOTATION: &str = "jit.kubejit.io/group_id";

/// Namespace annotation carrying the directory group name allowed to approve access
pub const GROUP_NAME_ANNOTATION: &str = "jit.kubejit.io/group_name";

/// Annotation on role bindings recording when they must be gone
pub const EXPIRES_AT_ANNOTATION: &str = "jit.kubejit.io/expires-at";

/// Label on role bindings naming the JitRequest that owns them
pub const REQUEST_LABEL: &str = "jit.kubejit.io/request";

/// Label on role bindings carrying the API ticket id
pub const TICKET_LABEL: &str = "jit.kubejit.io/ticket-id";

/// Name of the JitGroupCache singleton
pub const GROUP_CACHE_NAME: &str = "jitgroupcache";

/// Default name of the KubeJitConfig singleton
pub const DEFAULT_CONFIG_NAME: &str = "kube-jit-config";

/// Suffix appended to the JitRequest name to form role binding names
pub const ROLE_BINDING_SUFFIX: &str = "-jit";

/// Field manager used for all server-side writes
pub const FIELD_MANAGER: &str = "kube-jit";

/// Name of the JitRequest materialized for an API ticket
pub fn jit_request_name(ticket_id: u64) -> String {
    format!("jit-{}", ticket_id)
}

/// Name of the role binding created for a JitRequest
pub fn role_binding_name(jit_request_name: &str) -> String {
    format!("{}{}", jit_request_name, ROLE_BINDING_SUFFIX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_follow_ticket_convention() {
        assert_eq!(jit_request_name(1), "jit-1");
        assert_eq!(role_binding_name(&jit_request_name(42)), "jit-42-jit");
    }
}
