//! KubeJitConfig: per-cluster policy for the request reconciler

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Specification for the KubeJitConfig singleton
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "jit.kubejit.io",
    version = "v1",
    kind = "KubeJitConfig",
    plural = "kubejitconfigs",
    shortname = "kjitcfg",
    printcolumn = r#"{"name":"Regex","type":"string","jsonPath":".spec.namespaceAllowedRegex"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct KubeJitConfigSpec {
    /// ClusterRoles a JitRequest may reference
    #[serde(default)]
    pub allowed_cluster_roles: Vec<String>,

    /// Regex every requested namespace must match
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace_allowed_regex: Option<String>,
}
