//! JitGroupCache: adopted namespaces and the directory groups that approve them

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// One adopted namespace
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct GroupEntry {
    /// Directory group id allowed to approve access
    #[serde(rename = "groupID")]
    pub group_id: String,
    /// Namespace name
    pub namespace: String,
    /// Directory group display name
    #[serde(rename = "groupName")]
    pub group_name: String,
}

/// Specification for the JitGroupCache singleton
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "jit.kubejit.io",
    version = "v1",
    kind = "JitGroupCache",
    plural = "jitgroupcaches",
    shortname = "kjitcache"
)]
#[serde(rename_all = "camelCase")]
pub struct JitGroupCacheSpec {
    /// Adopted namespaces, sorted by namespace
    #[serde(default)]
    pub groups: Vec<GroupEntry>,
}
