//! Custom Resource Definitions for kube-jit
//!
//! All kinds are cluster-scoped under `jit.kubejit.io/v1`.

mod config;
mod group_cache;
mod jit_request;

pub use config::{KubeJitConfig, KubeJitConfigSpec};
pub use group_cache::{GroupEntry, JitGroupCache, JitGroupCacheSpec};
pub use jit_request::{JitRequest, JitRequestSpec, JitRequestState, JitRequestStatus};

use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use kube::CustomResourceExt;

/// All CRDs owned by kube-jit, in install order
pub fn all_crds() -> Vec<CustomResourceDefinition> {
    vec![JitRequest::crd(), JitGroupCache::crd(), KubeJitConfig::crd()]
}
