//! Kubernetes operations used by the JitRequest reconciler

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Namespace;
use k8s_openapi::api::rbac::v1::RoleBinding;
use kube::api::{Api, DeleteParams, ListParams, Patch, PatchParams, PostParams};
use kube::{Client, ResourceExt};
use kube_jit_common::crd::{JitRequest, JitRequestStatus};
use kube_jit_common::kube_utils::{is_already_exists, is_not_found};
use kube_jit_common::{Error, REQUEST_LABEL};
use tracing::{debug, info};

#[cfg(test)]
use mockall::automock;

/// Trait abstracting Kubernetes client operations for JitRequest
///
/// This trait allows mocking the Kubernetes client in tests while using
/// the real client in production.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait JitKube: Send + Sync {
    /// Merge `status` into a JitRequest's status subresource
    async fn patch_status(&self, name: &str, status: &JitRequestStatus) -> Result<(), Error>;

    /// Whether a namespace exists
    async fn namespace_exists(&self, name: &str) -> Result<bool, Error>;

    /// Create a role binding. An existing binding with the same name counts as success.
    async fn create_role_binding(&self, binding: &RoleBinding) -> Result<(), Error>;

    /// Delete every role binding labelled for `request` whose owner uid is `uid`.
    ///
    /// Returns the number of bindings deleted.
    async fn delete_owned_role_bindings(&self, request: &str, uid: &str) -> Result<usize, Error>;

    /// Delete a JitRequest. A missing object counts as success.
    async fn delete_jit_request(&self, name: &str) -> Result<(), Error>;
}

/// Real Kubernetes client implementation
pub struct JitKubeImpl {
    client: Client,
}

impl JitKubeImpl {
    /// Create a new JitKubeImpl wrapping the given kube Client
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

/// Parameters and body of a status merge patch.
///
/// A merge patch carries no resourceVersion, so it cannot conflict.
fn status_patch(status: &JitRequestStatus) -> (PatchParams, serde_json::Value) {
    (PatchParams::default(), serde_json::json!({ "status": status }))
}

#[async_trait]
impl JitKube for JitKubeImpl {
    async fn patch_status(&self, name: &str, status: &JitRequestStatus) -> Result<(), Error> {
        let api: Api<JitRequest> = Api::all(self.client.clone());
        let (params, patch) = status_patch(status);
        api.patch_status(name, &params, &Patch::Merge(&patch)).await?;
        Ok(())
    }

    async fn namespace_exists(&self, name: &str) -> Result<bool, Error> {
        let api: Api<Namespace> = Api::all(self.client.clone());
        Ok(api.get_opt(name).await?.is_some())
    }

    async fn create_role_binding(&self, binding: &RoleBinding) -> Result<(), Error> {
        let namespace = binding
            .namespace()
            .ok_or_else(|| Error::validation("role binding has no namespace"))?;
        let api: Api<RoleBinding> = Api::namespaced(self.client.clone(), &namespace);
        match api.create(&PostParams::default(), binding).await {
            Ok(_) => {
                info!(binding = %binding.name_any(), %namespace, "RoleBinding created");
                Ok(())
            }
            Err(e) if is_already_exists(&e) => {
                debug!(binding = %binding.name_any(), %namespace, "RoleBinding already exists");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn delete_owned_role_bindings(&self, request: &str, uid: &str) -> Result<usize, Error> {
        let api: Api<RoleBinding> = Api::all(self.client.clone());
        let selector = format!("{}={}", REQUEST_LABEL, request);
        let bindings = api.list(&ListParams::default().labels(&selector)).await?;

        let mut deleted = 0;
        for binding in bindings.items {
            let owned = binding
                .owner_references()
                .iter()
                .any(|owner| owner.uid == uid);
            let Some(namespace) = binding.namespace().filter(|_| owned) else {
                continue;
            };
            let namespaced: Api<RoleBinding> = Api::namespaced(self.client.clone(), &namespace);
            match namespaced
                .delete(&binding.name_any(), &DeleteParams::default())
                .await
            {
                Ok(_) => deleted += 1,
                Err(e) if is_not_found(&e) => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(deleted)
    }

    async fn delete_jit_request(&self, name: &str) -> Result<(), Error> {
        let api: Api<JitRequest> = Api::all(self.client.clone());
        match api.delete(name, &DeleteParams::background()).await {
            Ok(_) => Ok(()),
            Err(e) if is_not_found(&e) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
