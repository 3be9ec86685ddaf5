//! Kubernetes Event recording for kube-jit controllers.
//!
//! Wraps `kube::runtime::events::Recorder` behind a trait so reconcilers can
//! surface grants, revocations, and callback trouble via `kubectl describe`.
//!
//! Events are fire-and-forget: failures are logged as warnings and never
//! propagate errors.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::ObjectReference;
use kube::runtime::events::{EventType, Recorder, Reporter};
use kube::Client;
use tracing::warn;

/// Trait for publishing Kubernetes Events.
#[async_trait]
pub trait EventPublisher: Send + Sync {
    /// Publish a Kubernetes Event on the given resource.
    ///
    /// # Arguments
    ///
    /// * `resource_ref` - The Kubernetes object this event is about
    /// * `type_` - Normal or Warning
    /// * `reason` - Machine-readable reason string (e.g. "AccessGranted")
    /// * `action` - What action was taken (e.g. "Grant")
    /// * `note` - Optional human-readable message
    async fn publish(
        &self,
        resource_ref: &ObjectReference,
        type_: EventType,
        reason: &str,
        action: &str,
        note: Option<String>,
    );
}

/// Production implementation wrapping `kube::runtime::events::Recorder`.
pub struct KubeEventPublisher {
    recorder: Recorder,
}

impl KubeEventPublisher {
    /// Create a new publisher reporting as `controller_name`.
    pub fn new(client: Client, controller_name: &str) -> Self {
        let reporter = Reporter {
            controller: controller_name.to_string(),
            instance: std::env::var("POD_NAME").ok(),
        };
        Self {
            recorder: Recorder::new(client, reporter),
        }
    }
}

#[async_trait]
impl EventPublisher for KubeEventPublisher {
    async fn publish(
        &self,
        resource_ref: &ObjectReference,
        type_: EventType,
        reason: &str,
        action: &str,
        note: Option<String>,
    ) {
        let event = kube::runtime::events::Event {
            type_,
            reason: reason.to_string(),
            note,
            action: action.to_string(),
            secondary: None,
        };
        if let Err(e) = self.recorder.publish(&event, resource_ref).await {
            warn!(
                reason,
                action,
                error = %e,
                "Failed to publish Kubernetes event"
            );
        }
    }
}

/// No-op implementation for tests.
pub struct NoopEventPublisher;

#[async_trait]
impl EventPublisher for NoopEventPublisher {
    async fn publish(
        &self,
        _resource_ref: &ObjectReference,
        _type_: EventType,
        _reason: &str,
        _action: &str,
        _note: Option<String>,
    ) {
    }
}

/// Well-known event reason strings.
pub mod reasons {
    /// JitRequest failed validation and was rejected
    pub const VALIDATION_FAILED: &str = "ValidationFailed";
    /// Role bindings were created for the requested window
    pub const ACCESS_GRANTED: &str = "AccessGranted";
    /// Role bindings were removed at the end of the window
    pub const ACCESS_REVOKED: &str = "AccessRevoked";
    /// The API callback could not be delivered
    pub const CALLBACK_FAILED: &str = "CallbackFailed";
    /// The JitGroupCache was rebuilt from adopted namespaces
    pub const GROUP_CACHE_UPDATED: &str = "GroupCacheUpdated";
    /// KubeJitConfig was rejected
    pub const CONFIG_INVALID: &str = "ConfigInvalid";
}

/// Well-known event action strings.
pub mod actions {
    /// Validation of a JitRequest
    pub const VALIDATE: &str = "Validate";
    /// Creating role bindings
    pub const GRANT: &str = "Grant";
    /// Deleting role bindings
    pub const REVOKE: &str = "Revoke";
    /// Posting status back to the API
    pub const CALLBACK: &str = "Callback";
    /// Generic reconciliation
    pub const RECONCILE: &str = "Reconcile";
}
