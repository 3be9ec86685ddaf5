//! JitRequest reconciler
//!
//! A JitRequest moves through
//!
//! ```text
//! (new) ──validate──► Pending ──startTime──► Succeeded ──endTime──► deleted
//!   │                    │
//!   └────────────────────┴──► Rejected ──callback──► deleted
//! ```
//!
//! Timed transitions are requeues computed from the object's own window, so
//! a restarted operator picks up where it left off. Every state is reported
//! to the API exactly once through the signed callback URL; undelivered
//! reports are retried on later reconciles until the window closes.

mod client;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use k8s_openapi::api::rbac::v1::{RoleBinding, RoleRef, Subject};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::runtime::controller::Action;
use kube::runtime::events::EventType;
use kube::{Client, Resource, ResourceExt};
use kube_jit_common::clock::{system_clock, until, SharedClock};
use kube_jit_common::crd::{JitRequest, JitRequestSpec, JitRequestState, JitRequestStatus};
use kube_jit_common::events::{actions, reasons, EventPublisher, KubeEventPublisher};
use kube_jit_common::{role_binding_name, EXPIRES_AT_ANNOTATION, REQUEST_LABEL, TICKET_LABEL};
use tracing::{debug, error, info, instrument, warn};

use crate::callback::{CallbackClient, CallbackPayload};
use crate::config::{ConfigCache, ValidatedConfig};
use crate::error::{ReconcileError, Result};
use crate::CONTROLLER_NAME;

pub use client::{JitKube, JitKubeImpl};
#[cfg(test)]
pub use client::MockJitKube;

/// Delay before retrying a new request when no KubeJitConfig is loaded
pub const CONFIG_WAIT: Duration = Duration::from_secs(30);

/// Upper bound on the requeue delay while a callback is owed
pub const CALLBACK_RETRY_INTERVAL: Duration = Duration::from_secs(30);

const RBAC_API_GROUP: &str = "rbac.authorization.k8s.io";

/// Controller context for the JitRequest reconciler
///
/// Use [`ContextBuilder`] to construct instances:
///
/// ```text
/// let ctx = Context::builder(client, config, callbacks).build();
/// ```
pub struct Context {
    /// Kubernetes operations (trait object for testability)
    pub kube: Arc<dyn JitKube>,
    /// Delivers status callbacks to the API
    pub callbacks: Arc<dyn CallbackClient>,
    /// Event sink
    pub events: Arc<dyn EventPublisher>,
    /// Policy published by the KubeJitConfig reconciler
    pub config: Arc<ConfigCache>,
    /// Time source
    pub clock: SharedClock,
}

impl Context {
    /// Create a builder for constructing a Context
    pub fn builder(
        client: Client,
        config: Arc<ConfigCache>,
        callbacks: Arc<dyn CallbackClient>,
    ) -> ContextBuilder {
        ContextBuilder {
            client,
            config,
            callbacks,
            kube: None,
            events: None,
            clock: None,
        }
    }

    /// Create a context for testing with custom mock clients
    #[cfg(test)]
    pub fn for_testing(
        kube: Arc<dyn JitKube>,
        callbacks: Arc<dyn CallbackClient>,
        config: Arc<ConfigCache>,
        clock: SharedClock,
    ) -> Self {
        Self {
            kube,
            callbacks,
            events: Arc::new(kube_jit_common::events::NoopEventPublisher),
            config,
            clock,
        }
    }
}

/// Builder for [`Context`]
pub struct ContextBuilder {
    client: Client,
    config: Arc<ConfigCache>,
    callbacks: Arc<dyn CallbackClient>,
    kube: Option<Arc<dyn JitKube>>,
    events: Option<Arc<dyn EventPublisher>>,
    clock: Option<SharedClock>,
}

impl ContextBuilder {
    /// Override the Kubernetes operations
    pub fn kube_client(mut self, kube: Arc<dyn JitKube>) -> Self {
        self.kube = Some(kube);
        self
    }

    /// Override the event sink
    pub fn events(mut self, events: Arc<dyn EventPublisher>) -> Self {
        self.events = Some(events);
        self
    }

    /// Override the time source
    pub fn clock(mut self, clock: SharedClock) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Build the Context
    pub fn build(self) -> Context {
        Context {
            kube: self
                .kube
                .unwrap_or_else(|| Arc::new(JitKubeImpl::new(self.client.clone()))),
            callbacks: self.callbacks,
            events: self.events.unwrap_or_else(|| {
                Arc::new(KubeEventPublisher::new(self.client.clone(), CONTROLLER_NAME))
            }),
            config: self.config,
            clock: self.clock.unwrap_or_else(system_clock),
        }
    }
}

/// Reconcile a JitRequest
///
/// Advances the state machine by at most one transition, reports the
/// resulting state to the API if it has not been reported yet, then decides
/// when to look at the object again.
#[instrument(skip(jit, ctx), fields(jit_request = %jit.name_any(), ticket_id = %jit.spec.ticket_id))]
pub async fn reconcile(jit: Arc<JitRequest>, ctx: Arc<Context>) -> Result<Action> {
    let now = ctx.clock.now();
    let mut status = jit.status.clone().unwrap_or_default();

    match status.state {
        None => {
            let Some(config) = ctx.config.current() else {
                warn!("No KubeJitConfig loaded yet, deferring validation");
                return Ok(Action::requeue(CONFIG_WAIT));
            };
            admit(&jit, &ctx, &config, &mut status, now).await?;
        }
        Some(JitRequestState::Pending) if jit.spec.start_time <= now => {
            grant(&jit, &ctx, &mut status, now).await?;
        }
        _ => {}
    }

    let callback_owed = report(&jit, &ctx, &mut status).await?;
    next_step(&jit, &ctx, &status, callback_owed, now).await
}

/// Requeue after a failed reconcile
pub fn error_policy(jit: Arc<JitRequest>, error: &ReconcileError, _ctx: Arc<Context>) -> Action {
    error!(
        ?error,
        jit_request = %jit.name_any(),
        retryable = error.is_retryable(),
        "JitRequest reconciliation failed"
    );
    Action::requeue(Duration::from_secs(5))
}

/// Checks that need nothing but the spec and the policy.
///
/// Returns the rejection message, or `None` when the request passes.
pub fn check_policy(spec: &JitRequestSpec, config: &ValidatedConfig) -> Option<String> {
    if !config.role_allowed(&spec.cluster_role) {
        return Some(format!("ClusterRole '{}' is not allowed", spec.cluster_role));
    }
    if spec.namespaces.is_empty() {
        return Some("no namespaces requested".to_string());
    }
    if spec.user_emails.is_empty() {
        return Some("no users to bind".to_string());
    }
    if spec.end_time <= spec.start_time {
        return Some(format!(
            "end time {} is not after start time {}",
            spec.end_time.to_rfc3339(),
            spec.start_time.to_rfc3339()
        ));
    }
    spec.namespaces
        .iter()
        .find(|ns| !config.namespace_allowed(ns))
        .map(|ns| {
            format!(
                "namespace '{}' does not match the allowed pattern '{}'",
                ns,
                config.namespace_pattern().unwrap_or_default()
            )
        })
}

/// Build the role binding granting `jit` in `namespace`.
///
/// The binding is owned by the JitRequest so garbage collection removes it
/// with the request.
pub fn role_binding_for(jit: &JitRequest, namespace: &str) -> Result<RoleBinding> {
    let name = jit.name_any();
    let owner = jit
        .controller_owner_ref(&())
        .ok_or_else(|| ReconcileError::MissingMetadata {
            kind: "JitRequest",
            name: name.clone(),
            field: "metadata.uid",
        })?;

    Ok(RoleBinding {
        metadata: ObjectMeta {
            name: Some(role_binding_name(&name)),
            namespace: Some(namespace.to_string()),
            labels: Some(BTreeMap::from([
                (REQUEST_LABEL.to_string(), name),
                (TICKET_LABEL.to_string(), jit.spec.ticket_id.clone()),
            ])),
            annotations: Some(BTreeMap::from([(
                EXPIRES_AT_ANNOTATION.to_string(),
                jit.spec.end_time.to_rfc3339(),
            )])),
            owner_references: Some(vec![owner]),
            ..Default::default()
        },
        role_ref: RoleRef {
            api_group: RBAC_API_GROUP.to_string(),
            kind: "ClusterRole".to_string(),
            name: jit.spec.cluster_role.clone(),
        },
        subjects: Some(
            jit.spec
                .user_emails
                .iter()
                .map(|email| Subject {
                    api_group: Some(RBAC_API_GROUP.to_string()),
                    kind: "User".to_string(),
                    name: email.clone(),
                    namespace: None,
                })
                .collect(),
        ),
    })
}

/// Validate a new request and move it to Pending or Rejected.
async fn admit(
    jit: &JitRequest,
    ctx: &Context,
    config: &ValidatedConfig,
    status: &mut JitRequestStatus,
    now: DateTime<Utc>,
) -> Result<()> {
    let rejection = match check_policy(&jit.spec, config) {
        Some(reason) => Some(reason),
        None => match missing_namespace(jit, ctx).await? {
            Some(ns) => Some(format!("namespace '{}' does not exist", ns)),
            None if jit.spec.start_time <= now => Some(format!(
                "start time {} is not in the future",
                jit.spec.start_time.to_rfc3339()
            )),
            None => None,
        },
    };

    status.start_time = Some(jit.spec.start_time);
    status.end_time = Some(jit.spec.end_time);
    match rejection {
        Some(reason) => {
            warn!(%reason, "JitRequest failed validation");
            publish(
                ctx,
                jit,
                EventType::Warning,
                reasons::VALIDATION_FAILED,
                actions::VALIDATE,
                &reason,
            )
            .await;
            status.state = Some(JitRequestState::Rejected);
            status.message = Some(reason);
        }
        None => {
            info!(start = %jit.spec.start_time, "JitRequest accepted, waiting for start time");
            status.state = Some(JitRequestState::Pending);
            status.message = Some(format!(
                "access to {} scheduled from {} until {}",
                jit.spec.namespaces.join(", "),
                jit.spec.start_time.to_rfc3339(),
                jit.spec.end_time.to_rfc3339()
            ));
        }
    }
    ctx.kube.patch_status(&jit.name_any(), status).await?;
    Ok(())
}

async fn missing_namespace(jit: &JitRequest, ctx: &Context) -> Result<Option<String>> {
    for namespace in &jit.spec.namespaces {
        if !ctx.kube.namespace_exists(namespace).await? {
            return Ok(Some(namespace.clone()));
        }
    }
    Ok(None)
}

/// Create the role bindings for a Pending request whose window has opened.
async fn grant(
    jit: &JitRequest,
    ctx: &Context,
    status: &mut JitRequestStatus,
    now: DateTime<Utc>,
) -> Result<()> {
    if jit.spec.end_time <= now {
        let reason = format!(
            "access window ended at {} before access could be granted",
            jit.spec.end_time.to_rfc3339()
        );
        warn!(%reason, "Skipping grant");
        publish(
            ctx,
            jit,
            EventType::Warning,
            reasons::VALIDATION_FAILED,
            actions::GRANT,
            &reason,
        )
        .await;
        status.state = Some(JitRequestState::Rejected);
        status.message = Some(reason);
        ctx.kube.patch_status(&jit.name_any(), status).await?;
        return Ok(());
    }

    for namespace in &jit.spec.namespaces {
        let binding = role_binding_for(jit, namespace)?;
        ctx.kube.create_role_binding(&binding).await?;
    }

    let message = format!(
        "ClusterRole '{}' bound in {} until {}",
        jit.spec.cluster_role,
        jit.spec.namespaces.join(", "),
        jit.spec.end_time.to_rfc3339()
    );
    info!(namespaces = ?jit.spec.namespaces, "Access granted");
    publish(
        ctx,
        jit,
        EventType::Normal,
        reasons::ACCESS_GRANTED,
        actions::GRANT,
        &message,
    )
    .await;
    status.state = Some(JitRequestState::Succeeded);
    status.message = Some(message);
    ctx.kube.patch_status(&jit.name_any(), status).await?;
    Ok(())
}

/// Report the current state to the API if it has not been reported yet.
///
/// Returns true while a callback is still owed. A refused callback is not
/// retried: the signed URL will not become valid again.
async fn report(jit: &JitRequest, ctx: &Context, status: &mut JitRequestStatus) -> Result<bool> {
    let Some(state) = status.state else {
        return Ok(false);
    };
    if !status.needs_callback() {
        return Ok(false);
    }
    if jit.spec.callback_url.is_empty() {
        debug!("No callback URL, nothing to report");
        status.reported_state = Some(state);
        ctx.kube.patch_status(&jit.name_any(), status).await?;
        return Ok(false);
    }

    let payload = CallbackPayload {
        ticket_id: jit.spec.ticket_id.clone(),
        status: state,
        message: status.message.clone().unwrap_or_default(),
    };
    let owed = match ctx.callbacks.send(&jit.spec.callback_url, &payload).await {
        Ok(()) => {
            debug!(%state, "State reported to API");
            status.reported_state = Some(state);
            status.callback_overdue = false;
            status.callback_attempts = 0;
            false
        }
        Err(e) => {
            let retry = e.is_retryable();
            status.callback_overdue = true;
            status.callback_attempts += 1;
            if !retry {
                status.reported_state = Some(state);
            }
            warn!(
                error = %e,
                %state,
                attempts = status.callback_attempts,
                will_retry = retry,
                "Callback to API failed"
            );
            publish(
                ctx,
                jit,
                EventType::Warning,
                reasons::CALLBACK_FAILED,
                actions::CALLBACK,
                &format!("reporting {} failed: {}", state, e),
            )
            .await;
            retry
        }
    };
    ctx.kube.patch_status(&jit.name_any(), status).await?;
    Ok(owed)
}

/// Decide what happens after this reconcile.
async fn next_step(
    jit: &JitRequest,
    ctx: &Context,
    status: &JitRequestStatus,
    callback_owed: bool,
    now: DateTime<Utc>,
) -> Result<Action> {
    let end = jit.spec.end_time;
    let soon = |delay: Duration| {
        if callback_owed {
            delay.min(CALLBACK_RETRY_INTERVAL)
        } else {
            delay
        }
    };

    match status.state {
        Some(JitRequestState::Pending) => {
            Ok(Action::requeue(soon(until(now, jit.spec.start_time))))
        }
        Some(JitRequestState::Rejected) => {
            if callback_owed && now < end {
                return Ok(Action::requeue(soon(until(now, end))));
            }
            ctx.kube.delete_jit_request(&jit.name_any()).await?;
            info!("Rejected JitRequest removed");
            Ok(Action::await_change())
        }
        Some(JitRequestState::Succeeded) | None => {
            if now < end {
                return Ok(Action::requeue(soon(until(now, end))));
            }
            revoke(jit, ctx).await
        }
    }
}

/// Remove the grant and the JitRequest once the window has closed.
async fn revoke(jit: &JitRequest, ctx: &Context) -> Result<Action> {
    let name = jit.name_any();
    let uid = jit.uid().ok_or_else(|| ReconcileError::MissingMetadata {
        kind: "JitRequest",
        name: name.clone(),
        field: "metadata.uid",
    })?;

    let removed = ctx.kube.delete_owned_role_bindings(&name, &uid).await?;
    info!(removed, "Access window ended, revoking");
    publish(
        ctx,
        jit,
        EventType::Normal,
        reasons::ACCESS_REVOKED,
        actions::REVOKE,
        &format!("access window ended, removed {} role binding(s)", removed),
    )
    .await;
    ctx.kube.delete_jit_request(&name).await?;
    Ok(Action::await_change())
}

async fn publish(
    ctx: &Context,
    jit: &JitRequest,
    type_: EventType,
    reason: &str,
    action: &str,
    note: &str,
) {
    ctx.events
        .publish(&jit.object_ref(&()), type_, reason, action, Some(note.to_string()))
        .await;
}
