//! Access request workflow
//!
//! [`AccessService`] owns the request state machine: submission, per-namespace
//! approvals, materialization of fully approved requests as `JitRequest`
//! objects, operator callbacks and the expiry sweep. Persistence, target
//! clusters, callback signing and notifications are injected.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use kube_jit_common::clock::SharedClock;
use kube_jit_common::crd::{JitRequest, JitRequestSpec, JitRequestState};
use kube_jit_common::retry::{retry_with_backoff_if, RetryConfig};
use kube_jit_common::{jit_request_name, REQUEST_LABEL, TICKET_LABEL};
use serde::Serialize;
use tracing::{debug, info, instrument, warn};

use crate::clusters::{ClusterGateway, CreateOutcome};
use crate::error::{Error, Result};
use crate::groups::validate_namespaces;
use crate::model::{
    Actor, ApprovalRef, Decision, NamespaceApproval, RecordFilter, Request, RequestId,
    RequestRecord, RequestStatus, SubmitRequest,
};
use crate::notify::{spawn_notification, Notification, Notifier};
use crate::permissions::Approver;
use crate::signed_url::SharedSigner;
use crate::store::{RequestStore, StoreError};

/// What an ordinary approver's rejection does to the request
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum RejectionPolicy {
    /// Only the approver's rows flip back; the request stays `Requested`
    #[default]
    RowOnly,
    /// Any rejected row rejects the whole request
    WholeRequest,
}

impl std::str::FromStr for RejectionPolicy {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "row-only" => Ok(Self::RowOnly),
            "whole-request" => Ok(Self::WholeRequest),
            other => Err(format!(
                "unknown rejection policy '{}', expected row-only or whole-request",
                other
            )),
        }
    }
}

impl std::fmt::Display for RejectionPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::RowOnly => "row-only",
            Self::WholeRequest => "whole-request",
        })
    }
}

/// Tunables of the workflow
#[derive(Clone, Debug)]
pub struct ServiceSettings {
    /// ClusterRoles that may be requested; empty allows any
    pub allowed_roles: Vec<String>,
    /// Absolute URL of the callback route, before signing
    pub callback_base: String,
    /// Effect of ordinary rejections
    pub rejection_policy: RejectionPolicy,
    /// Backoff for JitRequest creation
    pub materialize_retry: RetryConfig,
}

/// Outcome of an approve/reject call
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DecisionReport {
    /// Rows that were written
    pub applied: Vec<ApprovalRef>,
    /// Rows or requests the actor could not act on
    pub skipped: Vec<ApprovalRef>,
    /// Requests promoted to `Approved` and materialized
    pub approved: Vec<RequestId>,
    /// Requests moved to `Rejected`
    pub rejected: Vec<RequestId>,
    /// Requests sent back to `Requested` after materialization failed
    pub demoted: Vec<RequestId>,
}

/// Whether a callback changed anything
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CallbackOutcome {
    /// First delivery of this status
    Applied,
    /// Status already recorded for this ticket
    Duplicate,
}

/// Result of the expiry sweep
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SweepReport {
    /// Never-approved requests removed
    pub deleted: Vec<RequestId>,
    /// Approved requests whose window closed without a success report
    pub expired: Vec<RequestId>,
}

enum Scope {
    All,
    Rows(Vec<String>),
}

/// Group approval references by request, keeping first-seen order.
/// A reference without a namespace widens its request to every row.
fn scopes(refs: &[ApprovalRef]) -> Vec<(RequestId, Scope)> {
    let mut out: Vec<(RequestId, Scope)> = Vec::new();
    for r in refs {
        let idx = match out.iter().position(|(id, _)| *id == r.id) {
            Some(i) => i,
            None => {
                out.push((r.id, Scope::Rows(Vec::new())));
                out.len() - 1
            }
        };
        match (&mut out[idx].1, &r.namespace) {
            (Scope::Rows(rows), Some(ns)) => {
                if !rows.contains(ns) {
                    rows.push(ns.clone());
                }
            }
            (scope, None) => *scope = Scope::All,
            (Scope::All, Some(_)) => {}
        }
    }
    out
}

fn dedup_preserving_order(items: Vec<String>) -> Vec<String> {
    let mut out: Vec<String> = Vec::with_capacity(items.len());
    for item in items {
        if !out.contains(&item) {
            out.push(item);
        }
    }
    out
}

/// The request workflow
pub struct AccessService {
    store: Arc<dyn RequestStore>,
    clusters: Arc<dyn ClusterGateway>,
    signer: SharedSigner,
    notifier: Arc<dyn Notifier>,
    clock: SharedClock,
    settings: ServiceSettings,
}

impl AccessService {
    /// Wire the workflow to its collaborators
    pub fn new(
        store: Arc<dyn RequestStore>,
        clusters: Arc<dyn ClusterGateway>,
        signer: SharedSigner,
        notifier: Arc<dyn Notifier>,
        clock: SharedClock,
        settings: ServiceSettings,
    ) -> Self {
        Self {
            store,
            clusters,
            signer,
            notifier,
            clock,
            settings,
        }
    }

    /// ClusterRoles offered to requesters
    pub fn allowed_roles(&self) -> &[String] {
        &self.settings.allowed_roles
    }

    /// Configured cluster names
    pub fn cluster_names(&self) -> Vec<String> {
        self.clusters.cluster_names()
    }

    /// Record a new request in `Requested` with one unapproved row per namespace.
    #[instrument(skip(self, actor, input), fields(user = %actor.id, cluster = %input.cluster_name))]
    pub async fn submit(&self, actor: &Actor, input: SubmitRequest) -> Result<RequestRecord> {
        let now = self.clock.now();

        if !self.clusters.has_cluster(&input.cluster_name) {
            return Err(Error::ClusterUnknown(input.cluster_name));
        }
        if !self.settings.allowed_roles.is_empty()
            && !self.settings.allowed_roles.contains(&input.role_name)
        {
            return Err(Error::BadRequest(format!(
                "role '{}' is not allowed",
                input.role_name
            )));
        }
        validate_window(input.start_date, input.end_date, now)?;

        let namespaces = dedup_preserving_order(input.namespaces);
        if namespaces.is_empty() {
            return Err(Error::BadRequest(
                "at least one namespace is required".to_string(),
            ));
        }
        let users = if input.users.is_empty() {
            vec![actor.email.clone()]
        } else {
            dedup_preserving_order(input.users)
        };

        let groups = self.clusters.groups_for(&input.cluster_name).await?;
        let mapping = validate_namespaces(&groups, &namespaces)?;

        let rows = namespaces
            .iter()
            .filter_map(|ns| mapping.get(ns).map(|g| (ns, g)))
            .map(|(ns, g)| NamespaceApproval {
                request_id: 0,
                namespace: ns.clone(),
                group_id: g.group_id.clone(),
                group_name: g.group_name.clone(),
                approved: false,
                approver_id: None,
                approver_name: None,
            })
            .collect();

        let record = RequestRecord {
            request: Request {
                id: 0,
                cluster_name: input.cluster_name,
                role_name: input.role_name,
                user_id: actor.id.clone(),
                username: actor.name.clone(),
                email: actor.email.clone(),
                users,
                namespaces,
                justification: input.justification,
                start_date: input.start_date,
                end_date: input.end_date,
                status: RequestStatus::Requested,
                approver_ids: Vec::new(),
                approver_names: Vec::new(),
                fully_approved: false,
                notes: String::new(),
                created_at: now,
                updated_at: now,
                deleted_at: None,
            },
            namespace_approvals: rows,
            applied_callbacks: Vec::new(),
        };

        let record = self.store.insert(record).await?;
        info!(request_id = record.request.id, "request submitted");
        spawn_notification(
            self.notifier.clone(),
            Notification::submitted(&record.request),
        );
        Ok(record)
    }

    /// Apply `decision` to the referenced requests or rows.
    ///
    /// Admins and platform approvers flip every row of each referenced
    /// request. Everyone else only flips rows whose frozen group id is in
    /// `approver`; other rows are skipped and reported.
    #[instrument(skip(self, actor, approver, refs), fields(actor = %actor.id))]
    pub async fn approve_or_reject(
        &self,
        actor: &Actor,
        approver: &Approver,
        decision: Decision,
        refs: &[ApprovalRef],
    ) -> Result<DecisionReport> {
        let mut report = DecisionReport::default();
        for (id, scope) in scopes(refs) {
            self.decide(actor, approver, decision, id, &scope, &mut report)
                .await?;
        }
        Ok(report)
    }

    async fn decide(
        &self,
        actor: &Actor,
        approver: &Approver,
        decision: Decision,
        id: RequestId,
        scope: &Scope,
        report: &mut DecisionReport,
    ) -> Result<()> {
        let approve = decision == Decision::Approved;
        let admin = approver.is_admin_or_platform();
        let policy = self.settings.rejection_policy;

        // An admin rejecting an approved request must take its JitRequest off
        // the cluster before the rejection is recorded.
        let revokes = admin && !approve;
        let mut revoked = false;

        let mut applied: Vec<String> = Vec::new();
        let mut skipped: Vec<String> = Vec::new();
        let mut previous = RequestStatus::Requested;

        let record = loop {
            if revokes && !revoked {
                if let Some(current) = self.store.get(id).await? {
                    if current.request.status == RequestStatus::Approved {
                        self.revoke(&current.request).await?;
                        revoked = true;
                    }
                }
            }

            let mut needs_revoke = false;
            let result = self
                .store
                .modify(id, &mut |record: &mut RequestRecord| {
                    applied.clear();
                    skipped.clear();
                    previous = record.request.status;

                    let open = if admin {
                        !previous.is_terminal()
                    } else {
                        previous == RequestStatus::Requested
                    };
                    if !open {
                        return Err(StoreError::Rejected(format!(
                            "request {} is {}",
                            id, previous
                        )));
                    }
                    if revokes && previous == RequestStatus::Approved && !revoked {
                        needs_revoke = true;
                        return Err(StoreError::Rejected(format!(
                            "request {} was approved concurrently",
                            id
                        )));
                    }

                    for row in record.namespace_approvals.iter_mut() {
                        let targeted = admin
                            || match scope {
                                Scope::All => true,
                                Scope::Rows(rows) => rows.contains(&row.namespace),
                            };
                        if !targeted {
                            continue;
                        }
                        if !approver.holds(&row.group_id) {
                            skipped.push(row.namespace.clone());
                            continue;
                        }
                        row.approved = approve;
                        row.approver_id = Some(actor.id.clone());
                        row.approver_name = Some(actor.name.clone());
                        applied.push(row.namespace.clone());
                    }
                    if let Scope::Rows(rows) = scope {
                        for ns in rows {
                            if !applied.contains(ns) && !skipped.contains(ns) {
                                skipped.push(ns.clone());
                            }
                        }
                    }

                    if applied.is_empty() {
                        return Ok(());
                    }
                    record.request.add_approver(actor);
                    if approve && record.all_rows_approved() {
                        record.request.status = RequestStatus::Approved;
                    } else if !approve && (admin || policy == RejectionPolicy::WholeRequest) {
                        record.request.status = RequestStatus::Rejected;
                    }
                    Ok(())
                })
                .await;

            match result {
                Ok(record) => break record,
                Err(StoreError::Rejected(_)) if needs_revoke => {
                    debug!(request_id = id, "request approved while rejecting, revoking first");
                }
                Err(StoreError::NotFound(_)) => {
                    warn!(request_id = id, "approval references unknown request");
                    report.skipped.push(ApprovalRef { id, namespace: None });
                    return Ok(());
                }
                Err(StoreError::Rejected(reason)) => {
                    info!(request_id = id, %reason, "decision not applicable");
                    report.skipped.push(ApprovalRef { id, namespace: None });
                    return Ok(());
                }
                Err(e) => return Err(e.into()),
            }
        };

        for ns in &skipped {
            debug!(request_id = id, namespace = %ns, "actor does not hold the row's group, skipped");
        }
        let acted = !applied.is_empty();
        report.applied.extend(applied.into_iter().map(|ns| ApprovalRef {
            id,
            namespace: Some(ns),
        }));
        report.skipped.extend(skipped.into_iter().map(|ns| ApprovalRef {
            id,
            namespace: Some(ns),
        }));
        if !acted {
            return Ok(());
        }

        match record.request.status {
            RequestStatus::Approved if approve => self.complete(record, report).await?,
            RequestStatus::Rejected if previous != RequestStatus::Rejected => {
                info!(request_id = id, "request rejected");
                report.rejected.push(id);
                spawn_notification(
                    self.notifier.clone(),
                    Notification::status_changed(&record.request),
                );
            }
            _ => {}
        }
        Ok(())
    }

    /// Materialize an approved request, demoting it when creation keeps failing.
    async fn complete(&self, record: RequestRecord, report: &mut DecisionReport) -> Result<()> {
        let id = record.request.id;
        match self.materialize(&record.request).await {
            Ok(outcome) => {
                info!(request_id = id, ?outcome, "request approved and materialized");
                report.approved.push(id);
                spawn_notification(
                    self.notifier.clone(),
                    Notification::status_changed(&record.request),
                );
            }
            Err(e) => {
                warn!(request_id = id, error = %e, "materialization failed, demoting request");
                let note = format!(
                    "JitRequest creation on cluster '{}' failed: {}",
                    record.request.cluster_name, e
                );
                self.store
                    .modify(id, &mut |r: &mut RequestRecord| {
                        if r.request.status == RequestStatus::Approved {
                            r.request.status = RequestStatus::Requested;
                            r.request.notes = note.clone();
                        }
                        Ok(())
                    })
                    .await?;
                report.demoted.push(id);
            }
        }
        Ok(())
    }

    /// The JitRequest object mirroring `request`
    pub fn jit_request(&self, request: &Request) -> Result<JitRequest> {
        let name = jit_request_name(request.id);
        let base = format!("{}?ticketID={}", self.settings.callback_base, request.id);
        let callback_url = self
            .signer
            .sign(&base, request.end_date)
            .map_err(|e| Error::Internal(format!("signing callback url: {}", e)))?;

        let mut jit = JitRequest::new(
            &name,
            JitRequestSpec {
                user_emails: request.users.clone(),
                cluster_role: request.role_name.clone(),
                namespaces: request.namespaces.clone(),
                justification: request.justification.clone(),
                requestor_name: request.username.clone(),
                requestor_email: request.email.clone(),
                approver_name: request.approver_names.join(", "),
                callback_url,
                start_time: request.start_date,
                end_time: request.end_date,
                ticket_id: request.id.to_string(),
            },
        );
        jit.metadata.labels = Some(BTreeMap::from([
            (REQUEST_LABEL.to_string(), name),
            (TICKET_LABEL.to_string(), request.id.to_string()),
        ]));
        Ok(jit)
    }

    /// Create the JitRequest on the request's cluster, retrying transient failures.
    ///
    /// An existing object with the same name counts as success and is left as is.
    pub async fn materialize(&self, request: &Request) -> Result<CreateOutcome> {
        let jit = self.jit_request(request)?;
        let cluster = request.cluster_name.as_str();
        retry_with_backoff_if(
            &self.settings.materialize_retry,
            "create_jit_request",
            |e: &Error| e.is_retryable(),
            || self.clusters.create_jit_request(cluster, &jit),
        )
        .await
    }

    /// Delete the request's JitRequest, retrying transient failures.
    ///
    /// An object that is already gone counts as success.
    async fn revoke(&self, request: &Request) -> Result<()> {
        let name = jit_request_name(request.id);
        let cluster = request.cluster_name.as_str();
        retry_with_backoff_if(
            &self.settings.materialize_retry,
            "delete_jit_request",
            |e: &Error| e.is_retryable(),
            || self.clusters.delete_jit_request(cluster, &name),
        )
        .await
        .map_err(|e| {
            warn!(request_id = request.id, error = %e, "could not revoke JitRequest, rejection not applied");
            e
        })?;
        info!(request_id = request.id, jit_request = %name, "JitRequest revoked");
        Ok(())
    }

    /// Apply a status report from the operator.
    ///
    /// `Pending` only records the message. A status already applied for this
    /// ticket is acknowledged without side effects. Requests that were
    /// rejected or expired on this side keep their status; a terminal report
    /// for them is refused with [`Error::Conflict`].
    #[instrument(skip(self, id, state, message), fields(ticket_id = id, status = %state))]
    pub async fn callback(
        &self,
        id: RequestId,
        state: JitRequestState,
        message: &str,
    ) -> Result<CallbackOutcome> {
        let key = state.as_str();
        let mut duplicate = false;
        let mut refused = false;
        let mut previous = RequestStatus::Requested;

        let record = self
            .store
            .modify(id, &mut |record: &mut RequestRecord| {
                previous = record.request.status;
                duplicate = record.applied_callbacks.iter().any(|k| k == key);
                if duplicate {
                    return Ok(());
                }
                refused = state != JitRequestState::Pending
                    && matches!(previous, RequestStatus::Rejected | RequestStatus::Expired);
                if refused {
                    return Err(StoreError::Rejected(format!(
                        "request {} is already {}",
                        id, previous
                    )));
                }
                record.applied_callbacks.push(key.to_string());
                record.request.notes = message.to_string();
                match state {
                    JitRequestState::Pending => {}
                    JitRequestState::Succeeded => record.request.status = RequestStatus::Succeeded,
                    JitRequestState::Rejected => record.request.status = RequestStatus::Rejected,
                }
                Ok(())
            })
            .await
            .map_err(|e| match e {
                StoreError::NotFound(id) => Error::NotFound(format!("request {}", id)),
                StoreError::Rejected(reason) if refused => {
                    warn!(%reason, "refusing callback for a closed request");
                    Error::Conflict(reason)
                }
                other => other.into(),
            })?;

        if duplicate {
            debug!("callback already applied");
            return Ok(CallbackOutcome::Duplicate);
        }
        info!(status = %record.request.status, "callback applied");
        if record.request.status != previous {
            spawn_notification(
                self.notifier.clone(),
                Notification::status_changed(&record.request),
            );
        }
        Ok(CallbackOutcome::Applied)
    }

    /// Delete never-approved requests past their end and expire approved ones.
    #[instrument(skip(self))]
    pub async fn clean_expired(&self) -> Result<SweepReport> {
        let now = self.clock.now();
        let deleted = self.store.delete_expired(now).await?;

        let approved = self
            .store
            .list(&RecordFilter {
                status: Some(RequestStatus::Approved),
                ..Default::default()
            })
            .await?;
        let mut expired = Vec::new();
        for record in approved.iter().filter(|r| r.request.end_date < now) {
            let updated = self
                .store
                .modify(record.request.id, &mut |r: &mut RequestRecord| {
                    if r.request.status == RequestStatus::Approved {
                        r.request.status = RequestStatus::Expired;
                    }
                    Ok(())
                })
                .await?;
            if updated.request.status == RequestStatus::Expired {
                expired.push(updated.request.id);
            }
        }

        info!(deleted = deleted.len(), expired = expired.len(), "expiry sweep finished");
        Ok(SweepReport { deleted, expired })
    }

    /// Request history visible to the viewer.
    ///
    /// Admins and platform approvers see everything. Others see their own
    /// requests and requests with a row for a group they hold.
    pub async fn records(
        &self,
        viewer: &Actor,
        approver: &Approver,
        filter: RecordFilter,
    ) -> Result<Vec<RequestRecord>> {
        if approver.is_admin_or_platform() {
            return Ok(self.store.list(&filter).await?);
        }
        let limit = filter.limit;
        let unbounded = RecordFilter {
            limit: None,
            ..filter
        };
        let visible = self
            .store
            .list(&unbounded)
            .await?
            .into_iter()
            .filter(|r| {
                r.request.user_id == viewer.id
                    || r.namespace_approvals
                        .iter()
                        .any(|row| approver.holds(&row.group_id))
            });
        Ok(match limit {
            Some(n) => visible.take(n).collect(),
            None => visible.collect(),
        })
    }

    /// Requests awaiting the viewer's decision.
    ///
    /// Ordinary approvers get only the unapproved rows they hold.
    pub async fn pending_approvals(&self, approver: &Approver) -> Result<Vec<RequestRecord>> {
        let requested = self
            .store
            .list(&RecordFilter {
                status: Some(RequestStatus::Requested),
                ..Default::default()
            })
            .await?;
        if approver.is_admin_or_platform() {
            return Ok(requested);
        }
        Ok(requested
            .into_iter()
            .filter_map(|mut record| {
                record
                    .namespace_approvals
                    .retain(|row| !row.approved && approver.holds(&row.group_id));
                (!record.namespace_approvals.is_empty()).then_some(record)
            })
            .collect())
    }
}

fn validate_window(start: DateTime<Utc>, end: DateTime<Utc>, now: DateTime<Utc>) -> Result<()> {
    if start >= end {
        return Err(Error::BadRequest(
            "startDate must be before endDate".to_string(),
        ));
    }
    if end <= now {
        return Err(Error::BadRequest("endDate must be in the future".to_string()));
    }
    if start < now {
        return Err(Error::BadRequest(
            "startDate must not be in the past".to_string(),
        ));
    }
    Ok(())
}
