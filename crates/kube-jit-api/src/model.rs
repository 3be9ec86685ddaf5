//! Request and approval records

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Stable request identifier
pub type RequestId = u64;

/// Request lifecycle state
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RequestStatus {
    /// Waiting for approvals
    Requested,
    /// Every namespace approved; JitRequest handed to the cluster
    Approved,
    /// Refused by an approver or by the cluster
    Rejected,
    /// Role bindings are in place
    Succeeded,
    /// Window passed without completion
    Expired,
}

impl RequestStatus {
    /// Whether no further transitions are expected
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Rejected | Self::Succeeded | Self::Expired)
    }
}

impl std::fmt::Display for RequestStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Requested => "Requested",
            Self::Approved => "Approved",
            Self::Rejected => "Rejected",
            Self::Succeeded => "Succeeded",
            Self::Expired => "Expired",
        };
        f.write_str(s)
    }
}

impl std::str::FromStr for RequestStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Requested" => Ok(Self::Requested),
            "Approved" => Ok(Self::Approved),
            "Rejected" => Ok(Self::Rejected),
            "Succeeded" => Ok(Self::Succeeded),
            "Expired" => Ok(Self::Expired),
            other => Err(format!("unknown status '{}'", other)),
        }
    }
}

/// An access request
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Request {
    /// Monotonic id assigned by the store
    pub id: RequestId,
    /// Target cluster
    pub cluster_name: String,
    /// Requested ClusterRole
    pub role_name: String,
    /// Requester id
    #[serde(rename = "userID")]
    pub user_id: String,
    /// Requester display name
    pub username: String,
    /// Requester e-mail
    pub email: String,
    /// Principals to bind
    pub users: Vec<String>,
    /// Namespaces in submission order
    pub namespaces: Vec<String>,
    /// Reason given by the requester
    pub justification: String,
    /// Start of the access window
    pub start_date: DateTime<Utc>,
    /// End of the access window
    pub end_date: DateTime<Utc>,
    /// Lifecycle state
    pub status: RequestStatus,
    /// Ids of everyone who approved or rejected, first occurrence order
    #[serde(rename = "approverIDs")]
    pub approver_ids: Vec<String>,
    /// Names matching `approver_ids`
    pub approver_names: Vec<String>,
    /// Every namespace row approved
    pub fully_approved: bool,
    /// Free-form notes written by callbacks
    pub notes: String,
    /// Creation instant
    pub created_at: DateTime<Utc>,
    /// Last modification instant
    pub updated_at: DateTime<Utc>,
    /// Soft-deletion instant
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deleted_at: Option<DateTime<Utc>>,
}

impl Request {
    /// Record `actor` as an approver, keeping set semantics
    pub fn add_approver(&mut self, actor: &Actor) {
        if !self.approver_ids.contains(&actor.id) {
            self.approver_ids.push(actor.id.clone());
            self.approver_names.push(actor.name.clone());
        }
    }
}

/// Per-namespace approval row
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NamespaceApproval {
    /// Owning request
    #[serde(rename = "requestID")]
    pub request_id: RequestId,
    /// Namespace
    pub namespace: String,
    /// Group allowed to approve, frozen at submission
    #[serde(rename = "groupID")]
    pub group_id: String,
    /// Group name, frozen at submission
    pub group_name: String,
    /// Current decision
    pub approved: bool,
    /// Who last decided
    #[serde(rename = "approverID", default, skip_serializing_if = "Option::is_none")]
    pub approver_id: Option<String>,
    /// Name of who last decided
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub approver_name: Option<String>,
}

/// A request together with its approval rows
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestRecord {
    /// The request
    #[serde(flatten)]
    pub request: Request,
    /// One row per namespace, in submission order
    pub namespace_approvals: Vec<NamespaceApproval>,
    /// Callback statuses already applied, for idempotency
    #[serde(default, skip_serializing)]
    pub applied_callbacks: Vec<String>,
}

impl RequestRecord {
    /// Whether every namespace row is approved
    pub fn all_rows_approved(&self) -> bool {
        !self.namespace_approvals.is_empty() && self.namespace_approvals.iter().all(|r| r.approved)
    }

    /// Recompute `fully_approved` from the rows
    pub fn refresh_fully_approved(&mut self) {
        self.request.fully_approved = self.all_rows_approved();
    }

    /// Row for `namespace`
    #[cfg(test)]
    pub fn row_mut(&mut self, namespace: &str) -> Option<&mut NamespaceApproval> {
        self.namespace_approvals
            .iter_mut()
            .find(|r| r.namespace == namespace)
    }
}

/// Authenticated principal performing an action
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Actor {
    /// Directory user id
    pub id: String,
    /// Display name
    pub name: String,
    /// E-mail
    pub email: String,
}

/// Input of a submission
#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmitRequest {
    /// Target cluster
    pub cluster_name: String,
    /// Requested ClusterRole
    #[serde(alias = "role")]
    pub role_name: String,
    /// Principals to bind; defaults to the requester's e-mail
    #[serde(default)]
    pub users: Vec<String>,
    /// Namespaces
    pub namespaces: Vec<String>,
    /// Reason
    #[serde(default)]
    pub justification: String,
    /// Start of the window
    pub start_date: DateTime<Utc>,
    /// End of the window
    pub end_date: DateTime<Utc>,
}

/// Approval decision
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Decision {
    /// Approve the referenced rows
    Approved,
    /// Reject the referenced rows
    Rejected,
}

/// Reference to a request, optionally narrowed to one namespace row
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApprovalRef {
    /// Request id
    pub id: RequestId,
    /// Namespace row; `None` means every row
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
}

/// Filter for history queries
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RecordFilter {
    /// Only requests by this user id
    pub user_id: Option<String>,
    /// Only requests by this username
    pub username: Option<String>,
    /// Only requests with this status
    pub status: Option<RequestStatus>,
    /// Only requests created at or after
    pub created_after: Option<DateTime<Utc>>,
    /// Only requests created at or before
    pub created_before: Option<DateTime<Utc>>,
    /// Maximum number of records, newest first
    pub limit: Option<usize>,
}

impl RecordFilter {
    /// Whether `request` passes the filter (ignoring `limit`)
    pub fn matches(&self, request: &Request) -> bool {
        self.user_id.as_ref().is_none_or(|u| &request.user_id == u)
            && self.username.as_ref().is_none_or(|u| &request.username == u)
            && self.status.is_none_or(|s| request.status == s)
            && self.created_after.is_none_or(|t| request.created_at >= t)
            && self.created_before.is_none_or(|t| request.created_at <= t)
    }
}
