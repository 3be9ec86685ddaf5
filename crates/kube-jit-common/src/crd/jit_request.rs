//! JitRequest: an approved access grant materialized on a target cluster

use chrono::{DateTime, Utc};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Lifecycle state reported in `status.state`
#[derive(Clone, Copy, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum JitRequestState {
    /// Validated, waiting for `startTime`
    Pending,
    /// Role bindings exist
    Succeeded,
    /// Failed validation or arrived too late
    Rejected,
}

impl JitRequestState {
    /// Wire string, as sent in callbacks
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "Pending",
            Self::Succeeded => "Succeeded",
            Self::Rejected => "Rejected",
        }
    }
}

impl std::fmt::Display for JitRequestState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Status of a JitRequest
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct JitRequestStatus {
    /// Current state; absent on a freshly created object
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<JitRequestState>,

    /// Human-readable message
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,

    /// Start of the granted window, copied from the spec once validated
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_time: Option<DateTime<Utc>>,

    /// End of the granted window
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<Utc>>,

    /// Last state successfully delivered to the API
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reported_state: Option<JitRequestState>,

    /// Set while the current state has not been delivered to the API
    #[serde(default)]
    pub callback_overdue: bool,

    /// Failed delivery attempts for the current state
    #[serde(default)]
    pub callback_attempts: u32,
}

impl JitRequestStatus {
    /// True when `state` still needs to be reported
    pub fn needs_callback(&self) -> bool {
        self.state.is_some() && self.state != self.reported_state
    }
}

/// Specification for a JitRequest
///
/// Created by the API once every namespace of a request is approved. The
/// operator grants `clusterRole` to `userEmails` in each namespace for the
/// window `[startTime, endTime]` and reports back through `callbackUrl`.
#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "jit.kubejit.io",
    version = "v1",
    kind = "JitRequest",
    plural = "jitrequests",
    shortname = "jitreq",
    status = "JitRequestStatus",
    printcolumn = r#"{"name":"Role","type":"string","jsonPath":".spec.clusterRole"}"#,
    printcolumn = r#"{"name":"State","type":"string","jsonPath":".status.state"}"#,
    printcolumn = r#"{"name":"Start","type":"date","jsonPath":".spec.startTime"}"#,
    printcolumn = r#"{"name":"End","type":"date","jsonPath":".spec.endTime"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct JitRequestSpec {
    /// Users bound by the role bindings
    pub user_emails: Vec<String>,

    /// ClusterRole referenced by every role binding
    pub cluster_role: String,

    /// Namespaces receiving a role binding
    pub namespaces: Vec<String>,

    /// Reason given by the requester
    #[serde(default)]
    pub justification: String,

    /// Display name of the requester
    #[serde(default)]
    pub requestor_name: String,

    /// E-mail of the requester
    #[serde(default)]
    pub requestor_email: String,

    /// Approvers that completed the request
    #[serde(default)]
    pub approver_name: String,

    /// Signed URL the operator posts state changes to
    pub callback_url: String,

    /// Start of the access window
    pub start_time: DateTime<Utc>,

    /// End of the access window
    pub end_time: DateTime<Utc>,

    /// API request id
    #[serde(rename = "ticketID")]
    pub ticket_id: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn parses_materialized_request() {
        let spec: JitRequestSpec = serde_yaml::from_str(
            r#"
userEmails: ["u1@example.com"]
clusterRole: edit
namespaces: [app-a, app-b]
justification: incident 42
requestorName: u1
requestorEmail: u1@example.com
approverName: u2
callbackUrl: "https://jit.example.com/kube-jit-api/k8s-callback?expiry=1&signature=ab"
startTime: "2024-01-01T00:01:00Z"
endTime: "2024-01-01T00:10:00Z"
ticketID: "1"
"#,
        )
        .unwrap();

        assert_eq!(spec.cluster_role, "edit");
        assert_eq!(spec.namespaces, vec!["app-a", "app-b"]);
        assert_eq!(spec.ticket_id, "1");
        assert_eq!(
            spec.end_time,
            Utc.with_ymd_and_hms(2024, 1, 1, 0, 10, 0).unwrap()
        );
    }

    #[test]
    fn ticket_id_serializes_with_upper_case_suffix() {
        let spec = JitRequestSpec {
            user_emails: vec![],
            cluster_role: "view".into(),
            namespaces: vec![],
            justification: String::new(),
            requestor_name: String::new(),
            requestor_email: String::new(),
            approver_name: String::new(),
            callback_url: String::new(),
            start_time: Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
            end_time: Utc.with_ymd_and_hms(2024, 1, 1, 1, 0, 0).unwrap(),
            ticket_id: "9".into(),
        };
        let json = serde_json::to_value(&spec).unwrap();
        assert_eq!(json["ticketID"], "9");
        assert_eq!(json["clusterRole"], "view");
    }

    #[test]
    fn status_tracks_unreported_state() {
        let mut status = JitRequestStatus::default();
        assert!(!status.needs_callback());

        status.state = Some(JitRequestState::Pending);
        assert!(status.needs_callback());

        status.reported_state = Some(JitRequestState::Pending);
        assert!(!status.needs_callback());

        status.state = Some(JitRequestState::Succeeded);
        assert!(status.needs_callback());
    }
}
