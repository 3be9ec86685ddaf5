//! Requester notifications
//!
//! Delivery is best-effort: [`spawn_notification`] runs the send on a
//! detached task and only logs failures.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{info, warn};

use crate::model::{Request, RequestStatus};

/// What happened to a request
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NotificationKind {
    /// Request submitted
    Submitted,
    /// Request status changed
    StatusChanged(RequestStatus),
}

/// A message for one recipient
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Notification {
    /// Recipient address
    pub to: String,
    /// Subject line
    pub subject: String,
    /// Plain-text body
    pub body: String,
    /// Event kind
    pub kind: NotificationKind,
}

impl Notification {
    /// Submission receipt for the requester
    pub fn submitted(request: &Request) -> Self {
        Self {
            to: request.email.clone(),
            subject: format!("Access request #{} submitted", request.id),
            body: format!(
                "Your request for role '{}' on cluster '{}' in namespaces [{}] from {} to {} is awaiting approval.",
                request.role_name,
                request.cluster_name,
                request.namespaces.join(", "),
                request.start_date.to_rfc3339(),
                request.end_date.to_rfc3339(),
            ),
            kind: NotificationKind::Submitted,
        }
    }

    /// Status change for the requester
    pub fn status_changed(request: &Request) -> Self {
        let mut body = format!(
            "Your request #{} for role '{}' on cluster '{}' is now {}.",
            request.id, request.role_name, request.cluster_name, request.status
        );
        if !request.notes.is_empty() {
            body.push_str(&format!("\n\n{}", request.notes));
        }
        Self {
            to: request.email.clone(),
            subject: format!("Access request #{} {}", request.id, request.status),
            body,
            kind: NotificationKind::StatusChanged(request.status),
        }
    }
}

/// Outbound notification channel
#[async_trait]
pub trait Notifier: Send + Sync {
    /// Deliver one notification
    async fn send(&self, notification: &Notification) -> Result<(), String>;
}

/// Notifier that writes each message to the log
#[derive(Debug, Default)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn send(&self, notification: &Notification) -> Result<(), String> {
        info!(
            to = %notification.to,
            subject = %notification.subject,
            kind = ?notification.kind,
            "notification"
        );
        Ok(())
    }
}

/// Send on a detached task; failures are logged and dropped
pub fn spawn_notification(notifier: Arc<dyn Notifier>, notification: Notification) {
    tokio::spawn(async move {
        if let Err(e) = notifier.send(&notification).await {
            warn!(to = %notification.to, error = %e, "notification failed");
        }
    });
}
