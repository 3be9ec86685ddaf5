//! Status callbacks to the kube-jit API
//!
//! Every JitRequest carries a signed callback URL minted by the API. The
//! operator posts `{ticketID, status, message}` to it whenever the request
//! changes state. Transient failures are retried here with a bounded backoff;
//! the reconciler owns the longer-lived retry (see `callbackOverdue`).

use std::time::Duration;

use async_trait::async_trait;
use kube_jit_common::crd::JitRequestState;
use kube_jit_common::retry::{retry_with_backoff_if, RetryConfig};
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, instrument};

#[cfg(test)]
use mockall::automock;

/// Body posted to the callback URL
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct CallbackPayload {
    /// API request id
    #[serde(rename = "ticketID")]
    pub ticket_id: String,
    /// State being reported
    pub status: JitRequestState,
    /// Human-readable detail
    pub message: String,
}

/// Callback delivery failure
#[derive(Debug, Error)]
pub enum CallbackError {
    /// Could not reach the API, or the request timed out
    #[error("callback transport error: {0}")]
    Transport(String),

    /// The API answered with a server error or asked us to slow down
    #[error("callback failed with HTTP {status}: {body}")]
    Unavailable {
        /// HTTP status code
        status: u16,
        /// Response body, truncated
        body: String,
    },

    /// The API refused the callback (bad or expired signature, unknown ticket)
    #[error("callback refused with HTTP {status}: {body}")]
    Refused {
        /// HTTP status code
        status: u16,
        /// Response body, truncated
        body: String,
    },
}

impl CallbackError {
    /// Refusals are final: the signed URL will not become valid again.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, CallbackError::Refused { .. })
    }

    fn from_status(status: u16, body: String) -> Self {
        match status {
            408 | 429 => CallbackError::Unavailable { status, body },
            400..=499 => CallbackError::Refused { status, body },
            _ => CallbackError::Unavailable { status, body },
        }
    }
}

/// Delivers callbacks to the API
#[cfg_attr(test, automock)]
#[async_trait]
pub trait CallbackClient: Send + Sync {
    /// Post `payload` to the signed `url`
    async fn send(&self, url: &str, payload: &CallbackPayload) -> Result<(), CallbackError>;
}

const MAX_BODY_IN_ERROR: usize = 256;

/// reqwest-backed [`CallbackClient`]
pub struct HttpCallbackClient {
    http: reqwest::Client,
    retry: RetryConfig,
}

impl HttpCallbackClient {
    /// Build a client with a per-attempt `timeout`.
    pub fn new(timeout: Duration, retry: RetryConfig) -> Result<Self, CallbackError> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| CallbackError::Transport(format!("building http client: {}", e)))?;
        Ok(Self { http, retry })
    }

    /// Default bounded retry for one delivery attempt cycle
    pub fn default_retry() -> RetryConfig {
        RetryConfig::with_max_attempts(3)
            .initial_delay(Duration::from_millis(500))
            .max_delay(Duration::from_secs(5))
    }

    async fn post_once(&self, url: &str, payload: &CallbackPayload) -> Result<(), CallbackError> {
        let response = self
            .http
            .post(url)
            .json(payload)
            .send()
            .await
            .map_err(|e| CallbackError::Transport(e.to_string()))?;

        let status = response.status();
        if status.is_success() {
            return Ok(());
        }
        let mut body = response.text().await.unwrap_or_default();
        body.truncate(MAX_BODY_IN_ERROR);
        Err(CallbackError::from_status(status.as_u16(), body))
    }
}

#[async_trait]
impl CallbackClient for HttpCallbackClient {
    #[instrument(skip(self, url, payload), fields(ticket_id = %payload.ticket_id, status = %payload.status))]
    async fn send(&self, url: &str, payload: &CallbackPayload) -> Result<(), CallbackError> {
        retry_with_backoff_if(
            &self.retry,
            "api_callback",
            CallbackError::is_retryable,
            || self.post_once(url, payload),
        )
        .await?;
        debug!("callback delivered");
        Ok(())
    }
}
