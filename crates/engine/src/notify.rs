//! Run-completion notifications.
//!
//! Delivery is best effort: failures are logged by the caller and never
//! change the run's exit code.

use crate::summary::RunSummary;
use async_trait::async_trait;
use reqwest::Client;
use std::time::Duration;
use thiserror::Error;

/// HTTP timeout for notification requests.
const NOTIFICATION_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("endpoint returned {status}: {body}")]
    Status { status: u16, body: String },
}

/// Receives the terminal summary of a run.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, summary: &RunSummary) -> Result<(), NotifyError>;
}

/// POSTs the summary as JSON to a webhook URL.
pub struct WebhookNotifier {
    client: Client,
    url: String,
}

impl WebhookNotifier {
    pub fn new(url: impl Into<String>) -> Self {
        let client = Client::builder()
            .timeout(NOTIFICATION_TIMEOUT)
            .build()
            .unwrap_or_else(|e| {
                tracing::warn!("Failed to build notification HTTP client: {e}");
                Client::new()
            });
        Self {
            client,
            url: url.into(),
        }
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    async fn notify(&self, summary: &RunSummary) -> Result<(), NotifyError> {
        let resp = self.client.post(&self.url).json(summary).send().await?;
        let status = resp.status();
        if status.is_success() {
            tracing::info!(url = %self.url, "run summary delivered");
            Ok(())
        } else {
            let body = resp.text().await.unwrap_or_default();
            Err(NotifyError::Status {
                status: status.as_u16(),
                body,
            })
        }
    }
}
