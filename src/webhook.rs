//! Webhook forwarding.
//!
//! Delivery is at-least-once: a failed POST is retried with exponential
//! backoff up to the configured attempt count, and the caller only logs a
//! final failure.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Client;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};

use crate::config::WebhookConfig;
use crate::db::{MessageOrigin, MessageRecord};
use crate::error::WebhookError;
use crate::ingest::MessageContent;

/// Header carrying the shared secret.
pub const SECRET_HEADER: &str = "X-Webhook-Secret";

/// Body POSTed for every forwarded message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WebhookPayload {
    pub agent_id: String,
    /// External id when known, otherwise the record id.
    pub message_id: String,
    /// `in` or `out`.
    pub direction: String,
    pub sender: String,
    pub recipient: String,
    pub content: MessageContent,
    pub body: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub origin: MessageOrigin,
}

impl WebhookPayload {
    pub fn from_record(record: &MessageRecord) -> Self {
        Self {
            agent_id: record.agent_id.clone(),
            message_id: record
                .external_id
                .clone()
                .unwrap_or_else(|| record.id.to_string()),
            direction: record.direction.as_str().to_string(),
            sender: record.sender.clone(),
            recipient: record.recipient.clone(),
            body: record.content.body().map(String::from),
            content: record.content.clone(),
            timestamp: record.sent_at,
            origin: record.origin,
        }
    }
}

/// Destination for forwarded messages.
#[async_trait]
pub trait WebhookDispatcher: Send + Sync {
    async fn dispatch(&self, payload: &WebhookPayload) -> Result<(), WebhookError>;
}

/// Dispatcher used when no webhook URL is configured.
pub struct NoopDispatcher;

#[async_trait]
impl WebhookDispatcher for NoopDispatcher {
    async fn dispatch(&self, _payload: &WebhookPayload) -> Result<(), WebhookError> {
        Ok(())
    }
}

/// HTTP POST dispatcher.
pub struct HttpWebhookDispatcher {
    client: Client,
    url: String,
    secret: Option<SecretString>,
    max_attempts: u32,
    initial_backoff: Duration,
}

impl HttpWebhookDispatcher {
    pub fn new(url: impl Into<String>, config: &WebhookConfig) -> Self {
        let client = Client::builder()
            .timeout(config.timeout)
            .build()
            .unwrap_or_else(|_| Client::new());

        Self {
            client,
            url: url.into(),
            secret: config.secret.clone(),
            max_attempts: config.max_attempts.max(1),
            initial_backoff: config.initial_backoff,
        }
    }

    async fn post_once(&self, payload: &WebhookPayload) -> Result<(), WebhookError> {
        let mut request = self
            .client
            .post(&self.url)
            .header("Content-Type", "application/json")
            .json(payload);
        if let Some(secret) = &self.secret {
            request = request.header(SECRET_HEADER, secret.expose_secret());
        }

        let response = request.send().await?;
        let status = response.status();
        if status.is_success() {
            return Ok(());
        }
        let body = response.text().await.unwrap_or_default();
        Err(WebhookError::Status {
            status: status.as_u16(),
            body,
        })
    }
}

fn is_retryable(err: &WebhookError) -> bool {
    match err {
        WebhookError::Request(_) => true,
        WebhookError::Status { status, .. } => *status >= 500 || *status == 429 || *status == 408,
        WebhookError::Exhausted { .. } => false,
    }
}

#[async_trait]
impl WebhookDispatcher for HttpWebhookDispatcher {
    async fn dispatch(&self, payload: &WebhookPayload) -> Result<(), WebhookError> {
        let mut backoff = self.initial_backoff;
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.post_once(payload).await {
                Ok(()) => {
                    tracing::debug!(
                        agent_id = %payload.agent_id,
                        message_id = %payload.message_id,
                        attempt,
                        "Webhook delivered"
                    );
                    return Ok(());
                }
                Err(e) if is_retryable(&e) && attempt < self.max_attempts => {
                    tracing::warn!(
                        agent_id = %payload.agent_id,
                        message_id = %payload.message_id,
                        attempt,
                        "Webhook delivery failed, retrying in {:?}: {}",
                        backoff,
                        e
                    );
                    tokio::time::sleep(backoff).await;
                    backoff = backoff.saturating_mul(2);
                }
                Err(e) if is_retryable(&e) => {
                    return Err(WebhookError::Exhausted {
                        attempts: attempt,
                        last: e.to_string(),
                    });
                }
                Err(e) => return Err(e),
            }
        }
    }
}

/// Dispatcher for the configured URL, or a no-op when forwarding is off.
pub fn dispatcher_from_config(config: &WebhookConfig) -> Arc<dyn WebhookDispatcher> {
    match &config.url {
        Some(url) => Arc::new(HttpWebhookDispatcher::new(url.clone(), config)),
        None => {
            tracing::info!("No webhook URL configured, forwarding disabled");
            Arc::new(NoopDispatcher)
        }
    }
}

/// In-memory dispatcher that records deliveries.
#[cfg(test)]
#[derive(Default)]
pub(crate) struct RecordingDispatcher {
    delivered: std::sync::Mutex<Vec<WebhookPayload>>,
    fail: std::sync::atomic::AtomicBool,
}

#[cfg(test)]
impl RecordingDispatcher {
    pub(crate) fn delivered(&self) -> Vec<WebhookPayload> {
        self.delivered.lock().unwrap().clone()
    }

    pub(crate) fn set_failing(&self, fail: bool) {
        self.fail.store(fail, std::sync::atomic::Ordering::SeqCst);
    }
}

#[cfg(test)]
#[async_trait]
impl WebhookDispatcher for RecordingDispatcher {
    async fn dispatch(&self, payload: &WebhookPayload) -> Result<(), WebhookError> {
        if self.fail.load(std::sync::atomic::Ordering::SeqCst) {
            return Err(WebhookError::Request("endpoint unreachable".to_string()));
        }
        self.delivered.lock().unwrap().push(payload.clone());
        Ok(())
    }
}
