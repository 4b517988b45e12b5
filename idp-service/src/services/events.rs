//! Domain events for downstream consumers (automation, audit pipelines).

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use service_core::retry::{retry_with_backoff, RetryConfig};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use uuid::Uuid;

use crate::config::DeliveryConfig;
use crate::services::delivery::{JobHandler, SubmitError, WorkerPool};
use crate::services::metrics::Metrics;

pub mod event_types {
    pub const USER_LOGIN: &str = "user.login";
    pub const USER_LOGIN_FAILED: &str = "user.login_failed";
    pub const USER_LOGOUT: &str = "user.logout";
    pub const USER_PASSWORD_RESET: &str = "user.password_reset";
    pub const OAUTH2_TOKEN_ISSUED: &str = "oauth2.token_issued";
    pub const SAML_ASSERTION_ISSUED: &str = "saml.assertion_issued";
    pub const CAS_TICKET_VALIDATED: &str = "cas.ticket_validated";
}

#[derive(Debug, Clone, Serialize)]
pub struct DomainEvent {
    pub id: Uuid,
    pub event_type: String,
    pub occurred_utc: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<i64>,
    pub data: serde_json::Value,
}

impl DomainEvent {
    pub fn new(
        event_type: &str,
        user_id: Option<i64>,
        occurred_utc: DateTime<Utc>,
        data: serde_json::Value,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            event_type: event_type.to_string(),
            occurred_utc,
            user_id,
            data,
        }
    }
}

/// Publishing must not block or fail the request that produced the event.
pub trait EventSink: Send + Sync {
    fn publish(&self, event: DomainEvent);
}

// ==================== Webhooks ====================

struct WebhookHandler {
    client: reqwest::Client,
    urls: Vec<String>,
    retry: RetryConfig,
    metrics: Metrics,
}

#[derive(Debug, thiserror::Error)]
enum WebhookError {
    #[error("request failed: {0}")]
    Transport(String),

    #[error("endpoint returned {0}")]
    Status(u16),
}

impl WebhookError {
    fn is_retryable(&self) -> bool {
        match self {
            WebhookError::Transport(_) => true,
            WebhookError::Status(code) => *code >= 500 || *code == 429,
        }
    }
}

impl WebhookHandler {
    async fn post(&self, url: &str, event: &DomainEvent) -> Result<(), WebhookError> {
        let response = self
            .client
            .post(url)
            .header("x-event-type", event.event_type.as_str())
            .json(event)
            .send()
            .await
            .map_err(|e| WebhookError::Transport(e.to_string()))?;
        if response.status().is_success() {
            Ok(())
        } else {
            Err(WebhookError::Status(response.status().as_u16()))
        }
    }
}

#[async_trait]
impl JobHandler<DomainEvent> for WebhookHandler {
    async fn handle(&self, event: DomainEvent) {
        for url in &self.urls {
            let event_ref = &event;
            let url_ref = url.as_str();
            let result = retry_with_backoff(
                &self.retry,
                "webhook_delivery",
                |e: &WebhookError| e.is_retryable(),
                move || self.post(url_ref, event_ref),
            )
            .await;

            match result {
                Ok(()) => self.metrics.event("delivered"),
                Err(e) => {
                    self.metrics.event("failed");
                    tracing::error!(
                        event_type = %event.event_type,
                        event_id = %event.id,
                        url = %url,
                        error = %e,
                        "Webhook delivery failed"
                    );
                }
            }
        }
    }
}

/// Posts every event as JSON to each configured URL from a bounded pool.
pub struct WebhookDispatcher {
    pool: WorkerPool<DomainEvent>,
    metrics: Metrics,
}

impl WebhookDispatcher {
    pub fn new(urls: Vec<String>, config: &DeliveryConfig, metrics: Metrics) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.attempt_timeout_seconds))
            .build()
            .unwrap_or_default();
        let handler = Arc::new(WebhookHandler {
            client,
            urls,
            retry: RetryConfig::new(
                config.max_retries,
                Duration::from_secs(config.attempt_timeout_seconds),
            ),
            metrics: metrics.clone(),
        });
        Self {
            pool: WorkerPool::spawn("webhooks", config.workers, config.queue_capacity, handler),
            metrics,
        }
    }
}

impl EventSink for WebhookDispatcher {
    fn publish(&self, event: DomainEvent) {
        let event_type = event.event_type.clone();
        match self.pool.try_submit(event) {
            Ok(()) => self.metrics.event("queued"),
            Err(SubmitError::QueueFull) | Err(SubmitError::Closed) => {
                self.metrics.event("dropped");
                tracing::warn!(
                    event_type = %event_type,
                    backlog = self.pool.backlog(),
                    "Event queue unavailable, dropping event"
                );
            }
        }
    }
}

// ==================== Tests ====================

#[derive(Debug, Default)]
pub struct RecordingEventSink {
    events: Mutex<Vec<DomainEvent>>,
}

impl RecordingEventSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<DomainEvent> {
        match self.events.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn of_type(&self, event_type: &str) -> Vec<DomainEvent> {
        self.events()
            .into_iter()
            .filter(|e| e.event_type == event_type)
            .collect()
    }
}

impl EventSink for RecordingEventSink {
    fn publish(&self, event: DomainEvent) {
        if let Ok(mut guard) = self.events.lock() {
            guard.push(event);
        }
    }
}
