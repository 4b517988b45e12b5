//! Outbound delivery of one-time codes and reset links.
//!
//! Delivery is fire-and-forget from the caller's point of view: jobs are
//! queued on a bounded worker pool, retried a bounded number of times, and
//! failures are logged and counted, never returned.

use async_trait::async_trait;
use lettre::{
    message::header::ContentType, transport::smtp::authentication::Credentials, Message,
    SmtpTransport, Transport,
};
use service_core::retry::{retry_with_backoff, RetryConfig};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;

use crate::config::{DeliveryConfig, SmsConfig, SmtpConfig};
use crate::models::MfaMethod;
use crate::services::delivery::{JobHandler, SubmitError, WorkerPool};
use crate::services::metrics::Metrics;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Channel {
    Email,
    Sms,
}

impl Channel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Channel::Email => "email",
            Channel::Sms => "sms",
        }
    }
}

#[derive(Debug, Clone)]
pub struct Notification {
    pub channel: Channel,
    pub recipient: String,
    pub subject: String,
    pub body: String,
}

impl Notification {
    pub fn mfa_code(method: MfaMethod, contact: &str, code: &str) -> Self {
        let channel = match method {
            MfaMethod::Sms => Channel::Sms,
            _ => Channel::Email,
        };
        Self {
            channel,
            recipient: contact.to_string(),
            subject: "Your sign-in code".to_string(),
            body: format!("Your sign-in code is {}. It expires in 5 minutes.", code),
        }
    }

    pub fn password_reset(email: &str, link: &str) -> Self {
        Self {
            channel: Channel::Email,
            recipient: email.to_string(),
            subject: "Reset your password".to_string(),
            body: format!(
                "We received a request to reset your password. Visit the link below to set a new one:\n\n{}\n\nThis link expires in 1 hour. If you did not ask for this, ignore this message.",
                link
            ),
        }
    }
}

#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("transport error: {0}")]
    Transport(String),

    #[error("message rejected: {0}")]
    Rejected(String),
}

impl NotifyError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, NotifyError::Transport(_))
    }
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send(&self, notification: &Notification) -> Result<(), NotifyError>;
}

// ==================== SMTP ====================

#[derive(Clone)]
pub struct SmtpNotifier {
    mailer: SmtpTransport,
    from_email: String,
}

impl SmtpNotifier {
    pub fn new(config: &SmtpConfig) -> Result<Self, anyhow::Error> {
        let creds = Credentials::new(config.user.clone(), config.password.clone());

        let mailer = SmtpTransport::starttls_relay(&config.host)?
            .credentials(creds)
            .timeout(Some(Duration::from_secs(10)))
            .build();

        tracing::info!(host = %config.host, "SMTP notifier initialized");

        Ok(Self {
            mailer,
            from_email: config.from.clone(),
        })
    }
}

#[async_trait]
impl Notifier for SmtpNotifier {
    async fn send(&self, notification: &Notification) -> Result<(), NotifyError> {
        let email = Message::builder()
            .from(
                self.from_email
                    .parse()
                    .map_err(|e: lettre::address::AddressError| {
                        NotifyError::Rejected(e.to_string())
                    })?,
            )
            .to(notification
                .recipient
                .parse()
                .map_err(|e: lettre::address::AddressError| NotifyError::Rejected(e.to_string()))?)
            .subject(notification.subject.clone())
            .header(ContentType::TEXT_PLAIN)
            .body(notification.body.clone())
            .map_err(|e| NotifyError::Rejected(e.to_string()))?;

        // SmtpTransport is blocking
        let mailer = self.mailer.clone();
        tokio::task::spawn_blocking(move || mailer.send(&email))
            .await
            .map_err(|e| NotifyError::Transport(e.to_string()))?
            .map_err(|e| NotifyError::Transport(e.to_string()))?;

        Ok(())
    }
}

// ==================== SMS gateway ====================

#[derive(Clone)]
pub struct SmsGatewayNotifier {
    client: reqwest::Client,
    gateway_url: String,
    api_key: String,
}

impl SmsGatewayNotifier {
    pub fn new(config: &SmsConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            gateway_url: config.gateway_url.clone(),
            api_key: config.api_key.clone(),
        }
    }
}

#[async_trait]
impl Notifier for SmsGatewayNotifier {
    async fn send(&self, notification: &Notification) -> Result<(), NotifyError> {
        let response = self
            .client
            .post(&self.gateway_url)
            .bearer_auth(&self.api_key)
            .json(&serde_json::json!({
                "to": notification.recipient,
                "message": notification.body,
            }))
            .send()
            .await
            .map_err(|e| NotifyError::Transport(e.to_string()))?;

        let status = response.status();
        if status.is_server_error() || status.as_u16() == 429 {
            return Err(NotifyError::Transport(format!("gateway returned {}", status)));
        }
        if !status.is_success() {
            return Err(NotifyError::Rejected(format!("gateway returned {}", status)));
        }
        Ok(())
    }
}

// ==================== Dev / test ====================

/// Logs the envelope only; the body carries secrets.
#[derive(Debug, Default, Clone)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn send(&self, notification: &Notification) -> Result<(), NotifyError> {
        tracing::info!(
            channel = notification.channel.as_str(),
            recipient = %notification.recipient,
            subject = %notification.subject,
            "Notification delivery skipped (no transport configured)"
        );
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct RecordingNotifier {
    sent: Mutex<Vec<Notification>>,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sent(&self) -> Vec<Notification> {
        match self.sent.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Poll until at least `count` notifications were delivered or the
    /// timeout lapses.
    pub async fn wait_for(&self, count: usize, timeout: Duration) -> Vec<Notification> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let sent = self.sent();
            if sent.len() >= count || tokio::time::Instant::now() >= deadline {
                return sent;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn send(&self, notification: &Notification) -> Result<(), NotifyError> {
        if let Ok(mut guard) = self.sent.lock() {
            guard.push(notification.clone());
        }
        Ok(())
    }
}

// ==================== Queue ====================

struct DeliveryHandler {
    email: Arc<dyn Notifier>,
    sms: Arc<dyn Notifier>,
    retry: RetryConfig,
    metrics: Metrics,
}

#[async_trait]
impl JobHandler<Notification> for DeliveryHandler {
    async fn handle(&self, job: Notification) {
        let notifier: &dyn Notifier = match job.channel {
            Channel::Email => self.email.as_ref(),
            Channel::Sms => self.sms.as_ref(),
        };
        let job_ref = &job;

        let result = retry_with_backoff(
            &self.retry,
            "notification_delivery",
            |e: &NotifyError| e.is_retryable(),
            move || notifier.send(job_ref),
        )
        .await;

        match result {
            Ok(()) => {
                self.metrics.delivery(job.channel.as_str(), "sent");
                tracing::debug!(channel = job.channel.as_str(), "Notification delivered");
            }
            Err(e) => {
                self.metrics.delivery(job.channel.as_str(), "failed");
                tracing::error!(
                    channel = job.channel.as_str(),
                    recipient = %job.recipient,
                    error = %e,
                    "Notification delivery failed"
                );
            }
        }
    }
}

pub struct NotificationQueue {
    pool: WorkerPool<Notification>,
    metrics: Metrics,
}

impl NotificationQueue {
    pub fn new(
        config: &DeliveryConfig,
        email: Arc<dyn Notifier>,
        sms: Arc<dyn Notifier>,
        metrics: Metrics,
    ) -> Self {
        let handler = Arc::new(DeliveryHandler {
            email,
            sms,
            retry: RetryConfig::new(
                config.max_retries,
                Duration::from_secs(config.attempt_timeout_seconds),
            ),
            metrics: metrics.clone(),
        });
        Self {
            pool: WorkerPool::spawn(
                "notifications",
                config.workers,
                config.queue_capacity,
                handler,
            ),
            metrics,
        }
    }

    /// Queue a delivery. Never blocks and never fails the caller.
    pub fn enqueue(&self, notification: Notification) {
        let channel = notification.channel.as_str();
        match self.pool.try_submit(notification) {
            Ok(()) => {}
            Err(SubmitError::QueueFull) => {
                self.metrics.delivery(channel, "dropped");
                tracing::warn!(
                    channel,
                    backlog = self.pool.backlog(),
                    "Notification queue full, dropping delivery"
                );
            }
            Err(SubmitError::Closed) => {
                self.metrics.delivery(channel, "dropped");
                tracing::error!(channel, "Notification queue closed, dropping delivery");
            }
        }
    }
}
