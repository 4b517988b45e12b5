//! Prometheus collectors owned by one `Metrics` instance.
//!
//! Each `AppState` gets its own registry, so tests never share counters.

use prometheus::{Encoder, HistogramOpts, HistogramVec, IntCounterVec, Opts, Registry, TextEncoder};

use crate::models::artifact::ArtifactKind;

#[derive(Clone)]
pub struct Metrics {
    registry: Registry,
    http_requests_total: IntCounterVec,
    http_request_duration_seconds: HistogramVec,
    login_outcomes_total: IntCounterVec,
    artifacts_issued_total: IntCounterVec,
    artifacts_redeemed_total: IntCounterVec,
    deliveries_total: IntCounterVec,
    events_total: IntCounterVec,
}

fn counter(
    registry: &Registry,
    name: &str,
    help: &str,
    labels: &[&str],
) -> Result<IntCounterVec, prometheus::Error> {
    let metric = IntCounterVec::new(Opts::new(name, help), labels)?;
    registry.register(Box::new(metric.clone()))?;
    Ok(metric)
}

impl Metrics {
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let http_request_duration_seconds = HistogramVec::new(
            HistogramOpts::new("http_request_duration_seconds", "HTTP request duration in seconds"),
            &["method", "path", "status"],
        )?;
        registry.register(Box::new(http_request_duration_seconds.clone()))?;

        Ok(Self {
            http_requests_total: counter(
                &registry,
                "http_requests_total",
                "Total number of HTTP requests",
                &["method", "path", "status"],
            )?,
            http_request_duration_seconds,
            login_outcomes_total: counter(
                &registry,
                "idp_login_outcomes_total",
                "Login pipeline outcomes",
                &["outcome"],
            )?,
            artifacts_issued_total: counter(
                &registry,
                "idp_artifacts_issued_total",
                "One-time artifacts and tokens issued",
                &["kind"],
            )?,
            artifacts_redeemed_total: counter(
                &registry,
                "idp_artifacts_redeemed_total",
                "Artifact redemption attempts",
                &["kind", "outcome"],
            )?,
            deliveries_total: counter(
                &registry,
                "idp_notification_deliveries_total",
                "Notification deliveries",
                &["channel", "outcome"],
            )?,
            events_total: counter(
                &registry,
                "idp_domain_events_total",
                "Domain events published",
                &["outcome"],
            )?,
            registry,
        })
    }

    pub fn observe_http(&self, method: &str, path: &str, status: &str, seconds: f64) {
        self.http_requests_total
            .with_label_values(&[method, path, status])
            .inc();
        self.http_request_duration_seconds
            .with_label_values(&[method, path, status])
            .observe(seconds);
    }

    pub fn login_outcome(&self, outcome: &str) {
        self.login_outcomes_total.with_label_values(&[outcome]).inc();
    }

    pub fn artifact_issued(&self, kind: ArtifactKind) {
        self.artifacts_issued_total
            .with_label_values(&[kind.as_str()])
            .inc();
    }

    pub fn artifact_redeemed(&self, kind: ArtifactKind, success: bool) {
        let outcome = if success { "success" } else { "rejected" };
        self.artifacts_redeemed_total
            .with_label_values(&[kind.as_str(), outcome])
            .inc();
    }

    pub fn delivery(&self, channel: &str, outcome: &str) {
        self.deliveries_total
            .with_label_values(&[channel, outcome])
            .inc();
    }

    pub fn event(&self, outcome: &str) {
        self.events_total.with_label_values(&[outcome]).inc();
    }

    pub fn login_outcome_count(&self, outcome: &str) -> u64 {
        self.login_outcomes_total.with_label_values(&[outcome]).get()
    }

    /// Text exposition format.
    pub fn render(&self) -> String {
        let mut buffer = Vec::new();
        let encoder = TextEncoder::new();

        if let Err(e) = encoder.encode(&self.registry.gather(), &mut buffer) {
            tracing::error!("Failed to encode metrics: {}", e);
            return format!("# Failed to encode metrics: {}\n", e);
        }

        match String::from_utf8(buffer) {
            Ok(s) => s,
            Err(e) => {
                tracing::error!("Failed to convert metrics to UTF-8: {}", e);
                format!("# Failed to convert metrics to UTF-8: {}\n", e)
            }
        }
    }
}
