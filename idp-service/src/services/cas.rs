//! CAS 1.0 / 2.0 server: service tickets are issued for registered services
//! and redeemed exactly once.

use quick_xml::escape::escape;
use std::net::IpAddr;
use std::sync::Arc;
use thiserror::Error;

use crate::models::artifact::{keys, ArtifactKind, CasTicketContext};
use crate::models::{AccessContext, User};
use crate::services::events::{event_types, DomainEvent, EventSink};
use crate::services::oauth2::append_query;
use crate::services::{
    Clock, ConditionalAccessEvaluator, EphemeralStore, IdentityRepository, Metrics, ServiceError,
};
use crate::utils::random_token;

const SERVICE_TICKET_TTL: std::time::Duration = std::time::Duration::from_secs(5 * 60);
const SERVICE_TICKET_BYTES: usize = 24;

#[derive(Debug, Error)]
pub enum CasError {
    #[error("{0}")]
    InvalidRequest(String),

    #[error("{0}")]
    InvalidTicket(String),

    #[error("{0}")]
    InvalidService(String),

    #[error(transparent)]
    Service(#[from] ServiceError),
}

impl CasError {
    /// CAS 2.0 failure code.
    pub fn code(&self) -> &'static str {
        match self {
            CasError::InvalidRequest(_) => "INVALID_REQUEST",
            CasError::InvalidTicket(_) => "INVALID_TICKET",
            CasError::InvalidService(_) => "INVALID_SERVICE",
            CasError::Service(_) => "INTERNAL_ERROR",
        }
    }
}

pub fn validation_failure_xml(error: &CasError) -> String {
    format!(
        concat!(
            "<cas:serviceResponse xmlns:cas=\"http://www.yale.edu/tp/cas\">\n",
            "  <cas:authenticationFailure code=\"{}\">{}</cas:authenticationFailure>\n",
            "</cas:serviceResponse>\n"
        ),
        error.code(),
        escape(error.to_string().as_str())
    )
}

fn validation_success_xml(user: &str) -> String {
    format!(
        concat!(
            "<cas:serviceResponse xmlns:cas=\"http://www.yale.edu/tp/cas\">\n",
            "  <cas:authenticationSuccess>\n",
            "    <cas:user>{}</cas:user>\n",
            "  </cas:authenticationSuccess>\n",
            "</cas:serviceResponse>\n"
        ),
        escape(user)
    )
}

#[derive(Clone)]
pub struct CasServer {
    repo: Arc<dyn IdentityRepository>,
    store: Arc<dyn EphemeralStore>,
    clock: Arc<dyn Clock>,
    access: ConditionalAccessEvaluator,
    events: Arc<dyn EventSink>,
    metrics: Metrics,
}

impl CasServer {
    pub fn new(
        repo: Arc<dyn IdentityRepository>,
        store: Arc<dyn EphemeralStore>,
        clock: Arc<dyn Clock>,
        access: ConditionalAccessEvaluator,
        events: Arc<dyn EventSink>,
        metrics: Metrics,
    ) -> Self {
        Self {
            repo,
            store,
            clock,
            access,
            events,
            metrics,
        }
    }

    /// Issue a service ticket for an authenticated user and return the
    /// service URL with `ticket` appended.
    pub async fn login(
        &self,
        service: Option<&str>,
        user: &User,
        ip: IpAddr,
        user_agent: &str,
    ) -> Result<String, CasError> {
        let service = service
            .filter(|s| !s.is_empty())
            .ok_or_else(|| CasError::InvalidRequest("service parameter is required".to_string()))?;
        let registration = self
            .repo
            .find_cas_service_for(service)
            .await?
            .ok_or_else(|| {
                CasError::InvalidService(format!("Service {} is not registered", service))
            })?;

        let decision = self
            .access
            .evaluate(&AccessContext {
                user_id: user.user_id,
                app_id: Some(registration.app_id.clone()),
                ip,
                user_agent: user_agent.to_string(),
                roles: user.roles.clone(),
                at: self.clock.now(),
                risk_score: None,
            })
            .await?;
        if let Some(reason) = decision.block_reason {
            return Err(ServiceError::PolicyBlocked(reason).into());
        }

        let ticket = format!("ST-{}", random_token(SERVICE_TICKET_BYTES));
        self.store
            .put_json(
                &keys::cas_ticket(&ticket),
                &CasTicketContext {
                    user_id: user.user_id,
                    username: user.username.clone(),
                    service: service.to_string(),
                },
                SERVICE_TICKET_TTL,
            )
            .await
            .map_err(ServiceError::from)?;
        self.metrics.artifact_issued(ArtifactKind::CasTicket);
        tracing::info!(
            user_id = user.user_id,
            app_id = %registration.app_id,
            "CAS service ticket issued"
        );

        Ok(append_query(service, &[("ticket", &ticket)]))
    }

    /// Consume a ticket. The ticket is gone after this call whatever the
    /// outcome.
    pub async fn redeem(
        &self,
        ticket: Option<&str>,
        service: Option<&str>,
    ) -> Result<CasTicketContext, CasError> {
        let (Some(ticket), Some(service)) = (
            ticket.filter(|t| !t.is_empty()),
            service.filter(|s| !s.is_empty()),
        ) else {
            return Err(CasError::InvalidRequest(
                "ticket and service parameters are required".to_string(),
            ));
        };

        let context: Option<CasTicketContext> = self
            .store
            .take_json(&keys::cas_ticket(ticket))
            .await
            .map_err(ServiceError::from)?;
        let Some(context) = context else {
            self.metrics.artifact_redeemed(ArtifactKind::CasTicket, false);
            return Err(CasError::InvalidTicket(format!("Ticket {} not recognized", ticket)));
        };
        if context.service != service {
            self.metrics.artifact_redeemed(ArtifactKind::CasTicket, false);
            tracing::warn!(
                user_id = context.user_id,
                "CAS ticket presented for a different service"
            );
            return Err(CasError::InvalidService(
                "Ticket was not issued for this service".to_string(),
            ));
        }

        self.metrics.artifact_redeemed(ArtifactKind::CasTicket, true);
        self.events.publish(DomainEvent::new(
            event_types::CAS_TICKET_VALIDATED,
            Some(context.user_id),
            self.clock.now(),
            serde_json::json!({ "service": context.service }),
        ));
        tracing::info!(user_id = context.user_id, "CAS ticket validated");
        Ok(context)
    }

    /// CAS 1.0 `validate`: `yes\n<user>\n` or `no\n`.
    pub async fn validate(&self, ticket: Option<&str>, service: Option<&str>) -> String {
        match self.redeem(ticket, service).await {
            Ok(context) => format!("yes\n{}\n", context.username),
            Err(CasError::Service(e)) => {
                tracing::error!(error = %e, "CAS validation failed");
                "no\n".to_string()
            }
            Err(_) => "no\n".to_string(),
        }
    }

    /// CAS 2.0 `serviceValidate` XML envelope.
    pub async fn service_validate(&self, ticket: Option<&str>, service: Option<&str>) -> String {
        match self.redeem(ticket, service).await {
            Ok(context) => validation_success_xml(&context.username),
            Err(e) => {
                if let CasError::Service(cause) = &e {
                    tracing::error!(error = %cause, "CAS validation failed");
                }
                validation_failure_xml(&e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{CasService, ConditionalAccessPolicy, PolicyActions};
    use crate::services::{FixedClock, InMemoryRepository, MemoryStore, RecordingEventSink};
    use chrono::{Duration, TimeZone, Utc};

    struct Fixture {
        cas: CasServer,
        repo: Arc<InMemoryRepository>,
        store: Arc<MemoryStore>,
        clock: Arc<FixedClock>,
        events: Arc<RecordingEventSink>,
        user: User,
    }

    const SERVICE: &str = "https://wiki.example.com/login";

    async fn fixture() -> Fixture {
        let clock = Arc::new(FixedClock::new(Utc.with_ymd_and_hms(2024, 6, 5, 12, 0, 0).unwrap()));
        let repo = Arc::new(InMemoryRepository::new());
        let store = Arc::new(MemoryStore::new(clock.clone()));
        let events = Arc::new(RecordingEventSink::new());
        repo.insert_cas_service(&CasService::new("wiki", "https://wiki.example.com/"))
            .await
            .unwrap();
        let user = repo
            .insert_user(&User::new("erin".into(), "erin@example.com".into(), "h".into()))
            .await
            .unwrap();
        let cas = CasServer::new(
            repo.clone(),
            store.clone(),
            clock.clone(),
            ConditionalAccessEvaluator::new(repo.clone()),
            events.clone(),
            Metrics::new().unwrap(),
        );
        Fixture {
            cas,
            repo,
            store,
            clock,
            events,
            user,
        }
    }

    fn ticket_from(redirect: &str) -> String {
        redirect.split("ticket=").nth(1).unwrap().to_string()
    }

    fn ip() -> IpAddr {
        "10.0.0.1".parse().unwrap()
    }

    #[tokio::test]
    async fn test_validate_is_single_use() {
        let f = fixture().await;
        let redirect = f.cas.login(Some(SERVICE), &f.user, ip(), "ua").await.unwrap();
        assert!(redirect.starts_with("https://wiki.example.com/login?ticket=ST-"));
        let ticket = ticket_from(&redirect);

        assert_eq!(f.cas.validate(Some(&ticket), Some(SERVICE)).await, "yes\nerin\n");
        assert_eq!(f.cas.validate(Some(&ticket), Some(SERVICE)).await, "no\n");
        assert_eq!(f.events.of_type(event_types::CAS_TICKET_VALIDATED).len(), 1);
    }

    #[tokio::test]
    async fn test_unknown_ticket_is_no() {
        let f = fixture().await;
        assert_eq!(f.cas.validate(Some("ST-bogus"), Some(SERVICE)).await, "no\n");
        assert_eq!(f.cas.validate(None, Some(SERVICE)).await, "no\n");
    }

    #[tokio::test]
    async fn test_ticket_expires_after_five_minutes() {
        let f = fixture().await;
        let ticket = ticket_from(&f.cas.login(Some(SERVICE), &f.user, ip(), "ua").await.unwrap());
        f.clock.advance(Duration::minutes(6));
        assert_eq!(f.cas.validate(Some(&ticket), Some(SERVICE)).await, "no\n");
    }

    #[tokio::test]
    async fn test_service_mismatch_consumes_ticket() {
        let f = fixture().await;
        let ticket = ticket_from(&f.cas.login(Some(SERVICE), &f.user, ip(), "ua").await.unwrap());

        let xml = f
            .cas
            .service_validate(Some(&ticket), Some("https://wiki.example.com/other"))
            .await;
        assert!(xml.contains(r#"code="INVALID_SERVICE""#));
        assert_eq!(f.cas.validate(Some(&ticket), Some(SERVICE)).await, "no\n");
    }

    #[tokio::test]
    async fn test_service_validate_success_xml() {
        let f = fixture().await;
        let ticket = ticket_from(&f.cas.login(Some(SERVICE), &f.user, ip(), "ua").await.unwrap());
        let xml = f.cas.service_validate(Some(&ticket), Some(SERVICE)).await;
        assert!(xml.contains("<cas:user>erin</cas:user>"));

        let again = f.cas.service_validate(Some(&ticket), Some(SERVICE)).await;
        assert!(again.contains(r#"code="INVALID_TICKET""#));
    }

    #[tokio::test]
    async fn test_service_validate_missing_params() {
        let f = fixture().await;
        let xml = f.cas.service_validate(None, None).await;
        assert!(xml.contains(r#"code="INVALID_REQUEST""#));
    }

    #[tokio::test]
    async fn test_unregistered_service_is_refused() {
        let f = fixture().await;
        let err = f
            .cas
            .login(Some("https://evil.example.net/"), &f.user, ip(), "ua")
            .await
            .unwrap_err();
        assert_eq!(err.code(), "INVALID_SERVICE");
    }

    #[tokio::test]
    async fn test_policy_block_prevents_ticket() {
        let f = fixture().await;
        f.repo
            .insert_policy(
                &ConditionalAccessPolicy::new("closed", 10, vec![], PolicyActions::block())
                    .unwrap(),
            )
            .await
            .unwrap();
        let err = f.cas.login(Some(SERVICE), &f.user, ip(), "ua").await.unwrap_err();
        assert!(matches!(err, CasError::Service(ServiceError::PolicyBlocked(_))));
    }

    #[tokio::test]
    async fn test_store_outage_fails_closed() {
        let f = fixture().await;
        let ticket = ticket_from(&f.cas.login(Some(SERVICE), &f.user, ip(), "ua").await.unwrap());
        f.store.set_available(false);
        assert_eq!(f.cas.validate(Some(&ticket), Some(SERVICE)).await, "no\n");
        assert!(f
            .cas
            .service_validate(Some(&ticket), Some(SERVICE))
            .await
            .contains("INTERNAL_ERROR"));
    }
}
