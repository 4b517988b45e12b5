//! SAML 2.0 identity provider: SP- and IdP-initiated SSO, single logout and
//! metadata.
//!
//! SP-initiated request ids are recorded with `put_if_absent`, so a replayed
//! `AuthnRequest` is refused rather than answered twice.

pub mod metadata;
pub mod request;
pub mod response;

use std::net::IpAddr;
use std::sync::Arc;
use thiserror::Error;

use crate::models::artifact::{keys, ArtifactKind, SamlRequestContext};
use crate::models::{AccessContext, SamlConfig, User};
use crate::services::events::{event_types, DomainEvent, EventSink};
use crate::services::{
    Clock, ConditionalAccessEvaluator, EphemeralStore, IdentityRepository, Metrics, ServiceError,
};

pub use request::SamlBinding;
use request::{decode_message, parse_authn_request, parse_logout_request};
use response::{
    logout_response, post_form, redirect_location, signed_response, status_response,
    AssertionParams, SigningMaterial, STATUS_AUTHN_FAILED, STATUS_REQUESTER, STATUS_RESPONDER,
};

const SAML_REQUEST_TTL: std::time::Duration = std::time::Duration::from_secs(5 * 60);

#[derive(Debug, Error)]
pub enum SamlError {
    /// Malformed, unknown or replayed request from the service provider.
    #[error("Requester error: {0}")]
    Requester(String),

    #[error("Responder error: {0}")]
    Responder(String),

    #[error("Authentication failed: {0}")]
    AuthnFailed(String),

    /// Missing or unusable signing material for the application.
    #[error("SAML configuration error: {0}")]
    Configuration(String),

    #[error("No SAML configuration for application '{0}'")]
    UnknownApplication(String),

    #[error(transparent)]
    Service(#[from] ServiceError),
}

impl SamlError {
    pub fn status_code(&self) -> &'static str {
        match self {
            SamlError::Requester(_) | SamlError::UnknownApplication(_) => STATUS_REQUESTER,
            SamlError::AuthnFailed(_) => STATUS_AUTHN_FAILED,
            SamlError::Responder(_) | SamlError::Configuration(_) | SamlError::Service(_) => {
                STATUS_RESPONDER
            }
        }
    }
}

/// How a message travels back to the service provider.
#[derive(Debug, Clone, PartialEq)]
pub enum SamlDelivery {
    /// Auto-submitting HTML form.
    Post(String),
    /// `Location` for a 302.
    Redirect(String),
}

/// Where this IdP lives.
#[derive(Debug, Clone)]
pub struct SamlEndpoints {
    pub entity_id: String,
    pub sso_url: String,
    pub slo_url: String,
}

#[derive(Debug, Clone, Default)]
pub struct SsoRequest {
    pub saml_request: Option<String>,
    pub relay_state: Option<String>,
    /// IdP-initiated SSO target.
    pub app_id: Option<String>,
    pub binding: Option<SamlBinding>,
}

#[derive(Debug, Clone)]
pub struct SloRequest {
    pub saml_request: String,
    pub relay_state: Option<String>,
    pub binding: SamlBinding,
}

#[derive(Clone)]
pub struct SamlService {
    repo: Arc<dyn IdentityRepository>,
    store: Arc<dyn EphemeralStore>,
    clock: Arc<dyn Clock>,
    access: ConditionalAccessEvaluator,
    events: Arc<dyn EventSink>,
    metrics: Metrics,
    endpoints: SamlEndpoints,
}

impl SamlService {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        repo: Arc<dyn IdentityRepository>,
        store: Arc<dyn EphemeralStore>,
        clock: Arc<dyn Clock>,
        access: ConditionalAccessEvaluator,
        events: Arc<dyn EventSink>,
        metrics: Metrics,
        endpoints: SamlEndpoints,
    ) -> Self {
        Self {
            repo,
            store,
            clock,
            access,
            events,
            metrics,
            endpoints,
        }
    }

    fn deliver_to_acs(
        &self,
        config: &SamlConfig,
        xml: &str,
        relay_state: Option<&str>,
    ) -> Result<SamlDelivery, SamlError> {
        if config.uses_redirect_binding() {
            Ok(SamlDelivery::Redirect(redirect_location(
                &config.acs_url,
                "SAMLResponse",
                xml,
                relay_state,
            )?))
        } else {
            Ok(SamlDelivery::Post(post_form(&config.acs_url, "SAMLResponse", xml, relay_state)))
        }
    }

    fn failure_to_acs(
        &self,
        config: &SamlConfig,
        in_response_to: Option<&str>,
        error: &SamlError,
        relay_state: Option<&str>,
    ) -> Result<SamlDelivery, SamlError> {
        tracing::warn!(app_id = %config.app_id, error = %error, "SAML SSO refused");
        let xml = status_response(
            &self.endpoints.entity_id,
            &config.acs_url,
            in_response_to,
            self.clock.now(),
            error.status_code(),
            &error.to_string(),
        );
        self.deliver_to_acs(config, &xml, relay_state)
    }

    /// Resolve the SP and, for SP-initiated SSO, record the request id.
    /// Returns the config, the id to answer and whether it was a replay.
    async fn resolve_request(
        &self,
        request: &SsoRequest,
    ) -> Result<(SamlConfig, Option<String>, bool), SamlError> {
        if let Some(encoded) = request.saml_request.as_deref() {
            let binding = request.binding.unwrap_or(SamlBinding::Redirect);
            let authn = parse_authn_request(&decode_message(encoded, binding)?)?;

            let config = self
                .repo
                .find_saml_config_by_entity_id(&authn.issuer)
                .await?
                .ok_or_else(|| {
                    SamlError::Requester(format!("Unknown service provider '{}'", authn.issuer))
                })?;
            if let Some(acs) = &authn.acs_url {
                if acs != &config.acs_url {
                    return Err(SamlError::Requester(
                        "AssertionConsumerServiceURL does not match the registered value".to_string(),
                    ));
                }
            }

            let context = serde_json::to_string(&SamlRequestContext {
                issuer: authn.issuer.clone(),
                acs_url: authn.acs_url.clone(),
            })
            .map_err(|e| SamlError::Responder(e.to_string()))?;
            let fresh = self
                .store
                .put_if_absent(&keys::saml_request(&authn.id), &context, SAML_REQUEST_TTL)
                .await
                .map_err(ServiceError::from)?;
            if fresh {
                self.metrics.artifact_issued(ArtifactKind::SamlRequest);
            }
            return Ok((config, Some(authn.id), !fresh));
        }

        let app_id = request
            .app_id
            .as_deref()
            .filter(|a| !a.is_empty())
            .ok_or_else(|| SamlError::Requester("SAMLRequest or app_id is required".to_string()))?;
        let config = self
            .repo
            .find_saml_config(app_id)
            .await?
            .ok_or_else(|| SamlError::UnknownApplication(app_id.to_string()))?;
        Ok((config, None, false))
    }

    /// Answer an SSO request. Failures that can be addressed to a known SP
    /// are delivered to its ACS as status responses; everything else is
    /// returned as an error.
    pub async fn sso(
        &self,
        request: SsoRequest,
        user: Option<&User>,
        ip: IpAddr,
        user_agent: &str,
    ) -> Result<SamlDelivery, SamlError> {
        let (config, in_response_to, replayed) = self.resolve_request(&request).await?;
        let relay_state = request.relay_state.as_deref();
        let in_response_to = in_response_to.as_deref();

        // A broken key pair is an operator error, never a status response.
        let material = SigningMaterial::from_pem(&config.private_key_pem, &config.certificate_pem)?;

        if replayed {
            self.metrics.artifact_redeemed(ArtifactKind::SamlRequest, false);
            let error = SamlError::Requester("AuthnRequest has already been answered".to_string());
            return self.failure_to_acs(&config, in_response_to, &error, relay_state);
        }

        let Some(user) = user else {
            let error = SamlError::AuthnFailed("No authenticated session".to_string());
            return self.failure_to_acs(&config, in_response_to, &error, relay_state);
        };

        let decision = self
            .access
            .evaluate(&AccessContext {
                user_id: user.user_id,
                app_id: Some(config.app_id.clone()),
                ip,
                user_agent: user_agent.to_string(),
                roles: user.roles.clone(),
                at: self.clock.now(),
                risk_score: None,
            })
            .await?;
        if let Some(reason) = decision.block_reason {
            let error = SamlError::AuthnFailed(format!("Access blocked by policy: {}", reason));
            return self.failure_to_acs(&config, in_response_to, &error, relay_state);
        }

        let name_id = if user.email.is_empty() {
            user.username.as_str()
        } else {
            user.email.as_str()
        };
        let session_index = response::saml_id();
        let now = self.clock.now();
        let xml = signed_response(
            &AssertionParams {
                idp_entity_id: &self.endpoints.entity_id,
                audience: &config.sp_entity_id,
                destination: &config.acs_url,
                in_response_to,
                name_id,
                name_id_format: &config.name_id_format,
                session_index: &session_index,
                attributes: vec![
                    ("username", vec![user.username.clone()]),
                    ("email", vec![user.email.clone()]),
                    ("roles", user.roles.clone()),
                ],
                now,
            },
            &material,
        )?;
        if in_response_to.is_some() {
            self.metrics.artifact_redeemed(ArtifactKind::SamlRequest, true);
        }

        self.events.publish(DomainEvent::new(
            event_types::SAML_ASSERTION_ISSUED,
            Some(user.user_id),
            now,
            serde_json::json!({
                "app_id": config.app_id,
                "sp_entity_id": config.sp_entity_id,
                "sp_initiated": in_response_to.is_some(),
            }),
        ));
        tracing::info!(
            user_id = user.user_id,
            app_id = %config.app_id,
            sp_initiated = in_response_to.is_some(),
            "SAML assertion issued"
        );

        self.deliver_to_acs(&config, &xml, relay_state)
    }

    pub async fn metadata(&self, app_id: &str) -> Result<String, SamlError> {
        let config = self
            .repo
            .find_saml_config(app_id)
            .await?
            .ok_or_else(|| SamlError::UnknownApplication(app_id.to_string()))?;
        metadata::idp_metadata(
            &self.endpoints.entity_id,
            &self.endpoints.sso_url,
            &self.endpoints.slo_url,
            &config.certificate_pem,
        )
    }

    /// Process a `LogoutRequest`: drop the subject's sessions and answer
    /// with a `LogoutResponse`.
    pub async fn slo(&self, request: SloRequest) -> Result<SamlDelivery, SamlError> {
        let logout =
            parse_logout_request(&decode_message(&request.saml_request, request.binding)?)?;
        let config = self
            .repo
            .find_saml_config_by_entity_id(&logout.issuer)
            .await?
            .ok_or_else(|| {
                SamlError::Requester(format!("Unknown service provider '{}'", logout.issuer))
            })?;

        let subject = match self.repo.find_user_by_email(&logout.name_id).await? {
            Some(user) => Some(user),
            None => self.repo.find_user_by_login(&logout.name_id).await?,
        };
        match subject {
            Some(user) => {
                let removed = self.repo.delete_sessions_for_user(user.user_id).await?;
                self.events.publish(DomainEvent::new(
                    event_types::USER_LOGOUT,
                    Some(user.user_id),
                    self.clock.now(),
                    serde_json::json!({
                        "sessions_removed": removed,
                        "via": "saml_slo",
                        "app_id": config.app_id
                    }),
                ));
                tracing::info!(
                    user_id = user.user_id,
                    app_id = %config.app_id,
                    "SAML single logout"
                );
            }
            None => tracing::debug!(app_id = %config.app_id, "SAML logout for unknown subject"),
        }

        let destination = config.slo_url.as_deref().unwrap_or(&config.acs_url);
        let xml = logout_response(
            &self.endpoints.entity_id,
            destination,
            &logout.id,
            self.clock.now(),
        );
        let relay_state = request.relay_state.as_deref();
        match (&config.slo_url, request.binding) {
            (Some(slo_url), SamlBinding::Redirect) => Ok(SamlDelivery::Redirect(redirect_location(
                slo_url,
                "SAMLResponse",
                &xml,
                relay_state,
            )?)),
            _ => Ok(SamlDelivery::Post(post_form(destination, "SAMLResponse", &xml, relay_state))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::federation::NAME_ID_EMAIL;
    use crate::models::{ConditionalAccessPolicy, PolicyActions, Session};
    use crate::services::saml::response::deflate_base64;
    use crate::services::{FixedClock, InMemoryRepository, MemoryStore, RecordingEventSink};
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use chrono::{Duration, TimeZone, Utc};

    struct Fixture {
        saml: SamlService,
        repo: Arc<InMemoryRepository>,
        clock: Arc<FixedClock>,
        user: User,
    }

    fn config(binding: &str) -> SamlConfig {
        SamlConfig {
            app_id: "wiki".into(),
            sp_entity_id: "https://sp.example.com".into(),
            acs_url: "https://sp.example.com/acs".into(),
            acs_binding: binding.into(),
            slo_url: Some("https://sp.example.com/slo".into()),
            name_id_format: NAME_ID_EMAIL.into(),
            certificate_pem: include_str!("../../../tests/fixtures/saml_cert.pem").into(),
            private_key_pem: include_str!("../../../tests/fixtures/jwt_private.pem").into(),
            created_utc: Utc::now(),
        }
    }

    async fn fixture(binding: &str) -> Fixture {
        let clock = Arc::new(FixedClock::new(Utc.with_ymd_and_hms(2024, 6, 5, 12, 0, 0).unwrap()));
        let repo = Arc::new(InMemoryRepository::new());
        let store = Arc::new(MemoryStore::new(clock.clone()));
        repo.insert_saml_config(&config(binding)).await.unwrap();
        let user = repo
            .insert_user(
                &User::new("dana".into(), "dana@example.com".into(), "h".into())
                    .with_roles(&["staff"]),
            )
            .await
            .unwrap();
        let saml = SamlService::new(
            repo.clone(),
            store,
            clock.clone(),
            ConditionalAccessEvaluator::new(repo.clone()),
            Arc::new(RecordingEventSink::new()),
            Metrics::new().unwrap(),
            SamlEndpoints {
                entity_id: "https://idp.test/saml".into(),
                sso_url: "https://idp.test/saml/sso".into(),
                slo_url: "https://idp.test/saml/slo".into(),
            },
        );
        Fixture { saml, repo, clock, user }
    }

    fn authn_request(id: &str) -> String {
        let xml = format!(
            r#"<samlp:AuthnRequest xmlns:samlp="urn:oasis:names:tc:SAML:2.0:protocol" xmlns:saml="urn:oasis:names:tc:SAML:2.0:assertion" ID="{}" Version="2.0"><saml:Issuer>https://sp.example.com</saml:Issuer></samlp:AuthnRequest>"#,
            id
        );
        deflate_base64(&xml).unwrap()
    }

    fn posted_xml(delivery: SamlDelivery) -> String {
        let SamlDelivery::Post(html) = delivery else {
            panic!("expected POST delivery");
        };
        let marker = r#"name="SAMLResponse" value=""#;
        let start = html.find(marker).unwrap() + marker.len();
        let end = html[start..].find('"').unwrap() + start;
        String::from_utf8(STANDARD.decode(&html[start..end]).unwrap()).unwrap()
    }

    fn ip() -> IpAddr {
        "10.0.0.1".parse().unwrap()
    }

    #[tokio::test]
    async fn test_sp_initiated_sso_echoes_request_id() {
        let f = fixture("post").await;
        let request = SsoRequest {
            saml_request: Some(authn_request("_abc")),
            relay_state: Some("rs".into()),
            app_id: None,
            binding: Some(SamlBinding::Redirect),
        };
        let xml = posted_xml(f.saml.sso(request, Some(&f.user), ip(), "ua").await.unwrap());
        assert!(xml.contains(r#"InResponseTo="_abc""#));
        assert!(xml.contains(response::STATUS_SUCCESS));
        assert!(xml.contains("<saml:AttributeValue>staff</saml:AttributeValue>"));
        assert!(xml.contains(">dana@example.com</saml:NameID>"));
    }

    #[tokio::test]
    async fn test_replayed_request_is_refused() {
        let f = fixture("post").await;
        let request = SsoRequest {
            saml_request: Some(authn_request("_once")),
            binding: Some(SamlBinding::Redirect),
            ..Default::default()
        };
        f.saml.sso(request.clone(), Some(&f.user), ip(), "ua").await.unwrap();
        let xml = posted_xml(f.saml.sso(request, Some(&f.user), ip(), "ua").await.unwrap());
        assert!(xml.contains(STATUS_REQUESTER));
        assert!(!xml.contains("<saml:Assertion"));
    }

    #[tokio::test]
    async fn test_no_session_is_authn_failed() {
        let f = fixture("post").await;
        let request = SsoRequest {
            app_id: Some("wiki".into()),
            ..Default::default()
        };
        let xml = posted_xml(f.saml.sso(request, None, ip(), "ua").await.unwrap());
        assert!(xml.contains(STATUS_AUTHN_FAILED));
    }

    #[tokio::test]
    async fn test_policy_block_is_authn_failed() {
        let f = fixture("post").await;
        f.repo
            .insert_policy(
                &ConditionalAccessPolicy::new("no wiki", 100, vec![], PolicyActions::block())
                    .unwrap(),
            )
            .await
            .unwrap();
        let request = SsoRequest {
            app_id: Some("wiki".into()),
            ..Default::default()
        };
        let xml = posted_xml(f.saml.sso(request, Some(&f.user), ip(), "ua").await.unwrap());
        assert!(xml.contains(STATUS_AUTHN_FAILED));
        assert!(xml.contains("no wiki"));
    }

    #[tokio::test]
    async fn test_redirect_binding_to_acs() {
        let f = fixture("redirect").await;
        let request = SsoRequest {
            app_id: Some("wiki".into()),
            ..Default::default()
        };
        let delivery = f.saml.sso(request, Some(&f.user), ip(), "ua").await.unwrap();
        assert!(matches!(
            delivery,
            SamlDelivery::Redirect(ref url)
                if url.starts_with("https://sp.example.com/acs?SAMLResponse=")
        ));
    }

    #[tokio::test]
    async fn test_missing_key_pair_is_configuration_error() {
        let f = fixture("post").await;
        let mut broken = config("post");
        broken.app_id = "broken".into();
        broken.sp_entity_id = "https://broken.example.com".into();
        broken.private_key_pem = String::new();
        f.repo.insert_saml_config(&broken).await.unwrap();

        let request = SsoRequest {
            app_id: Some("broken".into()),
            ..Default::default()
        };
        assert!(matches!(
            f.saml.sso(request, Some(&f.user), ip(), "ua").await,
            Err(SamlError::Configuration(_))
        ));
    }

    #[tokio::test]
    async fn test_unknown_app_and_unknown_sp() {
        let f = fixture("post").await;
        let request = SsoRequest {
            app_id: Some("nope".into()),
            ..Default::default()
        };
        assert!(matches!(
            f.saml.sso(request, Some(&f.user), ip(), "ua").await,
            Err(SamlError::UnknownApplication(_))
        ));
        assert!(matches!(f.saml.metadata("nope").await, Err(SamlError::UnknownApplication(_))));
    }

    #[tokio::test]
    async fn test_slo_removes_sessions() {
        let f = fixture("post").await;
        let now = f.clock.now();
        f.repo
            .insert_session(&Session::new(
                f.user.user_id,
                "10.0.0.1",
                "ua",
                now,
                now + Duration::minutes(15),
            ))
            .await
            .unwrap();

        let xml = r#"<samlp:LogoutRequest xmlns:samlp="urn:oasis:names:tc:SAML:2.0:protocol" xmlns:saml="urn:oasis:names:tc:SAML:2.0:assertion" ID="_lr9" Version="2.0"><saml:Issuer>https://sp.example.com</saml:Issuer><saml:NameID>dana@example.com</saml:NameID></samlp:LogoutRequest>"#;
        let delivery = f
            .saml
            .slo(SloRequest {
                saml_request: deflate_base64(xml).unwrap(),
                relay_state: None,
                binding: SamlBinding::Redirect,
            })
            .await
            .unwrap();
        assert!(matches!(
            delivery,
            SamlDelivery::Redirect(ref url)
                if url.starts_with("https://sp.example.com/slo?SAMLResponse=")
        ));
        assert_eq!(f.repo.delete_sessions_for_user(f.user.user_id).await.unwrap(), 0);
    }
}
