//! Services layer for the identity provider.
//!
//! Risk scoring, conditional access, the login pipeline, token issuance and
//! the OAuth2, SAML and CAS protocol state machines, plus the persistence and
//! delivery seams they run on.

pub mod bootstrap;
pub mod cas;
mod clock;
pub mod conditional_access;
mod database;
pub mod delivery;
pub mod ephemeral;
pub mod error;
pub mod events;
pub mod issuance;
mod jwt;
pub mod login;
mod memory;
pub mod metrics;
pub mod notification;
pub mod oauth2;
mod repository;
pub mod risk;
pub mod saml;
pub mod totp;

pub use cas::{CasError, CasServer};
pub use clock::{Clock, FixedClock, SystemClock};
pub use conditional_access::{AccessDecision, ConditionalAccessEvaluator};
pub use database::PgRepository;
pub use ephemeral::{EphemeralStore, MemoryStore, RedisStore, StoreError};
pub use error::ServiceError;
pub use events::{DomainEvent, EventSink, RecordingEventSink, WebhookDispatcher};
pub use issuance::{IssuanceService, IssuedTokens, OAuthTokenSet, RefreshedAccess};
pub use jwt::{AccessTokenClaims, IdTokenClaims, Jwk, JwkSet, TokenService};
pub use login::{LoginOutcome, LoginRequestContext, LoginService};
pub use memory::InMemoryRepository;
pub use metrics::Metrics;
pub use notification::{
    LogNotifier, Notification, NotificationQueue, Notifier, RecordingNotifier, SmsGatewayNotifier,
    SmtpNotifier,
};
pub use oauth2::{OAuth2Service, OAuthError};
pub use repository::IdentityRepository;
pub use risk::{RiskAssessment, RiskEngine, RiskFactors};
pub use saml::{SamlDelivery, SamlEndpoints, SamlError, SamlService};
