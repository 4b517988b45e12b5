//! Per-application federation settings for SAML service providers and CAS
//! services.

use chrono::{DateTime, Utc};
use sqlx::FromRow;

#[derive(Debug, Clone, FromRow)]
pub struct SamlConfig {
    pub app_id: String,
    pub sp_entity_id: String,
    pub acs_url: String,
    /// `post` or `redirect`
    pub acs_binding: String,
    pub slo_url: Option<String>,
    pub name_id_format: String,
    /// PEM certificate published in metadata and `ds:KeyInfo`.
    pub certificate_pem: String,
    /// PEM private key (PKCS#8 or PKCS#1) used to sign assertions.
    pub private_key_pem: String,
    pub created_utc: DateTime<Utc>,
}

pub const NAME_ID_EMAIL: &str = "urn:oasis:names:tc:SAML:1.1:nameid-format:emailAddress";

impl SamlConfig {
    pub fn uses_redirect_binding(&self) -> bool {
        self.acs_binding.eq_ignore_ascii_case("redirect")
    }
}

/// A relying CAS service. Tickets are only issued for URLs under
/// `service_prefix`.
#[derive(Debug, Clone, FromRow)]
pub struct CasService {
    pub cas_service_id: i64,
    pub app_id: String,
    pub service_prefix: String,
    pub enabled: bool,
    pub created_utc: DateTime<Utc>,
}

impl CasService {
    pub fn new(app_id: &str, service_prefix: &str) -> Self {
        Self {
            cas_service_id: 0,
            app_id: app_id.to_string(),
            service_prefix: service_prefix.to_string(),
            enabled: true,
            created_utc: Utc::now(),
        }
    }

    pub fn covers(&self, service_url: &str) -> bool {
        self.enabled && service_url.starts_with(&self.service_prefix)
    }
}
