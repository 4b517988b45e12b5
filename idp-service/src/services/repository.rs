//! Persistence seam for the identity core.
//!
//! Every method returns a fully populated value (users carry their role
//! names); nothing is loaded lazily behind the caller's back.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::models::{
    CasService, ConditionalAccessPolicy, Device, LoginAttempt, MfaDevice, OAuthClient, OAuthToken,
    SamlConfig, Session, User,
};
use crate::services::ServiceError;

#[async_trait]
pub trait IdentityRepository: Send + Sync {
    async fn health_check(&self) -> Result<(), ServiceError>;

    // ==================== Users ====================

    async fn insert_user(&self, user: &User) -> Result<User, ServiceError>;

    async fn find_user_by_id(&self, user_id: i64) -> Result<Option<User>, ServiceError>;

    /// Case-insensitive lookup by username, falling back to email.
    async fn find_user_by_login(&self, login: &str) -> Result<Option<User>, ServiceError>;

    async fn find_user_by_email(&self, email: &str) -> Result<Option<User>, ServiceError>;

    async fn update_password(&self, user_id: i64, password_hash: &str) -> Result<(), ServiceError>;

    async fn update_last_login(&self, user_id: i64, at: DateTime<Utc>) -> Result<(), ServiceError>;

    // ==================== Devices ====================

    async fn find_device(
        &self,
        user_id: i64,
        device_id: &str,
    ) -> Result<Option<Device>, ServiceError>;

    /// Create the device on first sight, otherwise bump its counters and
    /// last-seen data.
    async fn record_device_login(
        &self,
        user_id: i64,
        device_id: &str,
        user_agent: &str,
        ip: &str,
        at: DateTime<Utc>,
    ) -> Result<Device, ServiceError>;

    async fn set_device_trusted(
        &self,
        user_id: i64,
        device_id: &str,
        trusted: bool,
    ) -> Result<(), ServiceError>;

    // ==================== Login attempts ====================

    async fn insert_login_attempt(&self, attempt: &LoginAttempt) -> Result<(), ServiceError>;

    async fn count_recent_failures(
        &self,
        username: &str,
        since: DateTime<Utc>,
    ) -> Result<i64, ServiceError>;

    async fn has_successful_login_from_ip(
        &self,
        user_id: i64,
        ip: &str,
    ) -> Result<bool, ServiceError>;

    /// Newest first.
    async fn list_login_attempts(
        &self,
        username: &str,
        limit: i64,
    ) -> Result<Vec<LoginAttempt>, ServiceError>;

    // ==================== MFA ====================

    async fn insert_mfa_device(&self, device: &MfaDevice) -> Result<(), ServiceError>;

    /// Verified devices in enrolment order.
    async fn list_verified_mfa_devices(&self, user_id: i64) -> Result<Vec<MfaDevice>, ServiceError>;

    // ==================== Conditional access ====================

    async fn insert_policy(&self, policy: &ConditionalAccessPolicy) -> Result<i64, ServiceError>;

    /// Enabled policies, priority descending, ties in insertion order.
    async fn list_enabled_policies(&self) -> Result<Vec<ConditionalAccessPolicy>, ServiceError>;

    // ==================== Sessions ====================

    async fn insert_session(&self, session: &Session) -> Result<(), ServiceError>;

    async fn find_session(&self, session_id: Uuid) -> Result<Option<Session>, ServiceError>;

    async fn delete_sessions_for_user(&self, user_id: i64) -> Result<u64, ServiceError>;

    // ==================== OAuth2 ====================

    async fn insert_oauth_client(&self, client: &OAuthClient) -> Result<(), ServiceError>;

    async fn find_oauth_client(&self, client_id: &str) -> Result<Option<OAuthClient>, ServiceError>;

    async fn insert_oauth_token(&self, token: &OAuthToken) -> Result<(), ServiceError>;

    async fn find_oauth_token(&self, token_hash: &str) -> Result<Option<OAuthToken>, ServiceError>;

    // ==================== SAML / CAS ====================

    async fn insert_saml_config(&self, config: &SamlConfig) -> Result<(), ServiceError>;

    async fn find_saml_config(&self, app_id: &str) -> Result<Option<SamlConfig>, ServiceError>;

    async fn find_saml_config_by_entity_id(
        &self,
        entity_id: &str,
    ) -> Result<Option<SamlConfig>, ServiceError>;

    async fn insert_cas_service(&self, service: &CasService) -> Result<(), ServiceError>;

    /// Longest enabled prefix covering `service_url`.
    async fn find_cas_service_for(
        &self,
        service_url: &str,
    ) -> Result<Option<CasService>, ServiceError>;
}
