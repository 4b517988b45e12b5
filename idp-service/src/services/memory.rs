//! In-memory `IdentityRepository` for local development and tests.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::models::{
    CasService, ConditionalAccessPolicy, Device, LoginAttempt, MfaDevice, OAuthClient, OAuthToken,
    SamlConfig, Session, User,
};
use crate::services::{IdentityRepository, ServiceError};

#[derive(Default)]
struct Tables {
    next_id: i64,
    users: Vec<User>,
    devices: Vec<Device>,
    login_attempts: Vec<LoginAttempt>,
    mfa_devices: Vec<MfaDevice>,
    policies: Vec<ConditionalAccessPolicy>,
    sessions: HashMap<Uuid, Session>,
    oauth_clients: HashMap<String, OAuthClient>,
    oauth_tokens: HashMap<String, OAuthToken>,
    saml_configs: Vec<SamlConfig>,
    cas_services: Vec<CasService>,
}

impl Tables {
    fn next_id(&mut self) -> i64 {
        self.next_id += 1;
        self.next_id
    }
}

#[derive(Default)]
pub struct InMemoryRepository {
    tables: RwLock<Tables>,
    unavailable: AtomicBool,
}

impl InMemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate a database outage: every call fails until switched back.
    pub fn set_available(&self, available: bool) {
        self.unavailable.store(!available, Ordering::SeqCst);
    }

    fn check(&self) -> Result<(), ServiceError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(ServiceError::Database(sqlx::Error::PoolTimedOut));
        }
        Ok(())
    }
}

#[async_trait]
impl IdentityRepository for InMemoryRepository {
    async fn health_check(&self) -> Result<(), ServiceError> {
        self.check()?;
        Ok(())
    }

    // ==================== Users ====================

    async fn insert_user(&self, user: &User) -> Result<User, ServiceError> {
        self.check()?;
        let mut tables = self.tables.write().await;
        let taken = tables.users.iter().any(|u| {
            u.username.eq_ignore_ascii_case(&user.username)
                || u.email.eq_ignore_ascii_case(&user.email)
        });
        if taken {
            return Err(ServiceError::Validation(
                "Username or email already registered".to_string(),
            ));
        }
        let mut stored = user.clone();
        stored.user_id = tables.next_id();
        tables.users.push(stored.clone());
        Ok(stored)
    }

    async fn find_user_by_id(&self, user_id: i64) -> Result<Option<User>, ServiceError> {
        self.check()?;
        let tables = self.tables.read().await;
        Ok(tables.users.iter().find(|u| u.user_id == user_id).cloned())
    }

    async fn find_user_by_login(&self, login: &str) -> Result<Option<User>, ServiceError> {
        self.check()?;
        let tables = self.tables.read().await;
        let by_username = tables
            .users
            .iter()
            .find(|u| u.username.eq_ignore_ascii_case(login));
        Ok(by_username
            .or_else(|| tables.users.iter().find(|u| u.email.eq_ignore_ascii_case(login)))
            .cloned())
    }

    async fn find_user_by_email(&self, email: &str) -> Result<Option<User>, ServiceError> {
        self.check()?;
        let tables = self.tables.read().await;
        Ok(tables
            .users
            .iter()
            .find(|u| u.email.eq_ignore_ascii_case(email))
            .cloned())
    }

    async fn update_password(&self, user_id: i64, password_hash: &str) -> Result<(), ServiceError> {
        self.check()?;
        let mut tables = self.tables.write().await;
        let user = tables
            .users
            .iter_mut()
            .find(|u| u.user_id == user_id)
            .ok_or(ServiceError::UserNotFound)?;
        user.password_hash = password_hash.to_string();
        Ok(())
    }

    async fn update_last_login(&self, user_id: i64, at: DateTime<Utc>) -> Result<(), ServiceError> {
        self.check()?;
        let mut tables = self.tables.write().await;
        if let Some(user) = tables.users.iter_mut().find(|u| u.user_id == user_id) {
            user.last_login_utc = Some(at);
        }
        Ok(())
    }

    // ==================== Devices ====================

    async fn find_device(
        &self,
        user_id: i64,
        device_id: &str,
    ) -> Result<Option<Device>, ServiceError> {
        self.check()?;
        let tables = self.tables.read().await;
        Ok(tables
            .devices
            .iter()
            .find(|d| d.user_id == user_id && d.device_id == device_id)
            .cloned())
    }

    async fn record_device_login(
        &self,
        user_id: i64,
        device_id: &str,
        user_agent: &str,
        ip: &str,
        at: DateTime<Utc>,
    ) -> Result<Device, ServiceError> {
        self.check()?;
        let mut tables = self.tables.write().await;
        if let Some(device) = tables
            .devices
            .iter_mut()
            .find(|d| d.user_id == user_id && d.device_id == device_id)
        {
            device.login_count += 1;
            device.user_agent = user_agent.to_string();
            device.last_ip = ip.to_string();
            device.last_seen_utc = at;
            return Ok(device.clone());
        }
        let mut device = Device::new(user_id, device_id.to_string(), user_agent, ip, at);
        device.device_row_id = tables.next_id();
        tables.devices.push(device.clone());
        Ok(device)
    }

    async fn set_device_trusted(
        &self,
        user_id: i64,
        device_id: &str,
        trusted: bool,
    ) -> Result<(), ServiceError> {
        self.check()?;
        let mut tables = self.tables.write().await;
        if let Some(device) = tables
            .devices
            .iter_mut()
            .find(|d| d.user_id == user_id && d.device_id == device_id)
        {
            device.trusted = trusted;
        }
        Ok(())
    }

    // ==================== Login attempts ====================

    async fn insert_login_attempt(&self, attempt: &LoginAttempt) -> Result<(), ServiceError> {
        self.check()?;
        let mut tables = self.tables.write().await;
        let mut stored = attempt.clone();
        stored.attempt_id = tables.next_id();
        tables.login_attempts.push(stored);
        Ok(())
    }

    async fn count_recent_failures(
        &self,
        username: &str,
        since: DateTime<Utc>,
    ) -> Result<i64, ServiceError> {
        self.check()?;
        let tables = self.tables.read().await;
        Ok(tables
            .login_attempts
            .iter()
            .filter(|a| {
                !a.success && a.created_utc >= since && a.username.eq_ignore_ascii_case(username)
            })
            .count() as i64)
    }

    async fn has_successful_login_from_ip(
        &self,
        user_id: i64,
        ip: &str,
    ) -> Result<bool, ServiceError> {
        self.check()?;
        let tables = self.tables.read().await;
        Ok(tables
            .login_attempts
            .iter()
            .any(|a| a.success && a.user_id == Some(user_id) && a.ip_address == ip))
    }

    async fn list_login_attempts(
        &self,
        username: &str,
        limit: i64,
    ) -> Result<Vec<LoginAttempt>, ServiceError> {
        self.check()?;
        let tables = self.tables.read().await;
        Ok(tables
            .login_attempts
            .iter()
            .rev()
            .filter(|a| a.username.eq_ignore_ascii_case(username))
            .take(limit.max(0) as usize)
            .cloned()
            .collect())
    }

    // ==================== MFA ====================

    async fn insert_mfa_device(&self, device: &MfaDevice) -> Result<(), ServiceError> {
        self.check()?;
        let mut tables = self.tables.write().await;
        let mut stored = device.clone();
        stored.mfa_device_id = tables.next_id();
        tables.mfa_devices.push(stored);
        Ok(())
    }

    async fn list_verified_mfa_devices(
        &self,
        user_id: i64,
    ) -> Result<Vec<MfaDevice>, ServiceError> {
        self.check()?;
        let tables = self.tables.read().await;
        Ok(tables
            .mfa_devices
            .iter()
            .filter(|d| d.user_id == user_id && d.verified)
            .cloned()
            .collect())
    }

    // ==================== Conditional access ====================

    async fn insert_policy(&self, policy: &ConditionalAccessPolicy) -> Result<i64, ServiceError> {
        self.check()?;
        let mut tables = self.tables.write().await;
        let mut stored = policy.clone();
        stored.policy_id = tables.next_id();
        let id = stored.policy_id;
        tables.policies.push(stored);
        Ok(id)
    }

    async fn list_enabled_policies(&self) -> Result<Vec<ConditionalAccessPolicy>, ServiceError> {
        self.check()?;
        let tables = self.tables.read().await;
        let mut policies: Vec<ConditionalAccessPolicy> =
            tables.policies.iter().filter(|p| p.enabled).cloned().collect();
        // stable: equal priorities keep insertion order
        policies.sort_by(|a, b| b.priority.cmp(&a.priority));
        Ok(policies)
    }

    // ==================== Sessions ====================

    async fn insert_session(&self, session: &Session) -> Result<(), ServiceError> {
        self.check()?;
        let mut tables = self.tables.write().await;
        tables.sessions.insert(session.session_id, session.clone());
        Ok(())
    }

    async fn find_session(&self, session_id: Uuid) -> Result<Option<Session>, ServiceError> {
        self.check()?;
        let tables = self.tables.read().await;
        Ok(tables.sessions.get(&session_id).cloned())
    }

    async fn delete_sessions_for_user(&self, user_id: i64) -> Result<u64, ServiceError> {
        self.check()?;
        let mut tables = self.tables.write().await;
        let before = tables.sessions.len();
        tables.sessions.retain(|_, s| s.user_id != user_id);
        Ok((before - tables.sessions.len()) as u64)
    }

    // ==================== OAuth2 ====================

    async fn insert_oauth_client(&self, client: &OAuthClient) -> Result<(), ServiceError> {
        self.check()?;
        let mut tables = self.tables.write().await;
        tables
            .oauth_clients
            .insert(client.client_id.clone(), client.clone());
        Ok(())
    }

    async fn find_oauth_client(
        &self,
        client_id: &str,
    ) -> Result<Option<OAuthClient>, ServiceError> {
        self.check()?;
        let tables = self.tables.read().await;
        Ok(tables.oauth_clients.get(client_id).cloned())
    }

    async fn insert_oauth_token(&self, token: &OAuthToken) -> Result<(), ServiceError> {
        self.check()?;
        let mut tables = self.tables.write().await;
        tables
            .oauth_tokens
            .insert(token.token_hash.clone(), token.clone());
        Ok(())
    }

    async fn find_oauth_token(&self, token_hash: &str) -> Result<Option<OAuthToken>, ServiceError> {
        self.check()?;
        let tables = self.tables.read().await;
        Ok(tables.oauth_tokens.get(token_hash).cloned())
    }

    // ==================== SAML / CAS ====================

    async fn insert_saml_config(&self, config: &SamlConfig) -> Result<(), ServiceError> {
        self.check()?;
        let mut tables = self.tables.write().await;
        tables.saml_configs.retain(|c| c.app_id != config.app_id);
        tables.saml_configs.push(config.clone());
        Ok(())
    }

    async fn find_saml_config(&self, app_id: &str) -> Result<Option<SamlConfig>, ServiceError> {
        self.check()?;
        let tables = self.tables.read().await;
        Ok(tables.saml_configs.iter().find(|c| c.app_id == app_id).cloned())
    }

    async fn find_saml_config_by_entity_id(
        &self,
        entity_id: &str,
    ) -> Result<Option<SamlConfig>, ServiceError> {
        self.check()?;
        let tables = self.tables.read().await;
        Ok(tables
            .saml_configs
            .iter()
            .find(|c| c.sp_entity_id == entity_id)
            .cloned())
    }

    async fn insert_cas_service(&self, service: &CasService) -> Result<(), ServiceError> {
        self.check()?;
        let mut tables = self.tables.write().await;
        let mut stored = service.clone();
        stored.cas_service_id = tables.next_id();
        tables.cas_services.push(stored);
        Ok(())
    }

    async fn find_cas_service_for(
        &self,
        service_url: &str,
    ) -> Result<Option<CasService>, ServiceError> {
        self.check()?;
        let tables = self.tables.read().await;
        Ok(tables
            .cas_services
            .iter()
            .filter(|s| s.covers(service_url))
            .max_by_key(|s| s.service_prefix.len())
            .cloned())
    }
}
