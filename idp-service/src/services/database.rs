//! PostgreSQL `IdentityRepository`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{postgres::PgPool, types::Json, FromRow};
use uuid::Uuid;

use crate::models::{
    CasService, Condition, ConditionalAccessPolicy, Device, LoginAttempt, MfaDevice, OAuthClient,
    OAuthToken, PolicyActions, SamlConfig, Session, User,
};
use crate::services::{IdentityRepository, ServiceError};

const USER_SELECT: &str = r#"
    SELECT u.user_id, u.username, u.email, u.password_hash, u.status_code, u.mfa_enabled,
           u.last_login_utc, u.created_utc,
           COALESCE(ARRAY_AGG(r.role_name ORDER BY r.role_name)
                    FILTER (WHERE r.role_name IS NOT NULL), '{}'::TEXT[]) AS roles
    FROM users u
    LEFT JOIN user_roles r ON r.user_id = u.user_id
"#;

#[derive(FromRow)]
struct PolicyRow {
    policy_id: i64,
    policy_name: String,
    priority: i32,
    enabled: bool,
    conditions: Json<Vec<Condition>>,
    actions: Json<PolicyActions>,
    created_utc: DateTime<Utc>,
}

impl TryFrom<PolicyRow> for ConditionalAccessPolicy {
    type Error = ServiceError;

    fn try_from(row: PolicyRow) -> Result<Self, Self::Error> {
        let mut policy = ConditionalAccessPolicy::new(
            &row.policy_name,
            row.priority,
            row.conditions.0,
            row.actions.0,
        )
        .map_err(|e| {
            tracing::error!(
                policy_id = row.policy_id,
                error = %e,
                "Stored policy failed validation"
            );
            ServiceError::Internal(anyhow::anyhow!(
                "Invalid stored policy {}: {}",
                row.policy_id,
                e
            ))
        })?;
        policy.policy_id = row.policy_id;
        policy.enabled = row.enabled;
        policy.created_utc = row.created_utc;
        Ok(policy)
    }
}

/// PostgreSQL database wrapper.
#[derive(Clone)]
pub struct PgRepository {
    pool: PgPool,
}

impl PgRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn find_user_where(
        &self,
        clause: &str,
        value: &str,
    ) -> Result<Option<User>, ServiceError> {
        let sql = format!("{} WHERE {} GROUP BY u.user_id", USER_SELECT, clause);
        Ok(sqlx::query_as::<_, User>(&sql)
            .bind(value)
            .fetch_optional(&self.pool)
            .await?)
    }
}

#[async_trait]
impl IdentityRepository for PgRepository {
    async fn health_check(&self) -> Result<(), ServiceError> {
        sqlx::query("SELECT 1").execute(&self.pool).await.map_err(|e| {
            tracing::error!("Database health check failed: {}", e);
            ServiceError::Database(e)
        })?;
        Ok(())
    }

    // ==================== Users ====================

    async fn insert_user(&self, user: &User) -> Result<User, ServiceError> {
        let mut tx = self.pool.begin().await?;
        let user_id: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO users (username, email, password_hash, status_code, mfa_enabled, last_login_utc, created_utc)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            RETURNING user_id
            "#,
        )
        .bind(&user.username)
        .bind(&user.email)
        .bind(&user.password_hash)
        .bind(&user.status_code)
        .bind(user.mfa_enabled)
        .bind(user.last_login_utc)
        .bind(user.created_utc)
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| match e {
            sqlx::Error::Database(ref db_err) if db_err.is_unique_violation() => {
                ServiceError::Validation("Username or email already registered".to_string())
            }
            other => ServiceError::Database(other),
        })?;

        for role in &user.roles {
            sqlx::query("INSERT INTO user_roles (user_id, role_name) VALUES ($1, $2)")
                .bind(user_id)
                .bind(role)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;

        let mut stored = user.clone();
        stored.user_id = user_id;
        Ok(stored)
    }

    async fn find_user_by_id(&self, user_id: i64) -> Result<Option<User>, ServiceError> {
        let sql = format!("{} WHERE u.user_id = $1 GROUP BY u.user_id", USER_SELECT);
        Ok(sqlx::query_as::<_, User>(&sql)
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await?)
    }

    async fn find_user_by_login(&self, login: &str) -> Result<Option<User>, ServiceError> {
        match self.find_user_where("LOWER(u.username) = LOWER($1)", login).await? {
            Some(user) => Ok(Some(user)),
            None => self.find_user_by_email(login).await,
        }
    }

    async fn find_user_by_email(&self, email: &str) -> Result<Option<User>, ServiceError> {
        self.find_user_where("LOWER(u.email) = LOWER($1)", email).await
    }

    async fn update_password(&self, user_id: i64, password_hash: &str) -> Result<(), ServiceError> {
        let result = sqlx::query("UPDATE users SET password_hash = $1 WHERE user_id = $2")
            .bind(password_hash)
            .bind(user_id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(ServiceError::UserNotFound);
        }
        Ok(())
    }

    async fn update_last_login(&self, user_id: i64, at: DateTime<Utc>) -> Result<(), ServiceError> {
        sqlx::query("UPDATE users SET last_login_utc = $1 WHERE user_id = $2")
            .bind(at)
            .bind(user_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    // ==================== Devices ====================

    async fn find_device(
        &self,
        user_id: i64,
        device_id: &str,
    ) -> Result<Option<Device>, ServiceError> {
        Ok(sqlx::query_as::<_, Device>(
            "SELECT * FROM devices WHERE user_id = $1 AND device_id = $2",
        )
        .bind(user_id)
        .bind(device_id)
        .fetch_optional(&self.pool)
        .await?)
    }

    async fn record_device_login(
        &self,
        user_id: i64,
        device_id: &str,
        user_agent: &str,
        ip: &str,
        at: DateTime<Utc>,
    ) -> Result<Device, ServiceError> {
        Ok(sqlx::query_as::<_, Device>(
            r#"
            INSERT INTO devices (user_id, device_id, user_agent, last_ip, first_seen_utc, last_seen_utc)
            VALUES ($1, $2, $3, $4, $5, $5)
            ON CONFLICT (user_id, device_id) DO UPDATE
            SET login_count = devices.login_count + 1,
                user_agent = EXCLUDED.user_agent,
                last_ip = EXCLUDED.last_ip,
                last_seen_utc = EXCLUDED.last_seen_utc
            RETURNING *
            "#,
        )
        .bind(user_id)
        .bind(device_id)
        .bind(user_agent)
        .bind(ip)
        .bind(at)
        .fetch_one(&self.pool)
        .await?)
    }

    async fn set_device_trusted(
        &self,
        user_id: i64,
        device_id: &str,
        trusted: bool,
    ) -> Result<(), ServiceError> {
        sqlx::query("UPDATE devices SET trusted = $1 WHERE user_id = $2 AND device_id = $3")
            .bind(trusted)
            .bind(user_id)
            .bind(device_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    // ==================== Login attempts ====================

    async fn insert_login_attempt(&self, attempt: &LoginAttempt) -> Result<(), ServiceError> {
        sqlx::query(
            r#"
            INSERT INTO login_attempts
                (user_id, username, ip_address, user_agent, success, failure_reason, risk_score, mfa_required, created_utc)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#,
        )
        .bind(attempt.user_id)
        .bind(&attempt.username)
        .bind(&attempt.ip_address)
        .bind(&attempt.user_agent)
        .bind(attempt.success)
        .bind(&attempt.failure_reason)
        .bind(attempt.risk_score)
        .bind(attempt.mfa_required)
        .bind(attempt.created_utc)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn count_recent_failures(
        &self,
        username: &str,
        since: DateTime<Utc>,
    ) -> Result<i64, ServiceError> {
        Ok(sqlx::query_scalar(
            "SELECT COUNT(*) FROM login_attempts WHERE LOWER(username) = LOWER($1) AND NOT success AND created_utc >= $2",
        )
        .bind(username)
        .bind(since)
        .fetch_one(&self.pool)
        .await?)
    }

    async fn has_successful_login_from_ip(
        &self,
        user_id: i64,
        ip: &str,
    ) -> Result<bool, ServiceError> {
        Ok(sqlx::query_scalar(
            "SELECT EXISTS (SELECT 1 FROM login_attempts WHERE user_id = $1 AND ip_address = $2 AND success)",
        )
        .bind(user_id)
        .bind(ip)
        .fetch_one(&self.pool)
        .await?)
    }

    async fn list_login_attempts(
        &self,
        username: &str,
        limit: i64,
    ) -> Result<Vec<LoginAttempt>, ServiceError> {
        Ok(sqlx::query_as::<_, LoginAttempt>(
            "SELECT * FROM login_attempts WHERE LOWER(username) = LOWER($1) ORDER BY attempt_id DESC LIMIT $2",
        )
        .bind(username)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?)
    }

    // ==================== MFA ====================

    async fn insert_mfa_device(&self, device: &MfaDevice) -> Result<(), ServiceError> {
        sqlx::query(
            r#"
            INSERT INTO mfa_devices (user_id, method_code, secret, contact, verified, created_utc)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(device.user_id)
        .bind(&device.method_code)
        .bind(&device.secret)
        .bind(&device.contact)
        .bind(device.verified)
        .bind(device.created_utc)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list_verified_mfa_devices(
        &self,
        user_id: i64,
    ) -> Result<Vec<MfaDevice>, ServiceError> {
        Ok(sqlx::query_as::<_, MfaDevice>(
            "SELECT * FROM mfa_devices WHERE user_id = $1 AND verified ORDER BY mfa_device_id",
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?)
    }

    // ==================== Conditional access ====================

    async fn insert_policy(&self, policy: &ConditionalAccessPolicy) -> Result<i64, ServiceError> {
        Ok(sqlx::query_scalar(
            r#"
            INSERT INTO conditional_access_policies (policy_name, priority, enabled, conditions, actions, created_utc)
            VALUES ($1, $2, $3, $4, $5, $6)
            RETURNING policy_id
            "#,
        )
        .bind(&policy.name)
        .bind(policy.priority)
        .bind(policy.enabled)
        .bind(Json(policy.conditions()))
        .bind(Json(policy.actions()))
        .bind(policy.created_utc)
        .fetch_one(&self.pool)
        .await?)
    }

    async fn list_enabled_policies(&self) -> Result<Vec<ConditionalAccessPolicy>, ServiceError> {
        let rows = sqlx::query_as::<_, PolicyRow>(
            "SELECT * FROM conditional_access_policies WHERE enabled ORDER BY priority DESC, policy_id ASC",
        )
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(ConditionalAccessPolicy::try_from).collect()
    }

    // ==================== Sessions ====================

    async fn insert_session(&self, session: &Session) -> Result<(), ServiceError> {
        sqlx::query(
            r#"
            INSERT INTO sessions (session_id, user_id, ip_address, user_agent, expires_utc, created_utc)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(session.session_id)
        .bind(session.user_id)
        .bind(&session.ip_address)
        .bind(&session.user_agent)
        .bind(session.expires_utc)
        .bind(session.created_utc)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn find_session(&self, session_id: Uuid) -> Result<Option<Session>, ServiceError> {
        Ok(sqlx::query_as::<_, Session>("SELECT * FROM sessions WHERE session_id = $1")
            .bind(session_id)
            .fetch_optional(&self.pool)
            .await?)
    }

    async fn delete_sessions_for_user(&self, user_id: i64) -> Result<u64, ServiceError> {
        let result = sqlx::query("DELETE FROM sessions WHERE user_id = $1")
            .bind(user_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    // ==================== OAuth2 ====================

    async fn insert_oauth_client(&self, client: &OAuthClient) -> Result<(), ServiceError> {
        sqlx::query(
            r#"
            INSERT INTO oauth_clients
                (client_id, client_secret_hash, client_name, app_id, redirect_uris, allowed_scopes, grant_types, created_utc)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(&client.client_id)
        .bind(&client.client_secret_hash)
        .bind(&client.client_name)
        .bind(&client.app_id)
        .bind(&client.redirect_uris)
        .bind(&client.allowed_scopes)
        .bind(&client.grant_types)
        .bind(client.created_utc)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn find_oauth_client(
        &self,
        client_id: &str,
    ) -> Result<Option<OAuthClient>, ServiceError> {
        Ok(
            sqlx::query_as::<_, OAuthClient>("SELECT * FROM oauth_clients WHERE client_id = $1")
                .bind(client_id)
                .fetch_optional(&self.pool)
                .await?,
        )
    }

    async fn insert_oauth_token(&self, token: &OAuthToken) -> Result<(), ServiceError> {
        sqlx::query(
            r#"
            INSERT INTO oauth_tokens (token_id, token_hash, client_id, user_id, scope, expires_utc, created_utc)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(token.token_id)
        .bind(&token.token_hash)
        .bind(&token.client_id)
        .bind(token.user_id)
        .bind(&token.scope)
        .bind(token.expires_utc)
        .bind(token.created_utc)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn find_oauth_token(&self, token_hash: &str) -> Result<Option<OAuthToken>, ServiceError> {
        Ok(
            sqlx::query_as::<_, OAuthToken>("SELECT * FROM oauth_tokens WHERE token_hash = $1")
                .bind(token_hash)
                .fetch_optional(&self.pool)
                .await?,
        )
    }

    // ==================== SAML / CAS ====================

    async fn insert_saml_config(&self, config: &SamlConfig) -> Result<(), ServiceError> {
        sqlx::query(
            r#"
            INSERT INTO saml_configs
                (app_id, sp_entity_id, acs_url, acs_binding, slo_url, name_id_format, certificate_pem, private_key_pem, created_utc)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            ON CONFLICT (app_id) DO UPDATE
            SET sp_entity_id = EXCLUDED.sp_entity_id,
                acs_url = EXCLUDED.acs_url,
                acs_binding = EXCLUDED.acs_binding,
                slo_url = EXCLUDED.slo_url,
                name_id_format = EXCLUDED.name_id_format,
                certificate_pem = EXCLUDED.certificate_pem,
                private_key_pem = EXCLUDED.private_key_pem
            "#,
        )
        .bind(&config.app_id)
        .bind(&config.sp_entity_id)
        .bind(&config.acs_url)
        .bind(&config.acs_binding)
        .bind(&config.slo_url)
        .bind(&config.name_id_format)
        .bind(&config.certificate_pem)
        .bind(&config.private_key_pem)
        .bind(config.created_utc)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn find_saml_config(&self, app_id: &str) -> Result<Option<SamlConfig>, ServiceError> {
        Ok(
            sqlx::query_as::<_, SamlConfig>("SELECT * FROM saml_configs WHERE app_id = $1")
                .bind(app_id)
                .fetch_optional(&self.pool)
                .await?,
        )
    }

    async fn find_saml_config_by_entity_id(
        &self,
        entity_id: &str,
    ) -> Result<Option<SamlConfig>, ServiceError> {
        Ok(
            sqlx::query_as::<_, SamlConfig>("SELECT * FROM saml_configs WHERE sp_entity_id = $1")
                .bind(entity_id)
                .fetch_optional(&self.pool)
                .await?,
        )
    }

    async fn insert_cas_service(&self, service: &CasService) -> Result<(), ServiceError> {
        sqlx::query(
            "INSERT INTO cas_services (app_id, service_prefix, enabled, created_utc) VALUES ($1, $2, $3, $4)",
        )
        .bind(&service.app_id)
        .bind(&service.service_prefix)
        .bind(service.enabled)
        .bind(service.created_utc)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn find_cas_service_for(
        &self,
        service_url: &str,
    ) -> Result<Option<CasService>, ServiceError> {
        Ok(sqlx::query_as::<_, CasService>(
            r#"
            SELECT * FROM cas_services
            WHERE enabled AND LEFT($1, LENGTH(service_prefix)) = service_prefix
            ORDER BY LENGTH(service_prefix) DESC
            LIMIT 1
            "#,
        )
        .bind(service_url)
        .fetch_optional(&self.pool)
        .await?)
    }
}
