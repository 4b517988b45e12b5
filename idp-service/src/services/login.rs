//! First-party login decision pipeline.
//!
//! lockout -> principal -> password -> risk + conditional access -> MFA ->
//! issuance. Every rejection after the lockout check is written to the
//! attempt log and the failure counters before the error is returned.

use chrono::Duration;
use std::net::IpAddr;
use std::sync::Arc;
use subtle::ConstantTimeEq;
use uuid::Uuid;

use crate::config::RiskMfaFallback;
use crate::models::artifact::{keys, ArtifactKind, PasswordResetContext};
use crate::models::oauth_client::hash_secret;
use crate::models::{device_fingerprint, AccessContext, LoginAttempt, MfaDevice, MfaMethod, User};
use crate::services::events::{event_types, DomainEvent, EventSink};
use crate::services::issuance::{IssuanceService, IssuedTokens, RefreshedAccess};
use crate::services::notification::{Notification, NotificationQueue};
use crate::services::risk::{RiskAssessment, RiskEngine, RiskInput};
use crate::services::totp::verify_totp;
use crate::services::{
    AccessDecision, Clock, ConditionalAccessEvaluator, EphemeralStore, IdentityRepository, Metrics,
    ServiceError,
};
use crate::utils::{burn_verification, hash_password, numeric_code, random_token, verify_password};

const MFA_OTP_DIGITS: usize = 6;
const MFA_OTP_TTL: std::time::Duration = std::time::Duration::from_secs(5 * 60);
const RESET_TOKEN_TTL: std::time::Duration = std::time::Duration::from_secs(60 * 60);
const RESET_TOKEN_BYTES: usize = 32;

/// Tunables for the pipeline.
#[derive(Debug, Clone)]
pub struct LoginSettings {
    pub on_risk_mfa_unavailable: RiskMfaFallback,
    pub lockout_threshold: i64,
    pub failure_window: Duration,
    /// Base URL used in password reset links.
    pub public_url: String,
}

/// Request-scoped input to the pipeline.
#[derive(Debug, Clone)]
pub struct LoginRequestContext {
    pub username: String,
    pub password: String,
    pub mfa_code: Option<String>,
    /// Client-supplied stable device id; falls back to the UA/IP fingerprint.
    pub device_id: Option<String>,
    pub ip: IpAddr,
    pub user_agent: String,
}

#[derive(Debug, Clone)]
pub struct LoginOutcome {
    pub user: User,
    pub tokens: IssuedTokens,
    pub risk: RiskAssessment,
    pub decision: AccessDecision,
    pub attempt: LoginAttempt,
}

/// A login that has cleared every check and may be issued credentials.
#[derive(Debug, Clone)]
pub struct Authenticated {
    pub user: User,
    pub risk: RiskAssessment,
    pub decision: AccessDecision,
    pub mfa_required: bool,
    device_id: String,
}

/// The device a challenge goes to: an authenticator app first, then SMS,
/// then email. Ties keep enrolment order.
fn preferred_device(devices: &[MfaDevice]) -> Option<&MfaDevice> {
    devices.iter().min_by_key(|d| match d.method() {
        Some(MfaMethod::Totp) => 0,
        Some(MfaMethod::Sms) => 1,
        Some(MfaMethod::Email) => 2,
        None => 3,
    })
}

impl LoginOutcome {
    pub fn mfa_required(&self) -> bool {
        self.attempt.mfa_required
    }
}

/// One rejected attempt, as it is written to the log and counters.
struct Failure<'a> {
    username: &'a str,
    user_id: Option<i64>,
    reason: &'static str,
    risk_score: u8,
    mfa_required: bool,
}

#[derive(Clone)]
pub struct LoginService {
    repo: Arc<dyn IdentityRepository>,
    store: Arc<dyn EphemeralStore>,
    clock: Arc<dyn Clock>,
    risk: RiskEngine,
    access: ConditionalAccessEvaluator,
    issuance: IssuanceService,
    notifications: Arc<NotificationQueue>,
    events: Arc<dyn EventSink>,
    metrics: Metrics,
    settings: LoginSettings,
}

impl LoginService {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        repo: Arc<dyn IdentityRepository>,
        store: Arc<dyn EphemeralStore>,
        clock: Arc<dyn Clock>,
        risk: RiskEngine,
        access: ConditionalAccessEvaluator,
        issuance: IssuanceService,
        notifications: Arc<NotificationQueue>,
        events: Arc<dyn EventSink>,
        metrics: Metrics,
        settings: LoginSettings,
    ) -> Self {
        Self {
            repo,
            store,
            clock,
            risk,
            access,
            issuance,
            notifications,
            events,
            metrics,
            settings,
        }
    }

    fn failure_ttl(&self) -> std::time::Duration {
        self.settings
            .failure_window
            .to_std()
            .unwrap_or(std::time::Duration::from_secs(900))
    }

    // ==================== Bookkeeping ====================

    async fn write_attempt(&self, attempt: &LoginAttempt) {
        if let Err(e) = self.repo.insert_login_attempt(attempt).await {
            tracing::error!(
                error = %e,
                username = %attempt.username,
                "Failed to record login attempt"
            );
        }
    }

    /// Attempt row, both failure counters and a `user.login_failed` event.
    /// Bookkeeping errors are logged; the caller's rejection stands.
    async fn record_failure(&self, req: &LoginRequestContext, failure: Failure<'_>) {
        let ip = req.ip.to_string();
        let mut attempt =
            LoginAttempt::new(failure.username, &ip, &req.user_agent, self.clock.now());
        attempt.user_id = failure.user_id;
        attempt.failure_reason = Some(failure.reason.to_string());
        attempt.risk_score = i32::from(failure.risk_score);
        attempt.mfa_required = failure.mfa_required;
        self.write_attempt(&attempt).await;

        let ttl = self.failure_ttl();
        for key in [keys::login_failures(&ip, failure.username), keys::ip_failures(&ip)] {
            if let Err(e) = self.store.incr(&key, ttl).await {
                tracing::error!(error = %e, "Failed to increment login failure counter");
            }
        }

        self.metrics.login_outcome(failure.reason);
        self.events.publish(DomainEvent::new(
            event_types::USER_LOGIN_FAILED,
            failure.user_id,
            attempt.created_utc,
            serde_json::json!({
                "username": failure.username,
                "ip": ip,
                "reason": failure.reason,
            }),
        ));

        tracing::warn!(
            username = %failure.username,
            ip = %ip,
            reason = failure.reason,
            "Login failed"
        );
    }

    /// Lockout check, principal lookup and password verification. Every
    /// rejection is recorded against the submitted username.
    pub async fn verify_credentials(
        &self,
        req: &LoginRequestContext,
    ) -> Result<User, ServiceError> {
        let username = req.username.trim();
        let ip = req.ip.to_string();

        let failures = self.store.counter(&keys::login_failures(&ip, username)).await?;
        if failures >= self.settings.lockout_threshold {
            self.record_failure(req, Failure {
                username,
                user_id: None,
                reason: "locked_out",
                risk_score: 0,
                mfa_required: false,
            })
            .await;
            return Err(ServiceError::TooManyAttempts);
        }

        let user = match self.repo.find_user_by_login(username).await? {
            Some(user) if user.is_active() => user,
            found => {
                burn_verification(&req.password);
                self.record_failure(req, Failure {
                    username,
                    user_id: found.map(|u| u.user_id),
                    reason: "invalid_credentials",
                    risk_score: 0,
                    mfa_required: false,
                })
                .await;
                return Err(ServiceError::InvalidCredentials);
            }
        };

        if !verify_password(&req.password, &user.password_hash) {
            self.record_failure(req, Failure {
                username,
                user_id: Some(user.user_id),
                reason: "invalid_credentials",
                risk_score: 0,
                mfa_required: false,
            })
            .await;
            return Err(ServiceError::InvalidCredentials);
        }

        Ok(user)
    }

    // ==================== Login ====================

    pub async fn login(&self, req: LoginRequestContext) -> Result<LoginOutcome, ServiceError> {
        let authenticated = self.authenticate(&req, None).await?;

        let tokens = self
            .issuance
            .issue_session(
                &authenticated.user,
                &req.ip.to_string(),
                &req.user_agent,
                authenticated.decision.session_duration_override,
            )
            .await?;
        let attempt = self
            .record_success(&req, &authenticated, Some(tokens.session_id))
            .await?;

        let Authenticated {
            user,
            risk,
            decision,
            ..
        } = authenticated;
        Ok(LoginOutcome {
            user,
            tokens,
            risk,
            decision,
            attempt,
        })
    }

    /// Every check a login passes before credentials are issued: lockout,
    /// password, risk, conditional access for `app_id` and MFA. Callers that
    /// go on to issue credentials must follow up with `record_success`.
    pub async fn authenticate(
        &self,
        req: &LoginRequestContext,
        app_id: Option<&str>,
    ) -> Result<Authenticated, ServiceError> {
        let user = self.verify_credentials(req).await?;
        let username = req.username.trim();

        let device_id = req
            .device_id
            .clone()
            .filter(|d| !d.trim().is_empty())
            .unwrap_or_else(|| device_fingerprint(&req.user_agent, &req.ip.to_string()));
        let risk = self
            .risk
            .assess(RiskInput {
                user: &user,
                ip: req.ip,
                user_agent: &req.user_agent,
                device_id: &device_id,
            })
            .await?;

        let decision = self
            .access
            .evaluate(&AccessContext {
                user_id: user.user_id,
                app_id: app_id.map(str::to_string),
                ip: req.ip,
                user_agent: req.user_agent.clone(),
                roles: user.roles.clone(),
                at: self.clock.now(),
                risk_score: Some(risk.score),
            })
            .await?;

        if let Some(reason) = &decision.block_reason {
            self.record_failure(req, Failure {
                username,
                user_id: Some(user.user_id),
                reason: "policy_blocked",
                risk_score: risk.score,
                mfa_required: false,
            })
            .await;
            return Err(ServiceError::PolicyBlocked(reason.clone()));
        }

        let devices = self.repo.list_verified_mfa_devices(user.user_id).await?;
        if decision.require_mfa && devices.is_empty() {
            self.record_failure(req, Failure {
                username,
                user_id: Some(user.user_id),
                reason: "mfa_required_by_policy",
                risk_score: risk.score,
                mfa_required: true,
            })
            .await;
            return Err(ServiceError::MfaRequired("MFA required by policy".to_string()));
        }

        let risk_mfa = self.risk.should_require_mfa(risk.score, user.mfa_enabled);
        let mfa_required = user.mfa_enabled || risk_mfa || decision.require_mfa;
        if mfa_required {
            self.challenge(req, &user, &risk, risk_mfa, preferred_device(&devices))
                .await?;
        }

        Ok(Authenticated {
            user,
            risk,
            decision,
            mfa_required,
            device_id,
        })
    }

    /// Last-login, device and attempt bookkeeping once credentials exist.
    pub async fn record_success(
        &self,
        req: &LoginRequestContext,
        authenticated: &Authenticated,
        session_id: Option<Uuid>,
    ) -> Result<LoginAttempt, ServiceError> {
        let user = &authenticated.user;
        let username = req.username.trim();
        let ip = req.ip.to_string();
        let now = self.clock.now();

        self.repo.update_last_login(user.user_id, now).await?;
        self.risk
            .record_device_login(user.user_id, &authenticated.device_id, &req.user_agent, req.ip)
            .await?;

        let mut attempt = LoginAttempt::new(username, &ip, &req.user_agent, now);
        attempt.user_id = Some(user.user_id);
        attempt.success = true;
        attempt.risk_score = i32::from(authenticated.risk.score);
        attempt.mfa_required = authenticated.mfa_required;
        self.write_attempt(&attempt).await;

        if let Err(e) = self.store.delete(&keys::login_failures(&ip, username)).await {
            tracing::warn!(error = %e, "Failed to clear login failure counter");
        }

        self.metrics.login_outcome("success");
        self.events.publish(DomainEvent::new(
            event_types::USER_LOGIN,
            Some(user.user_id),
            now,
            serde_json::json!({
                "ip": ip,
                "risk_score": authenticated.risk.score,
                "mfa_required": authenticated.mfa_required,
                "session_id": session_id,
            }),
        ));

        tracing::info!(
            user_id = user.user_id,
            ip = %req.ip,
            risk_score = authenticated.risk.score,
            mfa_required = authenticated.mfa_required,
            "User logged in"
        );

        Ok(attempt)
    }

    /// Returns `Ok` when the login may proceed past MFA.
    async fn challenge(
        &self,
        req: &LoginRequestContext,
        user: &User,
        risk: &RiskAssessment,
        risk_mfa: bool,
        device: Option<&MfaDevice>,
    ) -> Result<(), ServiceError> {
        let username = req.username.trim();
        let code = req.mfa_code.as_deref().map(str::trim).filter(|c| !c.is_empty());

        let Some(device) = device else {
            // Only reachable for account-level or risk-mandated MFA; policy
            // MFA without a device is rejected earlier.
            if !user.mfa_enabled
                && risk_mfa
                && self.settings.on_risk_mfa_unavailable == RiskMfaFallback::Allow
            {
                tracing::warn!(
                    user_id = user.user_id,
                    risk_score = risk.score,
                    "Risk requires MFA but no verified device is enrolled; proceeding"
                );
                return Ok(());
            }
            self.record_failure(req, Failure {
                username,
                user_id: Some(user.user_id),
                reason: "mfa_unavailable",
                risk_score: risk.score,
                mfa_required: true,
            })
            .await;
            return Err(ServiceError::MfaRequired(
                "MFA required but no verified MFA device is enrolled".to_string(),
            ));
        };

        let Some(code) = code else {
            if let Some(method @ (MfaMethod::Sms | MfaMethod::Email)) = device.method() {
                self.send_otp(user, method, device).await?;
            }
            let mut attempt = LoginAttempt::new(
                username,
                &req.ip.to_string(),
                &req.user_agent,
                self.clock.now(),
            );
            attempt.user_id = Some(user.user_id);
            attempt.failure_reason = Some("mfa_code_required".to_string());
            attempt.risk_score = i32::from(risk.score);
            attempt.mfa_required = true;
            self.write_attempt(&attempt).await;
            self.metrics.login_outcome("mfa_challenge");
            return Err(ServiceError::MfaRequired("MFA code required".to_string()));
        };

        let valid = match device.method() {
            Some(MfaMethod::Totp) => device
                .secret
                .as_deref()
                .map(|secret| verify_totp(secret, code, self.clock.now()))
                .unwrap_or(false),
            Some(MfaMethod::Sms | MfaMethod::Email) => self.redeem_otp(user.user_id, code).await?,
            None => false,
        };

        if !valid {
            self.record_failure(req, Failure {
                username,
                user_id: Some(user.user_id),
                reason: "invalid_mfa_code",
                risk_score: risk.score,
                mfa_required: true,
            })
            .await;
            return Err(ServiceError::MfaInvalid);
        }
        Ok(())
    }

    async fn send_otp(
        &self,
        user: &User,
        method: MfaMethod,
        device: &MfaDevice,
    ) -> Result<(), ServiceError> {
        let contact = device.contact.as_deref().unwrap_or(&user.email);
        let code = numeric_code(MFA_OTP_DIGITS as u32);
        self.store
            .put(&keys::mfa_otp(user.user_id), &code, MFA_OTP_TTL)
            .await?;
        self.metrics.artifact_issued(ArtifactKind::MfaOtp);
        self.notifications
            .enqueue(Notification::mfa_code(method, contact, &code));
        tracing::info!(user_id = user.user_id, method = method.as_str(), "MFA code sent");
        Ok(())
    }

    /// Single use: the stored code is consumed whether or not it matches.
    async fn redeem_otp(&self, user_id: i64, code: &str) -> Result<bool, ServiceError> {
        let stored = self.store.get_and_delete(&keys::mfa_otp(user_id)).await?;
        let valid = stored
            .map(|s| bool::from(s.as_bytes().ct_eq(code.as_bytes())))
            .unwrap_or(false);
        self.metrics.artifact_redeemed(ArtifactKind::MfaOtp, valid);
        Ok(valid)
    }

    /// Re-send an email/SMS code after checking the password again.
    pub async fn send_mfa_code(&self, req: LoginRequestContext) -> Result<(), ServiceError> {
        let user = self.verify_credentials(&req).await?;
        let devices = self.repo.list_verified_mfa_devices(user.user_id).await?;
        let device = devices
            .iter()
            .find(|d| matches!(d.method(), Some(MfaMethod::Sms | MfaMethod::Email)))
            .ok_or_else(|| {
                ServiceError::Validation("No email or SMS MFA device is enrolled".to_string())
            })?;
        let method = device
            .method()
            .ok_or_else(|| ServiceError::Validation("Unknown MFA method".to_string()))?;
        self.send_otp(&user, method, device).await
    }

    // ==================== Refresh / logout ====================

    /// Only refresh tokens from first-party login are accepted here.
    pub async fn refresh(&self, refresh_token: &str) -> Result<RefreshedAccess, ServiceError> {
        let record = self.issuance.lookup_refresh(refresh_token).await?;
        if record.client_id.is_some() {
            return Err(ServiceError::InvalidArtifact);
        }
        let (access, record) = self.issuance.refresh_access(refresh_token).await?;
        tracing::info!(user_id = record.user_id, "Access token refreshed");
        Ok(access)
    }

    pub async fn logout(
        &self,
        user_id: i64,
        refresh_token: Option<&str>,
    ) -> Result<u64, ServiceError> {
        let removed = self.repo.delete_sessions_for_user(user_id).await?;
        if let Some(token) = refresh_token.filter(|t| !t.is_empty()) {
            self.issuance.revoke_refresh(token).await?;
        }
        self.events.publish(DomainEvent::new(
            event_types::USER_LOGOUT,
            Some(user_id),
            self.clock.now(),
            serde_json::json!({ "sessions_removed": removed }),
        ));
        tracing::info!(user_id, sessions_removed = removed, "User logged out");
        Ok(removed)
    }

    // ==================== Password reset ====================

    /// Always succeeds from the caller's point of view.
    pub async fn forgot_password(&self, email: &str) -> Result<(), ServiceError> {
        let user = match self.repo.find_user_by_email(email.trim()).await? {
            Some(user) if user.is_active() => user,
            _ => {
                tracing::debug!("Password reset requested for unknown or inactive account");
                return Ok(());
            }
        };

        let token = random_token(RESET_TOKEN_BYTES);
        self.store
            .put_json(
                &keys::password_reset(&hash_secret(&token)),
                &PasswordResetContext { user_id: user.user_id },
                RESET_TOKEN_TTL,
            )
            .await?;
        self.metrics.artifact_issued(ArtifactKind::PasswordReset);

        let link = format!(
            "{}/auth/reset-password?token={}",
            self.settings.public_url.trim_end_matches('/'),
            token
        );
        self.notifications
            .enqueue(Notification::password_reset(&user.email, &link));

        tracing::info!(user_id = user.user_id, "Password reset requested");
        Ok(())
    }

    /// Consumes the token, re-hashes the password and revokes every session.
    pub async fn reset_password(
        &self,
        token: &str,
        new_password: &str,
    ) -> Result<(), ServiceError> {
        let context: Option<PasswordResetContext> = self
            .store
            .take_json(&keys::password_reset(&hash_secret(token)))
            .await?;
        self.metrics
            .artifact_redeemed(ArtifactKind::PasswordReset, context.is_some());
        let context = context.ok_or(ServiceError::InvalidArtifact)?;

        let user = self
            .repo
            .find_user_by_id(context.user_id)
            .await?
            .ok_or(ServiceError::UserNotFound)?;

        let password_hash = hash_password(new_password)?;
        self.repo.update_password(user.user_id, &password_hash).await?;
        self.repo.delete_sessions_for_user(user.user_id).await?;

        self.events.publish(DomainEvent::new(
            event_types::USER_PASSWORD_RESET,
            Some(user.user_id),
            self.clock.now(),
            serde_json::Value::Null,
        ));
        tracing::info!(user_id = user.user_id, "Password reset successful");
        Ok(())
    }
}
