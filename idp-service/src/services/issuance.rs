//! Token and session issuance shared by first-party login and OAuth2.
//!
//! Access tokens are stateless JWTs. Refresh tokens are opaque; their only
//! state is the ephemeral-store entry keyed by the token hash. Session rows
//! are the revocable counterpart of first-party access tokens.

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use std::sync::Arc;
use uuid::Uuid;

use crate::models::artifact::{keys, ArtifactKind, OAuthAccessContext, RefreshContext};
use crate::models::oauth_client::hash_secret;
use crate::models::{OAuthToken, Session, User};
use crate::services::{
    Clock, EphemeralStore, IdentityRepository, Metrics, ServiceError, TokenService,
};
use crate::utils::random_token;

const REFRESH_TOKEN_BYTES: usize = 32;

#[derive(Debug, Clone, Serialize)]
pub struct IssuedTokens {
    pub access_token: String,
    pub refresh_token: String,
    pub token_type: String,
    pub expires_in: i64,
    #[serde(skip)]
    pub session_id: Uuid,
}

#[derive(Debug, Clone, Serialize)]
pub struct RefreshedAccess {
    pub access_token: String,
    pub token_type: String,
    pub expires_in: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct OAuthTokenSet {
    pub access_token: String,
    pub token_type: String,
    pub expires_in: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id_token: Option<String>,
    pub scope: String,
}

/// What an OAuth2 grant asks the issuer to mint.
pub struct OAuthGrant<'a> {
    pub client_id: &'a str,
    pub user: Option<&'a User>,
    pub scope: &'a str,
    pub include_refresh: bool,
    pub nonce: Option<String>,
}

pub fn has_scope(scope: &str, wanted: &str) -> bool {
    scope.split_whitespace().any(|s| s == wanted)
}

fn std_duration(d: Duration) -> std::time::Duration {
    d.to_std().unwrap_or(std::time::Duration::from_secs(1))
}

#[derive(Clone)]
pub struct IssuanceService {
    repo: Arc<dyn IdentityRepository>,
    store: Arc<dyn EphemeralStore>,
    tokens: TokenService,
    clock: Arc<dyn Clock>,
    metrics: Metrics,
}

impl IssuanceService {
    pub fn new(
        repo: Arc<dyn IdentityRepository>,
        store: Arc<dyn EphemeralStore>,
        tokens: TokenService,
        clock: Arc<dyn Clock>,
        metrics: Metrics,
    ) -> Self {
        Self {
            repo,
            store,
            tokens,
            clock,
            metrics,
        }
    }

    pub fn tokens(&self) -> &TokenService {
        &self.tokens
    }

    async fn store_refresh_token(&self, context: &RefreshContext) -> Result<String, ServiceError> {
        let refresh_token = random_token(REFRESH_TOKEN_BYTES);
        self.store
            .put_json(
                &keys::refresh_token(&hash_secret(&refresh_token)),
                context,
                std_duration(self.tokens.refresh_token_lifetime()),
            )
            .await?;
        self.metrics.artifact_issued(ArtifactKind::RefreshToken);
        Ok(refresh_token)
    }

    /// Persist a session and mint the first-party token pair.
    /// `duration_override` (minutes) replaces the access token and session
    /// lifetime.
    pub async fn issue_session(
        &self,
        user: &User,
        ip: &str,
        user_agent: &str,
        duration_override: Option<i64>,
    ) -> Result<IssuedTokens, ServiceError> {
        let now = self.clock.now();
        let duration_override = duration_override.filter(|m| *m > 0);
        let lifetime = duration_override
            .map(Duration::minutes)
            .unwrap_or_else(|| self.tokens.access_token_lifetime());

        let session = Session::new(user.user_id, ip, user_agent, now, now + lifetime);
        self.repo.insert_session(&session).await?;

        let access_token = self
            .tokens
            .user_access_token(user, Some(session.session_id), now, lifetime)?;
        let refresh_token = self
            .store_refresh_token(&RefreshContext {
                user_id: user.user_id,
                client_id: None,
                scope: None,
                session_id: Some(session.session_id),
                duration_override,
            })
            .await?;

        Ok(IssuedTokens {
            access_token,
            refresh_token,
            token_type: "Bearer".to_string(),
            expires_in: lifetime.num_seconds(),
            session_id: session.session_id,
        })
    }

    /// Non-destructive lookup of a refresh token record.
    pub async fn lookup_refresh(
        &self,
        refresh_token: &str,
    ) -> Result<RefreshContext, ServiceError> {
        let record: Option<RefreshContext> = self
            .store
            .get_json(&keys::refresh_token(&hash_secret(refresh_token)))
            .await?;
        record.ok_or(ServiceError::InvalidArtifact)
    }

    /// New access token for a refresh record. The refresh token itself is
    /// unchanged and risk/policy are not re-evaluated.
    pub async fn refresh_access(
        &self,
        refresh_token: &str,
    ) -> Result<(RefreshedAccess, RefreshContext), ServiceError> {
        let record = self.lookup_refresh(refresh_token).await?;
        let user = self
            .repo
            .find_user_by_id(record.user_id)
            .await?
            .filter(|u| u.is_active())
            .ok_or(ServiceError::InvalidArtifact)?;

        let now = self.clock.now();
        let (access_token, lifetime) = match &record.client_id {
            Some(client_id) => (
                self.tokens.client_access_token(
                    client_id,
                    Some(&user),
                    record.scope.as_deref().unwrap_or_default(),
                    now,
                )?,
                self.tokens.access_token_lifetime(),
            ),
            None => {
                let lifetime = self.session_bound_lifetime(&record, now).await?;
                let token = self
                    .tokens
                    .user_access_token(&user, record.session_id, now, lifetime)?;
                (token, lifetime)
            }
        };

        Ok((
            RefreshedAccess {
                access_token,
                token_type: "Bearer".to_string(),
                expires_in: lifetime.num_seconds(),
            },
            record,
        ))
    }

    /// A session shortened by conditional access bounds every access token
    /// refreshed from it; once that session ends the refresh token is spent.
    async fn session_bound_lifetime(
        &self,
        record: &RefreshContext,
        now: DateTime<Utc>,
    ) -> Result<Duration, ServiceError> {
        let default = self.tokens.access_token_lifetime();
        let (Some(minutes), Some(session_id)) = (record.duration_override, record.session_id) else {
            return Ok(default);
        };
        let session = self
            .repo
            .find_session(session_id)
            .await?
            .ok_or(ServiceError::InvalidArtifact)?;
        let remaining = session.expires_utc - now;
        if remaining <= Duration::zero() {
            return Err(ServiceError::InvalidArtifact);
        }
        Ok(remaining.min(Duration::minutes(minutes)))
    }

    pub async fn revoke_refresh(&self, refresh_token: &str) -> Result<(), ServiceError> {
        self.store
            .delete(&keys::refresh_token(&hash_secret(refresh_token)))
            .await?;
        Ok(())
    }

    /// Mint OAuth2 tokens, record the access token hash in the database and
    /// the ephemeral store, and add an ID token for `openid` scopes.
    pub async fn issue_oauth_tokens(
        &self,
        grant: OAuthGrant<'_>,
    ) -> Result<OAuthTokenSet, ServiceError> {
        let now = self.clock.now();
        let lifetime = self.tokens.access_token_lifetime();
        let access_token = self
            .tokens
            .client_access_token(grant.client_id, grant.user, grant.scope, now)?;
        let access_hash = hash_secret(&access_token);

        self.repo
            .insert_oauth_token(&OAuthToken {
                token_id: Uuid::new_v4(),
                token_hash: access_hash.clone(),
                client_id: grant.client_id.to_string(),
                user_id: grant.user.map(|u| u.user_id),
                scope: grant.scope.to_string(),
                expires_utc: now + lifetime,
                created_utc: now,
            })
            .await?;
        self.store
            .put_json(
                &keys::oauth_access(&access_hash),
                &OAuthAccessContext {
                    client_id: grant.client_id.to_string(),
                    user_id: grant.user.map(|u| u.user_id),
                    scope: grant.scope.to_string(),
                },
                std_duration(lifetime),
            )
            .await?;

        let refresh_token = match (grant.include_refresh, grant.user) {
            (true, Some(user)) => Some(
                self.store_refresh_token(&RefreshContext {
                    user_id: user.user_id,
                    client_id: Some(grant.client_id.to_string()),
                    scope: Some(grant.scope.to_string()),
                    session_id: None,
                    duration_override: None,
                })
                .await?,
            ),
            _ => None,
        };

        let id_token = match grant.user {
            Some(user) if has_scope(grant.scope, "openid") => Some(self.tokens.id_token(
                user,
                grant.client_id,
                grant.nonce,
                has_scope(grant.scope, "email"),
                has_scope(grant.scope, "profile"),
                now,
            )?),
            _ => None,
        };

        Ok(OAuthTokenSet {
            access_token,
            token_type: "Bearer".to_string(),
            expires_in: lifetime.num_seconds(),
            refresh_token,
            id_token,
            scope: grant.scope.to_string(),
        })
    }

    /// Access-token record for userinfo: the ephemeral store first, then the
    /// persisted token row while it is unexpired.
    pub async fn lookup_oauth_access(
        &self,
        access_token: &str,
    ) -> Result<OAuthAccessContext, ServiceError> {
        let hash = hash_secret(access_token);
        let cached: Option<OAuthAccessContext> =
            self.store.get_json(&keys::oauth_access(&hash)).await?;
        if let Some(context) = cached {
            return Ok(context);
        }

        match self.repo.find_oauth_token(&hash).await? {
            Some(row) if row.expires_utc > self.clock.now() => Ok(OAuthAccessContext {
                client_id: row.client_id,
                user_id: row.user_id,
                scope: row.scope,
            }),
            _ => Err(ServiceError::InvalidArtifact),
        }
    }
}
