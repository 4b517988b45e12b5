//! OAuth2 / OpenID Connect authorization server.
//!
//! Authorization codes are redeemed exactly once through the ephemeral
//! store's `get_and_delete`; refresh tokens and access-token records are read
//! non-destructively.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::net::IpAddr;
use std::sync::Arc;
use subtle::ConstantTimeEq;
use thiserror::Error;

use crate::models::artifact::{keys, ArtifactKind, AuthorizationCodeContext};
use crate::models::{AccessContext, OAuthClient, User};
use crate::services::events::{event_types, DomainEvent, EventSink};
use crate::services::issuance::{has_scope, IssuanceService, OAuthGrant, OAuthTokenSet};
use crate::services::login::{LoginRequestContext, LoginService};
use crate::services::{
    Clock, ConditionalAccessEvaluator, EphemeralStore, IdentityRepository, Metrics, ServiceError,
};
use crate::utils::random_token;

const AUTHORIZATION_CODE_TTL: std::time::Duration = std::time::Duration::from_secs(10 * 60);
const AUTHORIZATION_CODE_BYTES: usize = 32;

/// RFC 6749 error codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OAuthErrorCode {
    InvalidRequest,
    InvalidClient,
    InvalidGrant,
    UnauthorizedClient,
    UnsupportedGrantType,
    UnsupportedResponseType,
    InvalidScope,
    AccessDenied,
    /// OIDC: no authenticated session at the authorization endpoint.
    LoginRequired,
    InvalidToken,
    ServerError,
    TemporarilyUnavailable,
}

impl OAuthErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::InvalidRequest => "invalid_request",
            Self::InvalidClient => "invalid_client",
            Self::InvalidGrant => "invalid_grant",
            Self::UnauthorizedClient => "unauthorized_client",
            Self::UnsupportedGrantType => "unsupported_grant_type",
            Self::UnsupportedResponseType => "unsupported_response_type",
            Self::InvalidScope => "invalid_scope",
            Self::AccessDenied => "access_denied",
            Self::LoginRequired => "login_required",
            Self::InvalidToken => "invalid_token",
            Self::ServerError => "server_error",
            Self::TemporarilyUnavailable => "temporarily_unavailable",
        }
    }
}

#[derive(Debug, Clone, Error)]
#[error("{}: {}", .code.as_str(), .description)]
pub struct OAuthError {
    pub code: OAuthErrorCode,
    pub description: String,
}

impl OAuthError {
    pub fn new(code: OAuthErrorCode, description: impl Into<String>) -> Self {
        Self {
            code,
            description: description.into(),
        }
    }

    pub fn invalid_request(description: impl Into<String>) -> Self {
        Self::new(OAuthErrorCode::InvalidRequest, description)
    }

    pub fn invalid_client(description: impl Into<String>) -> Self {
        Self::new(OAuthErrorCode::InvalidClient, description)
    }

    pub fn invalid_grant(description: impl Into<String>) -> Self {
        Self::new(OAuthErrorCode::InvalidGrant, description)
    }
}

impl From<ServiceError> for OAuthError {
    fn from(err: ServiceError) -> Self {
        match err {
            ServiceError::InvalidClient(msg) => OAuthError::invalid_client(msg),
            ServiceError::InvalidRequest(msg) | ServiceError::Validation(msg) => {
                OAuthError::invalid_request(msg)
            }
            ServiceError::InvalidScope(msg) => OAuthError::new(OAuthErrorCode::InvalidScope, msg),
            ServiceError::InvalidArtifact => {
                OAuthError::invalid_grant("Invalid, expired or already used grant")
            }
            ServiceError::InvalidCredentials | ServiceError::AccountDisabled => {
                OAuthError::invalid_grant("Invalid resource owner credentials")
            }
            ServiceError::MfaRequired(msg) => OAuthError::invalid_grant(msg),
            ServiceError::MfaInvalid => OAuthError::invalid_grant("Invalid MFA code"),
            ServiceError::TooManyAttempts => OAuthError::invalid_grant("Too many failed attempts"),
            ServiceError::PolicyBlocked(reason) => OAuthError::new(
                OAuthErrorCode::AccessDenied,
                format!("Access blocked by policy: {}", reason),
            ),
            ServiceError::UserNotFound => OAuthError::invalid_grant("Unknown resource owner"),
            ServiceError::StoreUnavailable(cause) => {
                tracing::error!(cause = %cause, "Ephemeral store unavailable");
                OAuthError::new(
                    OAuthErrorCode::TemporarilyUnavailable,
                    "Service temporarily unavailable",
                )
            }
            ServiceError::Database(e) => {
                tracing::error!(error = %e, "Database error in OAuth2 flow");
                OAuthError::new(OAuthErrorCode::ServerError, "Internal server error")
            }
            ServiceError::Internal(e) => {
                tracing::error!(error = %e, "Internal error in OAuth2 flow");
                OAuthError::new(OAuthErrorCode::ServerError, "Internal server error")
            }
        }
    }
}

// ==================== Requests ====================

#[derive(Debug, Clone, Default, Deserialize)]
pub struct AuthorizeRequest {
    pub response_type: String,
    pub client_id: String,
    pub redirect_uri: String,
    pub scope: Option<String>,
    pub state: Option<String>,
    pub nonce: Option<String>,
    pub code_challenge: Option<String>,
    pub code_challenge_method: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct TokenRequest {
    pub grant_type: String,
    pub code: Option<String>,
    pub redirect_uri: Option<String>,
    pub client_id: Option<String>,
    pub client_secret: Option<String>,
    pub code_verifier: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,
    /// Second factor for the password grant when the login requires one.
    pub mfa_code: Option<String>,
    pub scope: Option<String>,
    pub refresh_token: Option<String>,
}

/// Client credentials presented via HTTP Basic, taking precedence over the form.
#[derive(Debug, Clone)]
pub struct ClientCredentials {
    pub client_id: String,
    pub client_secret: String,
}

/// Where the request came from, for conditional access and password grants.
#[derive(Debug, Clone)]
pub struct RequestOrigin {
    pub ip: IpAddr,
    pub user_agent: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct UserInfo {
    pub sub: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub email_verified: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub preferred_username: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

// ==================== Helpers ====================

/// Resolve the requested scope against the client's allowed scopes. An empty
/// request gets every allowed scope.
pub fn resolve_scope(
    client: &OAuthClient,
    requested: Option<&str>,
) -> Result<String, ServiceError> {
    let requested: Vec<&str> = requested
        .map(|s| s.split_whitespace().collect())
        .unwrap_or_default();
    if requested.is_empty() {
        return Ok(client.allowed_scopes.join(" "));
    }

    let mut granted: Vec<&str> = Vec::with_capacity(requested.len());
    for scope in requested {
        if !client.allowed_scopes.iter().any(|s| s == scope) {
            return Err(ServiceError::InvalidScope(format!(
                "Scope '{}' is not allowed for this client",
                scope
            )));
        }
        if !granted.contains(&scope) {
            granted.push(scope);
        }
    }
    Ok(granted.join(" "))
}

/// RFC 7636 verifier check. `plain` compares directly, `S256` compares the
/// base64url SHA-256 of the verifier.
pub fn verify_pkce(challenge: &str, method: &str, verifier: &str) -> bool {
    let computed = match method {
        "S256" => URL_SAFE_NO_PAD.encode(Sha256::digest(verifier.as_bytes())),
        "plain" => verifier.to_string(),
        _ => return false,
    };
    computed.as_bytes().ct_eq(challenge.as_bytes()).into()
}

pub(crate) fn append_query(uri: &str, params: &[(&str, &str)]) -> String {
    let mut out = uri.to_string();
    let mut separator = if uri.contains('?') { '&' } else { '?' };
    for (key, value) in params {
        out.push(separator);
        out.push_str(key);
        out.push('=');
        out.push_str(&urlencoding::encode(value));
        separator = '&';
    }
    out
}

// ==================== Service ====================

#[derive(Clone)]
pub struct OAuth2Service {
    repo: Arc<dyn IdentityRepository>,
    store: Arc<dyn EphemeralStore>,
    clock: Arc<dyn Clock>,
    access: ConditionalAccessEvaluator,
    issuance: IssuanceService,
    login: LoginService,
    events: Arc<dyn EventSink>,
    metrics: Metrics,
}

impl OAuth2Service {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        repo: Arc<dyn IdentityRepository>,
        store: Arc<dyn EphemeralStore>,
        clock: Arc<dyn Clock>,
        access: ConditionalAccessEvaluator,
        issuance: IssuanceService,
        login: LoginService,
        events: Arc<dyn EventSink>,
        metrics: Metrics,
    ) -> Self {
        Self {
            repo,
            store,
            clock,
            access,
            issuance,
            login,
            events,
            metrics,
        }
    }

    async fn find_client(&self, client_id: &str) -> Result<OAuthClient, OAuthError> {
        self.repo
            .find_oauth_client(client_id)
            .await?
            .ok_or_else(|| OAuthError::invalid_client("Unknown client"))
    }

    async fn authenticate_client(
        &self,
        client_id: &str,
        client_secret: &str,
    ) -> Result<OAuthClient, OAuthError> {
        let client = self.find_client(client_id).await?;
        if !client.verify_secret(client_secret) {
            tracing::warn!(client_id = %client_id, "Client authentication failed");
            return Err(OAuthError::invalid_client("Client authentication failed"));
        }
        Ok(client)
    }

    /// Basic credentials win over form fields.
    fn presented_credentials(
        request: &TokenRequest,
        basic: Option<ClientCredentials>,
    ) -> Option<ClientCredentials> {
        basic.or_else(|| {
            request.client_id.as_ref().map(|id| ClientCredentials {
                client_id: id.clone(),
                client_secret: request.client_secret.clone().unwrap_or_default(),
            })
        })
    }

    async fn enforce_access(
        &self,
        client: &OAuthClient,
        user: &User,
        origin: &RequestOrigin,
    ) -> Result<(), OAuthError> {
        let decision = self
            .access
            .evaluate(&AccessContext {
                user_id: user.user_id,
                app_id: Some(client.app_id.clone()),
                ip: origin.ip,
                user_agent: origin.user_agent.clone(),
                roles: user.roles.clone(),
                at: self.clock.now(),
                risk_score: None,
            })
            .await?;
        match decision.block_reason {
            Some(reason) => Err(ServiceError::PolicyBlocked(reason).into()),
            None => Ok(()),
        }
    }

    fn token_issued(&self, client_id: &str, user_id: Option<i64>, grant_type: &str, scope: &str) {
        self.events.publish(DomainEvent::new(
            event_types::OAUTH2_TOKEN_ISSUED,
            user_id,
            self.clock.now(),
            serde_json::json!({
                "client_id": client_id,
                "grant_type": grant_type,
                "scope": scope,
            }),
        ));
        tracing::info!(
            client_id = %client_id,
            user_id = ?user_id,
            grant_type,
            "OAuth2 token issued"
        );
    }

    // ==================== Authorize ====================

    /// Validate an authorization request for an authenticated user and
    /// return the redirect location carrying the new code.
    pub async fn authorize(
        &self,
        request: &AuthorizeRequest,
        user: &User,
        origin: &RequestOrigin,
    ) -> Result<String, OAuthError> {
        if request.response_type != "code" {
            return Err(OAuthError::new(
                OAuthErrorCode::UnsupportedResponseType,
                "Only response_type=code is supported",
            ));
        }

        let client = self.find_client(&request.client_id).await?;
        if !client.has_redirect_uri(&request.redirect_uri) {
            tracing::warn!(
                client_id = %client.client_id,
                "Authorization request with unregistered redirect_uri"
            );
            return Err(OAuthError::invalid_client(
                "redirect_uri does not match the registered value",
            ));
        }
        if !client.allows_grant("authorization_code") {
            return Err(OAuthError::new(
                OAuthErrorCode::UnauthorizedClient,
                "Client may not use the authorization code grant",
            ));
        }

        let scope = resolve_scope(&client, request.scope.as_deref())?;

        let code_challenge_method = match (
            &request.code_challenge,
            request.code_challenge_method.as_deref(),
        ) {
            (None, None) => None,
            (None, Some(_)) => {
                return Err(OAuthError::invalid_request(
                    "code_challenge_method without code_challenge",
                ))
            }
            (Some(_), None | Some("plain")) => Some("plain".to_string()),
            (Some(_), Some("S256")) => Some("S256".to_string()),
            (Some(_), Some(other)) => {
                return Err(OAuthError::invalid_request(format!(
                    "Unsupported code_challenge_method '{}'",
                    other
                )))
            }
        };

        self.enforce_access(&client, user, origin).await?;

        let code = random_token(AUTHORIZATION_CODE_BYTES);
        self.store
            .put_json(
                &keys::authorization_code(&code),
                &AuthorizationCodeContext {
                    client_id: client.client_id.clone(),
                    redirect_uri: request.redirect_uri.clone(),
                    user_id: user.user_id,
                    scope,
                    nonce: request.nonce.clone(),
                    code_challenge: request.code_challenge.clone(),
                    code_challenge_method,
                },
                AUTHORIZATION_CODE_TTL,
            )
            .await
            .map_err(ServiceError::from)?;
        self.metrics.artifact_issued(ArtifactKind::AuthorizationCode);

        tracing::info!(
            client_id = %client.client_id,
            user_id = user.user_id,
            "Authorization code issued"
        );

        let mut params = vec![("code", code.as_str())];
        if let Some(state) = request.state.as_deref() {
            params.push(("state", state));
        }
        Ok(append_query(&request.redirect_uri, &params))
    }

    // ==================== Token ====================

    pub async fn token(
        &self,
        request: TokenRequest,
        basic: Option<ClientCredentials>,
        origin: &RequestOrigin,
    ) -> Result<OAuthTokenSet, OAuthError> {
        match request.grant_type.as_str() {
            "authorization_code" => self.authorization_code_grant(request, basic).await,
            "client_credentials" => self.client_credentials_grant(request, basic).await,
            "password" => self.password_grant(request, basic, origin).await,
            "refresh_token" => self.refresh_token_grant(request, basic).await,
            "" => Err(OAuthError::invalid_request("grant_type is required")),
            other => Err(OAuthError::new(
                OAuthErrorCode::UnsupportedGrantType,
                format!("Unsupported grant_type '{}'", other),
            )),
        }
    }

    async fn authorization_code_grant(
        &self,
        request: TokenRequest,
        basic: Option<ClientCredentials>,
    ) -> Result<OAuthTokenSet, OAuthError> {
        let credentials = Self::presented_credentials(&request, basic)
            .ok_or_else(|| OAuthError::invalid_client("Client authentication required"))?;
        let client = self
            .authenticate_client(&credentials.client_id, &credentials.client_secret)
            .await?;

        let code = request
            .code
            .as_deref()
            .filter(|c| !c.is_empty())
            .ok_or_else(|| OAuthError::invalid_request("code is required"))?;

        // Redeemed before any further check so a rejected exchange still burns the code.
        let redeemed: Option<AuthorizationCodeContext> = self
            .store
            .take_json(&keys::authorization_code(code))
            .await
            .map_err(ServiceError::from)?;
        self.metrics
            .artifact_redeemed(ArtifactKind::AuthorizationCode, redeemed.is_some());
        let context = redeemed.ok_or(ServiceError::InvalidArtifact)?;

        if context.client_id != client.client_id {
            tracing::warn!(
                client_id = %client.client_id,
                "Authorization code presented by another client"
            );
            return Err(OAuthError::invalid_grant("Code was issued to another client"));
        }
        if request.redirect_uri.as_deref() != Some(context.redirect_uri.as_str()) {
            return Err(OAuthError::invalid_grant(
                "redirect_uri does not match the authorization request",
            ));
        }
        if let Some(challenge) = &context.code_challenge {
            let method = context.code_challenge_method.as_deref().unwrap_or("plain");
            let verified = request
                .code_verifier
                .as_deref()
                .map(|v| verify_pkce(challenge, method, v))
                .unwrap_or(false);
            if !verified {
                return Err(OAuthError::invalid_grant("PKCE verification failed"));
            }
        }

        let user = self
            .repo
            .find_user_by_id(context.user_id)
            .await?
            .filter(|u| u.is_active())
            .ok_or_else(|| OAuthError::invalid_grant("Resource owner is no longer active"))?;

        let tokens = self
            .issuance
            .issue_oauth_tokens(OAuthGrant {
                client_id: &client.client_id,
                user: Some(&user),
                scope: &context.scope,
                include_refresh: client.allows_grant("refresh_token"),
                nonce: context.nonce,
            })
            .await?;
        self.token_issued(
            &client.client_id,
            Some(user.user_id),
            "authorization_code",
            &tokens.scope,
        );
        Ok(tokens)
    }

    async fn client_credentials_grant(
        &self,
        request: TokenRequest,
        basic: Option<ClientCredentials>,
    ) -> Result<OAuthTokenSet, OAuthError> {
        let credentials = Self::presented_credentials(&request, basic)
            .ok_or_else(|| OAuthError::invalid_client("Client authentication required"))?;
        let client = self
            .authenticate_client(&credentials.client_id, &credentials.client_secret)
            .await?;
        if !client.allows_grant("client_credentials") {
            return Err(OAuthError::new(
                OAuthErrorCode::UnauthorizedClient,
                "Client may not use the client_credentials grant",
            ));
        }

        let scope = resolve_scope(&client, request.scope.as_deref())?;
        let tokens = self
            .issuance
            .issue_oauth_tokens(OAuthGrant {
                client_id: &client.client_id,
                user: None,
                scope: &scope,
                include_refresh: false,
                nonce: None,
            })
            .await?;
        self.token_issued(&client.client_id, None, "client_credentials", &tokens.scope);
        Ok(tokens)
    }

    /// Resource owner password grant. Client authentication is optional; a
    /// request without a client is a first-party login and gets session
    /// tokens. Both paths run the full login decision (lockout, risk,
    /// conditional access and MFA); a required second factor travels in
    /// `mfa_code`.
    async fn password_grant(
        &self,
        request: TokenRequest,
        basic: Option<ClientCredentials>,
        origin: &RequestOrigin,
    ) -> Result<OAuthTokenSet, OAuthError> {
        let client = match Self::presented_credentials(&request, basic) {
            Some(credentials) => {
                let client = self
                    .authenticate_client(&credentials.client_id, &credentials.client_secret)
                    .await?;
                if !client.allows_grant("password") {
                    return Err(OAuthError::new(
                        OAuthErrorCode::UnauthorizedClient,
                        "Client may not use the password grant",
                    ));
                }
                Some(client)
            }
            None => None,
        };

        let username = request
            .username
            .clone()
            .filter(|u| !u.is_empty())
            .ok_or_else(|| OAuthError::invalid_request("username is required"))?;
        let password = request
            .password
            .clone()
            .ok_or_else(|| OAuthError::invalid_request("password is required"))?;
        let login = LoginRequestContext {
            username,
            password,
            mfa_code: request.mfa_code.clone(),
            device_id: None,
            ip: origin.ip,
            user_agent: origin.user_agent.clone(),
        };

        let Some(client) = client else {
            let outcome = self.login.login(login).await?;
            tracing::info!(
                user_id = outcome.user.user_id,
                "First-party tokens issued via password grant"
            );
            return Ok(OAuthTokenSet {
                access_token: outcome.tokens.access_token,
                token_type: outcome.tokens.token_type,
                expires_in: outcome.tokens.expires_in,
                refresh_token: Some(outcome.tokens.refresh_token),
                id_token: None,
                scope: request.scope.unwrap_or_default(),
            });
        };

        let scope = resolve_scope(&client, request.scope.as_deref())?;
        let authenticated = self.login.authenticate(&login, Some(client.app_id.as_str())).await?;
        let tokens = self
            .issuance
            .issue_oauth_tokens(OAuthGrant {
                client_id: &client.client_id,
                user: Some(&authenticated.user),
                scope: &scope,
                include_refresh: true,
                nonce: None,
            })
            .await?;
        self.login.record_success(&login, &authenticated, None).await?;
        self.token_issued(
            &client.client_id,
            Some(authenticated.user.user_id),
            "password",
            &tokens.scope,
        );
        Ok(tokens)
    }

    async fn refresh_token_grant(
        &self,
        request: TokenRequest,
        basic: Option<ClientCredentials>,
    ) -> Result<OAuthTokenSet, OAuthError> {
        let credentials = Self::presented_credentials(&request, basic)
            .ok_or_else(|| OAuthError::invalid_client("Client authentication required"))?;
        let client = self
            .authenticate_client(&credentials.client_id, &credentials.client_secret)
            .await?;
        let refresh_token = request
            .refresh_token
            .as_deref()
            .filter(|t| !t.is_empty())
            .ok_or_else(|| OAuthError::invalid_request("refresh_token is required"))?;

        let record = self.issuance.lookup_refresh(refresh_token).await?;
        if record.client_id.as_deref() != Some(client.client_id.as_str()) {
            return Err(OAuthError::invalid_grant("Refresh token was issued to another client"));
        }

        let (access, record) = self.issuance.refresh_access(refresh_token).await?;
        let scope = record.scope.unwrap_or_default();
        self.token_issued(&client.client_id, Some(record.user_id), "refresh_token", &scope);
        Ok(OAuthTokenSet {
            access_token: access.access_token,
            token_type: access.token_type,
            expires_in: access.expires_in,
            refresh_token: None,
            id_token: None,
            scope,
        })
    }

    // ==================== UserInfo ====================

    pub async fn userinfo(&self, access_token: &str) -> Result<UserInfo, OAuthError> {
        let context = self
            .issuance
            .lookup_oauth_access(access_token)
            .await
            .map_err(|_| {
                OAuthError::new(OAuthErrorCode::InvalidToken, "Unknown or expired access token")
            })?;
        let user_id = context.user_id.ok_or_else(|| {
            OAuthError::new(OAuthErrorCode::InvalidToken, "Token was not issued for a user")
        })?;
        let user = self
            .repo
            .find_user_by_id(user_id)
            .await?
            .filter(|u| u.is_active())
            .ok_or_else(|| OAuthError::new(OAuthErrorCode::InvalidToken, "Unknown user"))?;

        let email = has_scope(&context.scope, "email");
        let profile = has_scope(&context.scope, "profile");
        Ok(UserInfo {
            sub: user.user_id.to_string(),
            email: email.then(|| user.email.clone()),
            email_verified: email.then_some(true),
            preferred_username: profile.then(|| user.username.clone()),
            name: profile.then(|| user.username.clone()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client() -> OAuthClient {
        OAuthClient::new("crm", "secret", "crm-app").with_redirect_uri("https://crm.example.com/cb")
    }

    #[test]
    fn test_empty_scope_gets_client_defaults() {
        assert_eq!(resolve_scope(&client(), None).unwrap(), "openid profile email");
        assert_eq!(resolve_scope(&client(), Some("  ")).unwrap(), "openid profile email");
    }

    #[test]
    fn test_scope_must_be_subset() {
        assert_eq!(resolve_scope(&client(), Some("openid email openid")).unwrap(), "openid email");
        assert!(matches!(
            resolve_scope(&client(), Some("openid admin")),
            Err(ServiceError::InvalidScope(_))
        ));
    }

    #[test]
    fn test_pkce_s256_reference_vector() {
        // RFC 7636 appendix B
        let verifier = "dBjftJeZ4CVP-mB92K27uhbUJU1p1r_wW1gFWFOEjXk";
        let challenge = "E9Melhoa2OwvFrEMTJguCHaoeK1t8URWbuGJSstw-cM";
        assert!(verify_pkce(challenge, "S256", verifier));
        assert!(!verify_pkce(challenge, "S256", "wrong"));
        assert!(verify_pkce("abc", "plain", "abc"));
        assert!(!verify_pkce("abc", "md5", "abc"));
    }

    #[test]
    fn test_append_query_encodes_and_joins() {
        assert_eq!(
            append_query("https://a.test/cb", &[("code", "x y"), ("state", "s")]),
            "https://a.test/cb?code=x%20y&state=s"
        );
        assert_eq!(
            append_query("https://a.test/cb?x=1", &[("code", "c")]),
            "https://a.test/cb?x=1&code=c"
        );
    }

    #[test]
    fn test_service_errors_map_to_oauth_codes() {
        assert_eq!(
            OAuthError::from(ServiceError::InvalidArtifact).code,
            OAuthErrorCode::InvalidGrant
        );
        assert_eq!(
            OAuthError::from(ServiceError::InvalidClient("x".into())).code,
            OAuthErrorCode::InvalidClient
        );
        assert_eq!(
            OAuthError::from(ServiceError::StoreUnavailable("down".into())).code,
            OAuthErrorCode::TemporarilyUnavailable
        );
    }
}
