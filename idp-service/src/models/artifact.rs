//! Values kept in the ephemeral store, and the keys they live under.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub mod keys {
    pub fn authorization_code(code: &str) -> String {
        format!("oauth_code:{}", code)
    }

    pub fn cas_ticket(ticket: &str) -> String {
        format!("cas_ticket:{}", ticket)
    }

    pub fn mfa_otp(user_id: i64) -> String {
        format!("mfa_otp:{}", user_id)
    }

    /// Keyed by token hash so a store dump does not leak usable tokens.
    pub fn password_reset(token_hash: &str) -> String {
        format!("reset:{}", token_hash)
    }

    pub fn refresh_token(token_hash: &str) -> String {
        format!("refresh:{}", token_hash)
    }

    pub fn oauth_access(token_hash: &str) -> String {
        format!("oauth_access:{}", token_hash)
    }

    pub fn saml_request(request_id: &str) -> String {
        format!("saml_req:{}", request_id)
    }

    pub fn login_failures(ip: &str, username: &str) -> String {
        format!("login_fail:{}:{}", ip, username.to_lowercase())
    }

    pub fn ip_failures(ip: &str) -> String {
        format!("ip_fail:{}", ip)
    }
}

/// Artifact kinds, used as metric labels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArtifactKind {
    AuthorizationCode,
    CasTicket,
    MfaOtp,
    PasswordReset,
    RefreshToken,
    SamlRequest,
}

impl ArtifactKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ArtifactKind::AuthorizationCode => "authorization_code",
            ArtifactKind::CasTicket => "cas_ticket",
            ArtifactKind::MfaOtp => "mfa_otp",
            ArtifactKind::PasswordReset => "password_reset",
            ArtifactKind::RefreshToken => "refresh_token",
            ArtifactKind::SamlRequest => "saml_request",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthorizationCodeContext {
    pub client_id: String,
    pub redirect_uri: String,
    pub user_id: i64,
    pub scope: String,
    pub nonce: Option<String>,
    pub code_challenge: Option<String>,
    pub code_challenge_method: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CasTicketContext {
    pub user_id: i64,
    pub username: String,
    pub service: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PasswordResetContext {
    pub user_id: i64,
}

/// Refresh tokens from first-party login carry no client.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RefreshContext {
    pub user_id: i64,
    pub client_id: Option<String>,
    pub scope: Option<String>,
    /// Session the refreshed access tokens stay bound to.
    #[serde(default)]
    pub session_id: Option<Uuid>,
    /// Session lifetime set by conditional access, in minutes.
    #[serde(default)]
    pub duration_override: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OAuthAccessContext {
    pub client_id: String,
    pub user_id: Option<i64>,
    pub scope: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SamlRequestContext {
    pub issuer: String,
    pub acs_url: Option<String>,
}
