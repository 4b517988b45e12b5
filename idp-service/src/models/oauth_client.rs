//! OAuth2 clients and issued-token records (read-only lookups for the core).

use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use sqlx::FromRow;
use subtle::ConstantTimeEq;
use uuid::Uuid;

#[derive(Debug, Clone, FromRow)]
pub struct OAuthClient {
    pub client_id: String,
    pub client_secret_hash: String,
    pub client_name: String,
    pub app_id: String,
    pub redirect_uris: Vec<String>,
    pub allowed_scopes: Vec<String>,
    pub grant_types: Vec<String>,
    pub created_utc: DateTime<Utc>,
}

impl OAuthClient {
    pub fn new(client_id: &str, client_secret: &str, app_id: &str) -> Self {
        Self {
            client_id: client_id.to_string(),
            client_secret_hash: hash_secret(client_secret),
            client_name: client_id.to_string(),
            app_id: app_id.to_string(),
            redirect_uris: Vec::new(),
            allowed_scopes: vec!["openid".into(), "profile".into(), "email".into()],
            grant_types: vec![
                "authorization_code".into(),
                "client_credentials".into(),
                "password".into(),
                "refresh_token".into(),
            ],
            created_utc: Utc::now(),
        }
    }

    pub fn with_redirect_uri(mut self, uri: &str) -> Self {
        self.redirect_uris.push(uri.to_string());
        self
    }

    /// Constant-time comparison of the presented secret against the stored hash.
    pub fn verify_secret(&self, presented: &str) -> bool {
        let presented = hash_secret(presented);
        presented
            .as_bytes()
            .ct_eq(self.client_secret_hash.as_bytes())
            .into()
    }

    /// Exact string equality; no prefix or wildcard matching.
    pub fn has_redirect_uri(&self, uri: &str) -> bool {
        self.redirect_uris.iter().any(|u| u == uri)
    }

    pub fn allows_grant(&self, grant_type: &str) -> bool {
        self.grant_types.iter().any(|g| g == grant_type)
    }
}

/// Persisted record of an issued OAuth2 access token. Only a hash of the
/// token is stored.
#[derive(Debug, Clone, FromRow)]
pub struct OAuthToken {
    pub token_id: Uuid,
    pub token_hash: String,
    pub client_id: String,
    pub user_id: Option<i64>,
    pub scope: String,
    pub expires_utc: DateTime<Utc>,
    pub created_utc: DateTime<Utc>,
}

pub fn hash_secret(secret: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(secret.as_bytes());
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_secret_verification() {
        let client = OAuthClient::new("crm", "s3cret", "crm-app");
        assert!(client.verify_secret("s3cret"));
        assert!(!client.verify_secret("s3cret "));
        assert!(!client.verify_secret(""));
    }

    #[test]
    fn test_redirect_uri_is_exact_match() {
        let client =
            OAuthClient::new("crm", "s", "crm-app").with_redirect_uri("https://crm.example.com/cb");
        assert!(client.has_redirect_uri("https://crm.example.com/cb"));
        assert!(!client.has_redirect_uri("https://crm.example.com/cb/"));
        assert!(!client.has_redirect_uri("https://crm.example.com/cb?x=1"));
    }
}
