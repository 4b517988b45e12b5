use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use chrono::{DateTime, Duration, Utc};
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use rsa::{pkcs8::DecodePublicKey, traits::PublicKeyParts, RsaPublicKey};
use serde::{Deserialize, Serialize};
use std::fs;
use std::sync::Arc;
use uuid::Uuid;

use crate::config::JwtConfig;
use crate::models::User;
use crate::services::clock::Clock;

/// Signs and verifies RS256 tokens. Expiry is checked against the injected
/// clock rather than the wall clock.
#[derive(Clone)]
pub struct TokenService {
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    jwk: Jwk,
    issuer: String,
    key_id: String,
    access_token_expiry_minutes: i64,
    refresh_token_expiry_days: i64,
    clock: Arc<dyn Clock>,
}

/// Claims for access tokens, both first-party and OAuth2.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccessTokenClaims {
    /// User id, or the client id for client-credentials tokens
    pub sub: String,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub roles: Vec<String>,
    pub iss: String,
    pub iat: i64,
    pub exp: i64,
    pub jti: String,
    /// Session row backing this token
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sid: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,
}

impl AccessTokenClaims {
    pub fn user_id(&self) -> Option<i64> {
        self.sub.parse().ok()
    }

    pub fn session_id(&self) -> Option<Uuid> {
        self.sid.as_deref().and_then(|s| s.parse().ok())
    }
}

/// OIDC ID token claims.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdTokenClaims {
    pub iss: String,
    pub sub: String,
    pub aud: String,
    pub iat: i64,
    pub exp: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub nonce: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub preferred_username: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Jwk {
    pub kty: String,
    #[serde(rename = "use")]
    pub use_: String,
    pub alg: String,
    pub kid: String,
    pub n: String,
    pub e: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JwkSet {
    pub keys: Vec<Jwk>,
}

impl TokenService {
    /// Load the RS256 key pair from the configured PEM files.
    pub fn new(config: &JwtConfig, clock: Arc<dyn Clock>) -> Result<Self, anyhow::Error> {
        let private_key_pem = fs::read_to_string(&config.private_key_path).map_err(|e| {
            anyhow::anyhow!(
                "Failed to read private key from {}: {}",
                config.private_key_path,
                e
            )
        })?;
        let public_key_pem = fs::read_to_string(&config.public_key_path).map_err(|e| {
            anyhow::anyhow!(
                "Failed to read public key from {}: {}",
                config.public_key_path,
                e
            )
        })?;

        Self::from_pem(config, &private_key_pem, &public_key_pem, clock)
    }

    pub fn from_pem(
        config: &JwtConfig,
        private_key_pem: &str,
        public_key_pem: &str,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, anyhow::Error> {
        let encoding_key = EncodingKey::from_rsa_pem(private_key_pem.as_bytes())
            .map_err(|e| anyhow::anyhow!("Failed to parse private key: {}", e))?;
        let decoding_key = DecodingKey::from_rsa_pem(public_key_pem.as_bytes())
            .map_err(|e| anyhow::anyhow!("Failed to parse public key: {}", e))?;

        let public_key = RsaPublicKey::from_public_key_pem(public_key_pem)
            .map_err(|e| anyhow::anyhow!("Failed to parse public key for JWKS: {}", e))?;
        let jwk = Jwk {
            kty: "RSA".to_string(),
            use_: "sig".to_string(),
            alg: "RS256".to_string(),
            kid: config.key_id.clone(),
            n: URL_SAFE_NO_PAD.encode(public_key.n().to_bytes_be()),
            e: URL_SAFE_NO_PAD.encode(public_key.e().to_bytes_be()),
        };

        tracing::info!(kid = %config.key_id, "Token service initialized with RS256 keys");

        Ok(Self {
            encoding_key,
            decoding_key,
            jwk,
            issuer: config.issuer.clone(),
            key_id: config.key_id.clone(),
            access_token_expiry_minutes: config.access_token_expiry_minutes,
            refresh_token_expiry_days: config.refresh_token_expiry_days,
            clock,
        })
    }

    pub fn issuer(&self) -> &str {
        &self.issuer
    }

    pub fn access_token_lifetime(&self) -> Duration {
        Duration::minutes(self.access_token_expiry_minutes)
    }

    pub fn refresh_token_lifetime(&self) -> Duration {
        Duration::days(self.refresh_token_expiry_days)
    }

    fn header(&self) -> Header {
        let mut header = Header::new(Algorithm::RS256);
        header.kid = Some(self.key_id.clone());
        header
    }

    fn sign<T: Serialize>(&self, claims: &T) -> Result<String, anyhow::Error> {
        encode(&self.header(), claims, &self.encoding_key)
            .map_err(|e| anyhow::anyhow!("Failed to encode token: {}", e))
    }

    /// Access token for an authenticated user.
    pub fn user_access_token(
        &self,
        user: &User,
        session_id: Option<Uuid>,
        now: DateTime<Utc>,
        lifetime: Duration,
    ) -> Result<String, anyhow::Error> {
        self.sign(&AccessTokenClaims {
            sub: user.user_id.to_string(),
            username: user.username.clone(),
            roles: user.roles.clone(),
            iss: self.issuer.clone(),
            iat: now.timestamp(),
            exp: (now + lifetime).timestamp(),
            jti: Uuid::new_v4().to_string(),
            sid: session_id.map(|s| s.to_string()),
            client_id: None,
            scope: None,
        })
    }

    /// Access token issued to an OAuth2 client, on behalf of a user or itself.
    pub fn client_access_token(
        &self,
        client_id: &str,
        user: Option<&User>,
        scope: &str,
        now: DateTime<Utc>,
    ) -> Result<String, anyhow::Error> {
        let (sub, username, roles) = match user {
            Some(u) => (u.user_id.to_string(), u.username.clone(), u.roles.clone()),
            None => (client_id.to_string(), String::new(), Vec::new()),
        };
        self.sign(&AccessTokenClaims {
            sub,
            username,
            roles,
            iss: self.issuer.clone(),
            iat: now.timestamp(),
            exp: (now + self.access_token_lifetime()).timestamp(),
            jti: Uuid::new_v4().to_string(),
            sid: None,
            client_id: Some(client_id.to_string()),
            scope: Some(scope.to_string()),
        })
    }

    pub fn id_token(
        &self,
        user: &User,
        client_id: &str,
        nonce: Option<String>,
        include_email: bool,
        include_profile: bool,
        now: DateTime<Utc>,
    ) -> Result<String, anyhow::Error> {
        self.sign(&IdTokenClaims {
            iss: self.issuer.clone(),
            sub: user.user_id.to_string(),
            aud: client_id.to_string(),
            iat: now.timestamp(),
            exp: (now + self.access_token_lifetime()).timestamp(),
            nonce,
            email: include_email.then(|| user.email.clone()),
            preferred_username: include_profile.then(|| user.username.clone()),
        })
    }

    /// Verify signature, issuer and expiry.
    pub fn validate_access_token(&self, token: &str) -> Result<AccessTokenClaims, anyhow::Error> {
        let mut validation = Validation::new(Algorithm::RS256);
        validation.validate_exp = false;
        validation.set_issuer(&[&self.issuer]);

        let claims = decode::<AccessTokenClaims>(token, &self.decoding_key, &validation)
            .map_err(|e| anyhow::anyhow!("Invalid access token: {}", e))?
            .claims;

        if claims.exp <= self.clock.now().timestamp() {
            return Err(anyhow::anyhow!("Invalid access token: expired"));
        }

        Ok(claims)
    }

    pub fn decode_id_token(
        &self,
        token: &str,
        client_id: &str,
    ) -> Result<IdTokenClaims, anyhow::Error> {
        let mut validation = Validation::new(Algorithm::RS256);
        validation.validate_exp = false;
        validation.set_issuer(&[&self.issuer]);
        validation.set_audience(&[client_id]);

        Ok(decode::<IdTokenClaims>(token, &self.decoding_key, &validation)
            .map_err(|e| anyhow::anyhow!("Invalid ID token: {}", e))?
            .claims)
    }

    pub fn jwks(&self) -> JwkSet {
        JwkSet {
            keys: vec![self.jwk.clone()],
        }
    }
}
