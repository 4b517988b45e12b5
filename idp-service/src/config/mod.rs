use serde::Deserialize;
use service_core::config as core_config;
use service_core::error::AppError;
use std::env;

#[derive(Debug, Clone, Deserialize)]
pub struct IdpConfig {
    #[serde(flatten)]
    pub common: core_config::Config,
    pub environment: Environment,
    pub service_name: String,
    pub service_version: String,
    pub log_level: String,
    pub otlp_endpoint: Option<String>,
    pub public_url: String,
    pub database: Option<DatabaseConfig>,
    pub redis: Option<RedisConfig>,
    pub jwt: JwtConfig,
    pub risk: RiskConfig,
    pub saml: SamlIdpConfig,
    pub smtp: Option<SmtpConfig>,
    pub sms: Option<SmsConfig>,
    pub webhooks: WebhookConfig,
    pub delivery: DeliveryConfig,
    pub security: SecurityConfig,
    pub rate_limit: RateLimitConfig,
    pub bootstrap_admin: Option<BootstrapAdminConfig>,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    Dev,
    Prod,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub min_connections: u32,
    pub acquire_timeout_seconds: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RedisConfig {
    pub url: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct JwtConfig {
    pub private_key_path: String,
    pub public_key_path: String,
    pub issuer: String,
    pub key_id: String,
    pub access_token_expiry_minutes: i64,
    pub refresh_token_expiry_days: i64,
}

/// What to do when risk alone demands MFA but the user has no verified device.
#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum RiskMfaFallback {
    Allow,
    Deny,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RiskConfig {
    pub on_risk_mfa_unavailable: RiskMfaFallback,
    pub mfa_threshold: u8,
    pub failed_attempt_window_seconds: u64,
    pub lockout_threshold: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SamlIdpConfig {
    pub entity_id: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SmtpConfig {
    pub host: String,
    pub user: String,
    pub password: String,
    pub from: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SmsConfig {
    pub gateway_url: String,
    pub api_key: String,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct WebhookConfig {
    pub urls: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DeliveryConfig {
    pub workers: usize,
    pub queue_capacity: usize,
    pub max_retries: u32,
    pub attempt_timeout_seconds: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SecurityConfig {
    pub allowed_origins: Vec<String>,
    pub secure_cookies: bool,
}

/// Initial administrator created at start-up when absent.
#[derive(Debug, Clone, Deserialize)]
pub struct BootstrapAdminConfig {
    pub username: String,
    pub email: String,
    pub password: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RateLimitConfig {
    pub login_attempts: u32,
    pub login_window_seconds: u64,
    pub token_attempts: u32,
    pub token_window_seconds: u64,
    pub global_ip_limit: u32,
    pub global_ip_window_seconds: u64,
}

impl IdpConfig {
    pub fn from_env() -> Result<Self, AppError> {
        let common_config = core_config::Config::load()?;

        let env_str = env::var("ENVIRONMENT").unwrap_or_else(|_| "dev".to_string());
        let environment: Environment = env_str
            .parse()
            .map_err(|e: String| AppError::ConfigError(anyhow::anyhow!(e)))?;

        let is_prod = environment == Environment::Prod;
        let public_url = get_env("PUBLIC_URL", Some("http://localhost:8080"), is_prod)?;

        let config = IdpConfig {
            common: common_config,
            environment: environment.clone(),
            service_name: get_env("SERVICE_NAME", Some("idp-service"), false)?,
            service_version: get_env("SERVICE_VERSION", Some(env!("CARGO_PKG_VERSION")), false)?,
            log_level: get_env("LOG_LEVEL", Some("info"), false)?,
            otlp_endpoint: optional_env("OTEL_EXPORTER_OTLP_ENDPOINT"),
            database: match optional_env("DATABASE_URL") {
                Some(url) => Some(DatabaseConfig {
                    url,
                    max_connections: parse_env("DATABASE_MAX_CONNECTIONS", "10")?,
                    min_connections: parse_env("DATABASE_MIN_CONNECTIONS", "1")?,
                    acquire_timeout_seconds: parse_env("DATABASE_ACQUIRE_TIMEOUT_SECONDS", "30")?,
                }),
                None if is_prod => {
                    return Err(AppError::ConfigError(anyhow::anyhow!(
                        "DATABASE_URL is required in production but not set"
                    )))
                }
                None => None,
            },
            redis: match optional_env("REDIS_URL") {
                Some(url) => Some(RedisConfig { url }),
                None if is_prod => {
                    return Err(AppError::ConfigError(anyhow::anyhow!(
                        "REDIS_URL is required in production but not set"
                    )))
                }
                None => None,
            },
            jwt: JwtConfig {
                private_key_path: get_env(
                    "JWT_PRIVATE_KEY_PATH",
                    Some("keys/private.pem"),
                    is_prod,
                )?,
                public_key_path: get_env("JWT_PUBLIC_KEY_PATH", Some("keys/public.pem"), is_prod)?,
                issuer: get_env("JWT_ISSUER", Some(public_url.as_str()), false)?,
                key_id: get_env("JWT_KEY_ID", Some("idp-signing-key"), false)?,
                access_token_expiry_minutes: parse_env("JWT_ACCESS_TOKEN_EXPIRY_MINUTES", "15")?,
                refresh_token_expiry_days: parse_env("JWT_REFRESH_TOKEN_EXPIRY_DAYS", "7")?,
            },
            risk: RiskConfig {
                on_risk_mfa_unavailable: get_env("ON_RISK_MFA_UNAVAILABLE", Some("deny"), false)?
                    .parse()
                    .map_err(|e: String| AppError::ConfigError(anyhow::anyhow!(e)))?,
                mfa_threshold: parse_env("RISK_MFA_THRESHOLD", "50")?,
                failed_attempt_window_seconds: parse_env(
                    "RISK_FAILED_ATTEMPT_WINDOW_SECONDS",
                    "900",
                )?,
                lockout_threshold: parse_env("LOGIN_LOCKOUT_THRESHOLD", "10")?,
            },
            saml: SamlIdpConfig {
                entity_id: get_env(
                    "SAML_IDP_ENTITY_ID",
                    Some(format!("{}/saml/metadata", public_url).as_str()),
                    false,
                )?,
            },
            smtp: match optional_env("SMTP_HOST") {
                Some(host) => Some(SmtpConfig {
                    host,
                    user: get_env("SMTP_USER", None, false)?,
                    password: get_env("SMTP_PASSWORD", None, false)?,
                    from: get_env("SMTP_FROM", None, false)?,
                }),
                None => None,
            },
            sms: match optional_env("SMS_GATEWAY_URL") {
                Some(gateway_url) => Some(SmsConfig {
                    gateway_url,
                    api_key: get_env("SMS_GATEWAY_API_KEY", None, false)?,
                }),
                None => None,
            },
            webhooks: WebhookConfig {
                urls: optional_env("WEBHOOK_URLS")
                    .map(|v| split_list(&v))
                    .unwrap_or_default(),
            },
            delivery: DeliveryConfig {
                workers: parse_env("DELIVERY_WORKERS", "4")?,
                queue_capacity: parse_env("DELIVERY_QUEUE_CAPACITY", "1024")?,
                max_retries: parse_env("DELIVERY_MAX_RETRIES", "3")?,
                attempt_timeout_seconds: parse_env("DELIVERY_ATTEMPT_TIMEOUT_SECONDS", "10")?,
            },
            security: SecurityConfig {
                allowed_origins: split_list(&get_env(
                    "ALLOWED_ORIGINS",
                    Some("http://localhost:3000"),
                    is_prod,
                )?),
                secure_cookies: is_prod,
            },
            rate_limit: RateLimitConfig {
                login_attempts: parse_env("RATE_LIMIT_LOGIN_ATTEMPTS", "20")?,
                login_window_seconds: parse_env("RATE_LIMIT_LOGIN_WINDOW_SECONDS", "60")?,
                token_attempts: parse_env("RATE_LIMIT_TOKEN_ATTEMPTS", "60")?,
                token_window_seconds: parse_env("RATE_LIMIT_TOKEN_WINDOW_SECONDS", "60")?,
                global_ip_limit: parse_env("RATE_LIMIT_GLOBAL_IP_LIMIT", "300")?,
                global_ip_window_seconds: parse_env("RATE_LIMIT_GLOBAL_IP_WINDOW_SECONDS", "60")?,
            },
            bootstrap_admin: match (
                optional_env("BOOTSTRAP_ADMIN_USERNAME"),
                optional_env("BOOTSTRAP_ADMIN_EMAIL"),
                optional_env("BOOTSTRAP_ADMIN_PASSWORD"),
            ) {
                (Some(username), Some(email), Some(password)) => Some(BootstrapAdminConfig {
                    username,
                    email,
                    password,
                }),
                _ => None,
            },
            public_url,
        };

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), AppError> {
        if self.common.port == 0 {
            return Err(AppError::ConfigError(anyhow::anyhow!(
                "PORT must be greater than 0"
            )));
        }

        if self.jwt.access_token_expiry_minutes <= 0 {
            return Err(AppError::ConfigError(anyhow::anyhow!(
                "JWT_ACCESS_TOKEN_EXPIRY_MINUTES must be positive"
            )));
        }

        if self.jwt.refresh_token_expiry_days <= 0 {
            return Err(AppError::ConfigError(anyhow::anyhow!(
                "JWT_REFRESH_TOKEN_EXPIRY_DAYS must be positive"
            )));
        }

        if self.risk.failed_attempt_window_seconds == 0 {
            return Err(AppError::ConfigError(anyhow::anyhow!(
                "RISK_FAILED_ATTEMPT_WINDOW_SECONDS must be positive"
            )));
        }

        if self.risk.mfa_threshold > 100 {
            return Err(AppError::ConfigError(anyhow::anyhow!(
                "RISK_MFA_THRESHOLD must be within 0..=100"
            )));
        }

        if self.delivery.workers == 0 || self.delivery.queue_capacity == 0 {
            return Err(AppError::ConfigError(anyhow::anyhow!(
                "DELIVERY_WORKERS and DELIVERY_QUEUE_CAPACITY must be positive"
            )));
        }

        if let Some(admin) = &self.bootstrap_admin {
            if admin.password.len() < 8 {
                return Err(AppError::ConfigError(anyhow::anyhow!(
                    "BOOTSTRAP_ADMIN_PASSWORD must be at least 8 characters"
                )));
            }
        }

        if self.environment == Environment::Prod {
            if self.security.allowed_origins.iter().any(|o| o == "*") {
                return Err(AppError::ConfigError(anyhow::anyhow!(
                    "Wildcard CORS origin not allowed in production"
                )));
            }

            if self.risk.on_risk_mfa_unavailable == RiskMfaFallback::Allow {
                tracing::warn!(
                    "ON_RISK_MFA_UNAVAILABLE=allow: risky logins without an MFA device will proceed"
                );
            }
        }

        Ok(())
    }
}

fn get_env(key: &str, default: Option<&str>, is_prod: bool) -> Result<String, AppError> {
    match env::var(key) {
        Ok(val) => Ok(val),
        Err(_) => {
            if is_prod {
                Err(AppError::ConfigError(anyhow::anyhow!(format!(
                    "{} is required in production but not set",
                    key
                ))))
            } else if let Some(def) = default {
                Ok(def.to_string())
            } else {
                Err(AppError::ConfigError(anyhow::anyhow!(format!(
                    "{} is required but not set",
                    key
                ))))
            }
        }
    }
}

fn optional_env(key: &str) -> Option<String> {
    env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn parse_env<T>(key: &str, default: &str) -> Result<T, AppError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    get_env(key, Some(default), false)?
        .parse()
        .map_err(|e: T::Err| AppError::ConfigError(anyhow::anyhow!("{}: {}", key, e)))
}

fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

impl std::str::FromStr for Environment {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "dev" => Ok(Environment::Dev),
            "prod" => Ok(Environment::Prod),
            _ => Err(format!("Invalid environment: {}", s)),
        }
    }
}

impl std::str::FromStr for RiskMfaFallback {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "allow" => Ok(RiskMfaFallback::Allow),
            "deny" => Ok(RiskMfaFallback::Deny),
            _ => Err(format!("Invalid ON_RISK_MFA_UNAVAILABLE value: {}", s)),
        }
    }
}
