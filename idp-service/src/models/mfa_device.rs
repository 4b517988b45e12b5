use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MfaMethod {
    Totp,
    Sms,
    Email,
}

impl MfaMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            MfaMethod::Totp => "totp",
            MfaMethod::Sms => "sms",
            MfaMethod::Email => "email",
        }
    }
}

impl std::str::FromStr for MfaMethod {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "totp" => Ok(MfaMethod::Totp),
            "sms" => Ok(MfaMethod::Sms),
            "email" => Ok(MfaMethod::Email),
            _ => Err(format!("Invalid MFA method: {}", s)),
        }
    }
}

/// Per-user MFA enrolment. Only a verified device gates login.
#[derive(Debug, Clone, FromRow)]
pub struct MfaDevice {
    pub mfa_device_id: i64,
    pub user_id: i64,
    pub method_code: String,
    /// Base32 TOTP secret for `totp`.
    pub secret: Option<String>,
    /// Phone number or email address for `sms`/`email`.
    pub contact: Option<String>,
    pub verified: bool,
    pub created_utc: DateTime<Utc>,
}

impl MfaDevice {
    pub fn totp(user_id: i64, secret: &str) -> Self {
        Self {
            mfa_device_id: 0,
            user_id,
            method_code: MfaMethod::Totp.as_str().to_string(),
            secret: Some(secret.to_string()),
            contact: None,
            verified: true,
            created_utc: Utc::now(),
        }
    }

    pub fn with_contact(user_id: i64, method: MfaMethod, contact: &str) -> Self {
        Self {
            mfa_device_id: 0,
            user_id,
            method_code: method.as_str().to_string(),
            secret: None,
            contact: Some(contact.to_string()),
            verified: true,
            created_utc: Utc::now(),
        }
    }

    pub fn method(&self) -> Option<MfaMethod> {
        self.method_code.parse().ok()
    }
}
