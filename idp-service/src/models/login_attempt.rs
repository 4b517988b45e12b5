use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::FromRow;

/// Append-only record of a login attempt.
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct LoginAttempt {
    pub attempt_id: i64,
    pub user_id: Option<i64>,
    /// The username exactly as submitted, even when it resolved to nobody.
    pub username: String,
    pub ip_address: String,
    pub user_agent: String,
    pub success: bool,
    pub failure_reason: Option<String>,
    pub risk_score: i32,
    pub mfa_required: bool,
    pub created_utc: DateTime<Utc>,
}

impl LoginAttempt {
    pub fn new(username: &str, ip: &str, user_agent: &str, now: DateTime<Utc>) -> Self {
        Self {
            attempt_id: 0,
            user_id: None,
            username: username.to_string(),
            ip_address: ip.to_string(),
            user_agent: user_agent.to_string(),
            success: false,
            failure_reason: None,
            risk_score: 0,
            mfa_required: false,
            created_utc: now,
        }
    }
}
