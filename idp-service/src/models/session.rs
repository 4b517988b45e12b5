use chrono::{DateTime, Utc};
use sqlx::FromRow;
use uuid::Uuid;

/// Server-side shadow of an issued access token. Deleting it revokes the
/// session for federation flows; the JWT itself stays valid until it expires.
#[derive(Debug, Clone, FromRow)]
pub struct Session {
    pub session_id: Uuid,
    pub user_id: i64,
    pub ip_address: String,
    pub user_agent: String,
    pub expires_utc: DateTime<Utc>,
    pub created_utc: DateTime<Utc>,
}

impl Session {
    pub fn new(
        user_id: i64,
        ip: &str,
        user_agent: &str,
        now: DateTime<Utc>,
        expires_utc: DateTime<Utc>,
    ) -> Self {
        Self {
            session_id: Uuid::new_v4(),
            user_id,
            ip_address: ip.to_string(),
            user_agent: user_agent.to_string(),
            expires_utc,
            created_utc: now,
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_utc
    }
}
