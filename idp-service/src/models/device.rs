//! Known devices per user, keyed by fingerprint.

use chrono::{DateTime, Utc};
use serde::Serialize;
use sha2::{Digest, Sha256};
use sqlx::FromRow;

#[derive(Debug, Clone, FromRow, Serialize)]
pub struct Device {
    pub device_row_id: i64,
    pub user_id: i64,
    pub device_id: String,
    pub trusted: bool,
    pub user_agent: String,
    pub last_ip: String,
    pub login_count: i32,
    pub fail_count: i32,
    pub first_seen_utc: DateTime<Utc>,
    pub last_seen_utc: DateTime<Utc>,
}

impl Device {
    pub fn new(
        user_id: i64,
        device_id: String,
        user_agent: &str,
        ip: &str,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            device_row_id: 0,
            user_id,
            device_id,
            trusted: false,
            user_agent: user_agent.to_string(),
            last_ip: ip.to_string(),
            login_count: 1,
            fail_count: 0,
            first_seen_utc: now,
            last_seen_utc: now,
        }
    }
}

/// Fingerprint derived from user agent and IP. Weak: the same browser on a
/// new network becomes a new device.
pub fn device_fingerprint(user_agent: &str, ip: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(user_agent.as_bytes());
    hasher.update(b"|");
    hasher.update(ip.as_bytes());
    hex::encode(hasher.finalize())
}
