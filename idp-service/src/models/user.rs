//! User model - principals that authenticate against the identity provider.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use utoipa::ToSchema;

/// User status codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UserStatus {
    Active,
    Disabled,
}

impl UserStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            UserStatus::Active => "active",
            UserStatus::Disabled => "disabled",
        }
    }
}

/// User entity with its role names already resolved.
#[derive(Debug, Clone, FromRow)]
pub struct User {
    pub user_id: i64,
    pub username: String,
    pub email: String,
    pub password_hash: String,
    pub status_code: String,
    pub mfa_enabled: bool,
    pub last_login_utc: Option<DateTime<Utc>>,
    pub created_utc: DateTime<Utc>,
    pub roles: Vec<String>,
}

impl User {
    /// Create a new active user. The id is assigned by the repository.
    pub fn new(username: String, email: String, password_hash: String) -> Self {
        Self {
            user_id: 0,
            username,
            email,
            password_hash,
            status_code: UserStatus::Active.as_str().to_string(),
            mfa_enabled: false,
            last_login_utc: None,
            created_utc: Utc::now(),
            roles: Vec::new(),
        }
    }

    pub fn with_roles(mut self, roles: &[&str]) -> Self {
        self.roles = roles.iter().map(|r| r.to_string()).collect();
        self
    }

    /// Check if user is active.
    pub fn is_active(&self) -> bool {
        self.status_code == UserStatus::Active.as_str()
    }

    pub fn summary(&self) -> UserSummary {
        UserSummary::from(self)
    }
}

/// User as returned to API callers (no credential material).
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct UserSummary {
    pub user_id: i64,
    pub username: String,
    pub email: String,
    pub roles: Vec<String>,
    pub mfa_enabled: bool,
}

impl From<&User> for UserSummary {
    fn from(u: &User) -> Self {
        Self {
            user_id: u.user_id,
            username: u.username.clone(),
            email: u.email.clone(),
            roles: u.roles.clone(),
            mfa_enabled: u.mfa_enabled,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_user_is_active() {
        let user = User::new("alice".into(), "alice@example.com".into(), "hash".into());
        assert!(user.is_active());
        assert!(!user.mfa_enabled);
        assert!(user.last_login_utc.is_none());
    }

    #[test]
    fn test_disabled_user_is_not_active() {
        let mut user = User::new("bob".into(), "bob@example.com".into(), "hash".into());
        user.status_code = UserStatus::Disabled.as_str().to_string();
        assert!(!user.is_active());
    }
}
