use std::sync::Arc;

use crate::config::BootstrapAdminConfig;
use crate::models::User;
use crate::services::{IdentityRepository, ServiceError};
use crate::utils::hash_password;

pub const ADMIN_ROLE: &str = "admin";

/// Create the configured administrator unless a user with that username or
/// email already exists. Returns whether a user was created.
pub async fn ensure_admin(
    repo: &Arc<dyn IdentityRepository>,
    admin: &BootstrapAdminConfig,
) -> Result<bool, ServiceError> {
    if repo.find_user_by_login(&admin.username).await?.is_some()
        || repo.find_user_by_email(&admin.email).await?.is_some()
    {
        tracing::debug!(username = %admin.username, "Bootstrap administrator already present");
        return Ok(false);
    }

    let password_hash = hash_password(&admin.password)?;
    let user = repo
        .insert_user(
            &User::new(admin.username.clone(), admin.email.clone(), password_hash)
                .with_roles(&[ADMIN_ROLE]),
        )
        .await?;
    tracing::info!(
        user_id = user.user_id,
        username = %user.username,
        "Bootstrap administrator created"
    );
    Ok(true)
}
