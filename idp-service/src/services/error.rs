use service_core::error::AppError;
use thiserror::Error;

use crate::services::ephemeral::StoreError;

#[derive(Error, Debug)]
pub enum ServiceError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Ephemeral store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("Internal server error: {0}")]
    Internal(#[from] anyhow::Error),

    /// Unknown user, wrong password, or an inactive account. Callers cannot
    /// tell these apart.
    #[error("Invalid credentials")]
    InvalidCredentials,

    #[error("Account disabled")]
    AccountDisabled,

    #[error("{0}")]
    MfaRequired(String),

    #[error("Invalid MFA code")]
    MfaInvalid,

    #[error("Access blocked by policy: {0}")]
    PolicyBlocked(String),

    /// Expired, unknown or already-redeemed code, ticket or token.
    #[error("Invalid or expired artifact")]
    InvalidArtifact,

    #[error("Invalid client: {0}")]
    InvalidClient(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Invalid scope: {0}")]
    InvalidScope(String),

    #[error("Too many failed attempts")]
    TooManyAttempts,

    #[error("User not found")]
    UserNotFound,

    #[error("Validation error: {0}")]
    Validation(String),
}

impl From<StoreError> for ServiceError {
    fn from(err: StoreError) -> Self {
        ServiceError::StoreUnavailable(err.to_string())
    }
}

impl From<ServiceError> for AppError {
    fn from(err: ServiceError) -> Self {
        match err {
            ServiceError::Database(e) => AppError::DatabaseError(anyhow::Error::new(e)),
            ServiceError::StoreUnavailable(cause) => {
                tracing::error!(cause = %cause, "Ephemeral store unavailable");
                AppError::ServiceUnavailable
            }
            ServiceError::Internal(e) => AppError::InternalError(e),
            ServiceError::InvalidCredentials | ServiceError::AccountDisabled => {
                AppError::AuthError(anyhow::anyhow!("Invalid credentials"))
            }
            ServiceError::MfaRequired(msg) => AppError::Unauthorized(anyhow::anyhow!(msg)),
            ServiceError::MfaInvalid => AppError::Unauthorized(anyhow::anyhow!("Invalid MFA code")),
            ServiceError::PolicyBlocked(reason) => {
                AppError::Forbidden(anyhow::anyhow!("Access blocked by policy: {}", reason))
            }
            ServiceError::InvalidArtifact => {
                AppError::BadRequest(anyhow::anyhow!("Invalid or expired token"))
            }
            ServiceError::InvalidClient(reason) => AppError::Unauthorized(anyhow::anyhow!(reason)),
            ServiceError::InvalidRequest(msg)
            | ServiceError::InvalidScope(msg)
            | ServiceError::Validation(msg) => AppError::BadRequest(anyhow::anyhow!(msg)),
            ServiceError::TooManyAttempts => AppError::TooManyRequests(
                "Too many failed login attempts. Please try again later.".to_string(),
                None,
            ),
            ServiceError::UserNotFound => AppError::NotFound(anyhow::anyhow!("User not found")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use service_core::axum::{http::StatusCode, response::IntoResponse};

    fn status(err: ServiceError) -> StatusCode {
        AppError::from(err).into_response().status()
    }

    #[test]
    fn test_disabled_account_is_indistinguishable() {
        assert_eq!(status(ServiceError::AccountDisabled), StatusCode::UNAUTHORIZED);
        assert_eq!(status(ServiceError::InvalidCredentials), StatusCode::UNAUTHORIZED);
    }

    #[test]
    fn test_store_failure_is_unavailable() {
        assert_eq!(
            status(ServiceError::StoreUnavailable("connection refused".into())),
            StatusCode::SERVICE_UNAVAILABLE
        );
    }

    #[test]
    fn test_policy_block_is_forbidden() {
        assert_eq!(
            status(ServiceError::PolicyBlocked("Block contractors".into())),
            StatusCode::FORBIDDEN
        );
        assert_eq!(status(ServiceError::TooManyAttempts), StatusCode::TOO_MANY_REQUESTS);
    }
}
