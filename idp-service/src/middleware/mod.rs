pub mod auth;
pub mod metrics;

pub use auth::{auth_middleware, AuthUser, OptionalSession, SessionUser, SESSION_COOKIE};
pub use metrics::metrics_middleware;
