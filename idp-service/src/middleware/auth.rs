use axum::{
    async_trait,
    extract::{FromRequestParts, Request, State},
    http::{header, request::Parts, HeaderMap},
    middleware::Next,
    response::Response,
};
use axum_extra::extract::cookie::CookieJar;
use service_core::error::AppError;
use std::convert::Infallible;

use crate::{
    models::User,
    services::{AccessTokenClaims, ServiceError},
    AppState,
};

/// HttpOnly cookie set by `/auth/login`, holding the access token.
pub const SESSION_COOKIE: &str = "idp_session";

/// A first-party access token whose Session row is still live.
#[derive(Debug, Clone)]
pub struct SessionUser {
    pub user: User,
    pub claims: AccessTokenClaims,
}

/// Bearer header first, then the session cookie.
pub fn presented_token(headers: &HeaderMap) -> Option<String> {
    let bearer = headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .map(|t| t.trim().to_string())
        .filter(|t| !t.is_empty());
    bearer.or_else(|| {
        CookieJar::from_headers(headers)
            .get(SESSION_COOKIE)
            .map(|c| c.value().to_string())
            .filter(|t| !t.is_empty())
    })
}

/// Resolve a token to its session. Tokens issued to OAuth2 clients, tokens
/// without a session id, and tokens whose session was removed or has expired
/// resolve to `None`.
pub async fn resolve_session(
    state: &AppState,
    token: &str,
) -> Result<Option<SessionUser>, ServiceError> {
    let Ok(claims) = state.tokens.validate_access_token(token) else {
        return Ok(None);
    };
    if claims.client_id.is_some() {
        return Ok(None);
    }
    let (Some(user_id), Some(session_id)) = (claims.user_id(), claims.session_id()) else {
        return Ok(None);
    };

    let session = match state.repo.find_session(session_id).await? {
        Some(s) if s.user_id == user_id && !s.is_expired(state.clock.now()) => s,
        _ => return Ok(None),
    };
    let user = state
        .repo
        .find_user_by_id(session.user_id)
        .await?
        .filter(|u| u.is_active());
    Ok(user.map(|user| SessionUser { user, claims }))
}

/// Middleware to require an authenticated session
pub async fn auth_middleware(
    State(state): State<AppState>,
    mut req: Request,
    next: Next,
) -> Result<Response, AppError> {
    let token = presented_token(req.headers()).ok_or_else(|| {
        AppError::Unauthorized(anyhow::anyhow!("Missing or invalid Authorization header"))
    })?;

    let session = resolve_session(&state, &token)
        .await?
        .ok_or_else(|| AppError::Unauthorized(anyhow::anyhow!("Invalid or expired session")))?;

    req.extensions_mut().insert(session);
    Ok(next.run(req).await)
}

/// Extractor for routes behind `auth_middleware`
pub struct AuthUser(pub SessionUser);

#[async_trait]
impl<S> FromRequestParts<S> for AuthUser
where
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let session = parts.extensions.get::<SessionUser>().ok_or_else(|| {
            AppError::InternalError(anyhow::anyhow!("Session missing from request extensions"))
        })?;
        Ok(AuthUser(session.clone()))
    }
}

/// Session if one is presented and live, for federation endpoints that
/// answer unauthenticated callers in their own protocol. Lookup failures are
/// handed to the handler so they are reported in that protocol too.
pub struct OptionalSession(pub Result<Option<SessionUser>, ServiceError>);

#[async_trait]
impl FromRequestParts<AppState> for OptionalSession {
    type Rejection = Infallible;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let session = match presented_token(&parts.headers) {
            Some(token) => resolve_session(state, &token).await,
            None => Ok(None),
        };
        Ok(OptionalSession(session))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn test_bearer_wins_over_cookie() {
        let mut headers = HeaderMap::new();
        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Bearer abc"));
        headers.insert(header::COOKIE, HeaderValue::from_static("idp_session=def"));
        assert_eq!(presented_token(&headers).as_deref(), Some("abc"));
    }

    #[test]
    fn test_cookie_fallback() {
        let mut headers = HeaderMap::new();
        headers.insert(header::COOKIE, HeaderValue::from_static("theme=dark; idp_session=def"));
        assert_eq!(presented_token(&headers).as_deref(), Some("def"));
        assert_eq!(presented_token(&HeaderMap::new()), None);
    }
}
