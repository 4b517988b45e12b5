use axum::{
    extract::{rejection::FormRejection, rejection::QueryRejection, Query, State},
    http::{header, HeaderMap},
    response::{IntoResponse, Response},
    Form, Json,
};
use base64::{engine::general_purpose::STANDARD, Engine};

use crate::{
    dtos::oauth2::OAuthErrorResponse,
    handlers::{found, Origin},
    middleware::OptionalSession,
    services::oauth2::{
        AuthorizeRequest, ClientCredentials, OAuthError, OAuthErrorCode, TokenRequest,
    },
    AppState,
};

/// Client credentials from an HTTP Basic header. Both halves are
/// form-urlencoded per RFC 6749 §2.3.1.
fn basic_credentials(headers: &HeaderMap) -> Result<Option<ClientCredentials>, OAuthError> {
    let Some(value) = headers.get(header::AUTHORIZATION).and_then(|v| v.to_str().ok()) else {
        return Ok(None);
    };
    let Some(encoded) = value.strip_prefix("Basic ") else {
        return Ok(None);
    };

    let malformed = || OAuthError::invalid_client("Malformed Basic credentials");
    let decoded = STANDARD.decode(encoded.trim()).map_err(|_| malformed())?;
    let decoded = String::from_utf8(decoded).map_err(|_| malformed())?;
    let (id, secret) = decoded.split_once(':').ok_or_else(malformed)?;
    let client_id = urlencoding::decode(id).map_err(|_| malformed())?.into_owned();
    let client_secret = urlencoding::decode(secret).map_err(|_| malformed())?.into_owned();
    Ok(Some(ClientCredentials {
        client_id,
        client_secret,
    }))
}

fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|t| !t.is_empty())
}

/// OAuth2 authorization endpoint (authorization code flow)
#[utoipa::path(
    get,
    path = "/oauth2/authorize",
    params(
        ("response_type" = String, Query, description = "Must be `code`"),
        ("client_id" = String, Query,),
        ("redirect_uri" = String, Query, description = "Exact match against the registered value"),
        ("scope" = Option<String>, Query,),
        ("state" = Option<String>, Query,),
        ("nonce" = Option<String>, Query,),
        ("code_challenge" = Option<String>, Query,),
        ("code_challenge_method" = Option<String>, Query, description = "`S256` or `plain`")
    ),
    responses(
        (status = 302, description = "Redirect to the client with `code` and `state`"),
        (status = 400, description = "OAuth2 error", body = OAuthErrorResponse),
        (status = 401, description = "No session or unknown client", body = OAuthErrorResponse),
        (status = 403, description = "Blocked by conditional access policy", body = OAuthErrorResponse)
    ),
    tag = "OAuth2"
)]
pub async fn authorize(
    State(state): State<AppState>,
    Origin(origin): Origin,
    OptionalSession(session): OptionalSession,
    query: Result<Query<AuthorizeRequest>, QueryRejection>,
) -> Result<Response, OAuthError> {
    let Query(request) = query.map_err(|e| OAuthError::invalid_request(e.body_text()))?;
    let session = session?
        .ok_or_else(|| OAuthError::new(OAuthErrorCode::LoginRequired, "Authentication required"))?;

    let location = state.oauth2.authorize(&request, &session.user, &origin).await?;
    Ok(found(&location))
}

/// OAuth2 token endpoint
#[utoipa::path(
    post,
    path = "/oauth2/token",
    request_body(content = String, content_type = "application/x-www-form-urlencoded", description = "grant_type and grant parameters"),
    responses(
        (status = 200, description = "Token response"),
        (status = 400, description = "OAuth2 error", body = OAuthErrorResponse),
        (status = 401, description = "Client authentication failed", body = OAuthErrorResponse)
    ),
    tag = "OAuth2"
)]
pub async fn token(
    State(state): State<AppState>,
    Origin(origin): Origin,
    headers: HeaderMap,
    form: Result<Form<TokenRequest>, FormRejection>,
) -> Result<Response, OAuthError> {
    let Form(request) = form.map_err(|e| OAuthError::invalid_request(e.body_text()))?;
    let basic = basic_credentials(&headers)?;

    let tokens = state.oauth2.token(request, basic, &origin).await?;
    Ok((
        [(header::CACHE_CONTROL, "no-store"), (header::PRAGMA, "no-cache")],
        Json(tokens),
    )
        .into_response())
}

/// OIDC userinfo endpoint
#[utoipa::path(
    get,
    path = "/oauth2/userinfo",
    responses(
        (status = 200, description = "Claims permitted by the token's scope"),
        (status = 401, description = "Missing, unknown or expired token", body = OAuthErrorResponse)
    ),
    tag = "OAuth2",
    security(
        ("bearer_auth" = [])
    )
)]
pub async fn userinfo(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Response, OAuthError> {
    let token = bearer_token(&headers)
        .ok_or_else(|| OAuthError::new(OAuthErrorCode::InvalidToken, "Bearer token required"))?;
    let info = state.oauth2.userinfo(token).await?;
    Ok(Json(info).into_response())
}
