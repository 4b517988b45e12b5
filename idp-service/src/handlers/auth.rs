use axum::{extract::State, http::StatusCode, response::IntoResponse, Json};
use axum_extra::extract::cookie::{Cookie, CookieJar, SameSite};
use service_core::error::AppError;

use crate::{
    dtos::{
        auth::{
            ForgotPasswordRequest, LoginRequest, LoginResponse, LogoutRequest, MessageResponse,
            MfaSendRequest, RefreshRequest, RefreshResponse, ResetPasswordRequest,
        },
        ErrorResponse,
    },
    handlers::Origin,
    middleware::{AuthUser, SESSION_COOKIE},
    services::LoginRequestContext,
    utils::ValidatedJson,
    AppState,
};

fn session_cookie(state: &AppState, token: String, max_age_seconds: i64) -> Cookie<'static> {
    Cookie::build((SESSION_COOKIE, token))
        .path("/")
        .http_only(true)
        .secure(state.config.security.secure_cookies)
        .same_site(SameSite::Lax)
        .max_age(time::Duration::seconds(max_age_seconds))
        .build()
}

/// Login with username (or email) and password
#[utoipa::path(
    post,
    path = "/auth/login",
    request_body = LoginRequest,
    responses(
        (status = 200, description = "Login successful", body = LoginResponse),
        (status = 401, description = "Invalid credentials, or MFA code required/invalid", body = ErrorResponse),
        (status = 403, description = "Blocked by conditional access policy", body = ErrorResponse),
        (status = 422, description = "Validation error", body = ErrorResponse),
        (status = 429, description = "Too many failed attempts", body = ErrorResponse),
        (status = 503, description = "Ephemeral store unavailable", body = ErrorResponse)
    ),
    tag = "Authentication"
)]
pub async fn login(
    State(state): State<AppState>,
    Origin(origin): Origin,
    jar: CookieJar,
    ValidatedJson(req): ValidatedJson<LoginRequest>,
) -> Result<impl IntoResponse, AppError> {
    let outcome = state
        .login
        .login(LoginRequestContext {
            username: req.username,
            password: req.password,
            mfa_code: req.mfa_code,
            device_id: req.device_id,
            ip: origin.ip,
            user_agent: origin.user_agent,
        })
        .await?;

    let tokens = outcome.tokens;
    let jar = jar.add(session_cookie(&state, tokens.access_token.clone(), tokens.expires_in));
    Ok((
        jar,
        Json(LoginResponse {
            access_token: tokens.access_token,
            refresh_token: tokens.refresh_token,
            token_type: tokens.token_type,
            expires_in: tokens.expires_in,
            user: outcome.user.summary(),
        }),
    ))
}

/// Send an SMS or email one-time code for the next login
#[utoipa::path(
    post,
    path = "/auth/mfa/send",
    request_body = MfaSendRequest,
    responses(
        (status = 202, description = "Code queued for delivery", body = MessageResponse),
        (status = 400, description = "No SMS or email MFA device enrolled", body = ErrorResponse),
        (status = 401, description = "Invalid credentials", body = ErrorResponse),
        (status = 429, description = "Too many failed attempts", body = ErrorResponse)
    ),
    tag = "Authentication"
)]
pub async fn send_mfa_code(
    State(state): State<AppState>,
    Origin(origin): Origin,
    ValidatedJson(req): ValidatedJson<MfaSendRequest>,
) -> Result<impl IntoResponse, AppError> {
    state
        .login
        .send_mfa_code(LoginRequestContext {
            username: req.username,
            password: req.password,
            mfa_code: None,
            device_id: None,
            ip: origin.ip,
            user_agent: origin.user_agent,
        })
        .await?;
    Ok((StatusCode::ACCEPTED, Json(MessageResponse::new("Verification code sent"))))
}

/// Exchange a refresh token for a new access token
#[utoipa::path(
    post,
    path = "/auth/refresh",
    request_body = RefreshRequest,
    responses(
        (status = 200, description = "Token refreshed", body = RefreshResponse),
        (status = 400, description = "Invalid or expired refresh token", body = ErrorResponse)
    ),
    tag = "Authentication"
)]
pub async fn refresh(
    State(state): State<AppState>,
    ValidatedJson(req): ValidatedJson<RefreshRequest>,
) -> Result<impl IntoResponse, AppError> {
    let refreshed = state.login.refresh(&req.refresh_token).await?;
    Ok(Json(RefreshResponse {
        access_token: refreshed.access_token,
        token_type: refreshed.token_type,
        expires_in: refreshed.expires_in,
    }))
}

/// End every session of the caller
#[utoipa::path(
    post,
    path = "/auth/logout",
    request_body = LogoutRequest,
    responses(
        (status = 200, description = "Logged out", body = MessageResponse),
        (status = 401, description = "Invalid or expired session", body = ErrorResponse)
    ),
    tag = "Authentication",
    security(
        ("bearer_auth" = [])
    )
)]
pub async fn logout(
    State(state): State<AppState>,
    AuthUser(session): AuthUser,
    jar: CookieJar,
    body: Option<Json<LogoutRequest>>,
) -> Result<impl IntoResponse, AppError> {
    let refresh_token = body.and_then(|Json(b)| b.refresh_token);
    state
        .login
        .logout(session.user.user_id, refresh_token.as_deref())
        .await?;
    let jar = jar.remove(Cookie::build(SESSION_COOKIE).path("/").build());
    Ok((jar, Json(MessageResponse::new("Logged out successfully"))))
}

/// Request a password reset link
#[utoipa::path(
    post,
    path = "/auth/forgot-password",
    request_body = ForgotPasswordRequest,
    responses(
        (status = 200, description = "Request received", body = MessageResponse),
        (status = 422, description = "Validation error", body = ErrorResponse)
    ),
    tag = "Authentication"
)]
pub async fn forgot_password(
    State(state): State<AppState>,
    ValidatedJson(req): ValidatedJson<ForgotPasswordRequest>,
) -> Result<impl IntoResponse, AppError> {
    state.login.forgot_password(&req.email).await?;
    Ok(Json(MessageResponse::new(
        "If your email is registered, you will receive a password reset link shortly.",
    )))
}

/// Set a new password with a reset token
#[utoipa::path(
    post,
    path = "/auth/reset-password",
    request_body = ResetPasswordRequest,
    responses(
        (status = 200, description = "Password reset", body = MessageResponse),
        (status = 400, description = "Invalid or expired token", body = ErrorResponse),
        (status = 422, description = "Validation error", body = ErrorResponse)
    ),
    tag = "Authentication"
)]
pub async fn reset_password(
    State(state): State<AppState>,
    ValidatedJson(req): ValidatedJson<ResetPasswordRequest>,
) -> Result<impl IntoResponse, AppError> {
    state.login.reset_password(&req.token, &req.new_password).await?;
    Ok(Json(MessageResponse::new("Password has been reset")))
}
