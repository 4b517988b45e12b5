pub mod config;
pub mod db;
pub mod dtos;
pub mod handlers;
pub mod middleware;
pub mod models;
pub mod services;
pub mod utils;

use axum::{
    extract::State,
    http::{header, HeaderValue, Method},
    middleware::{from_fn, from_fn_with_state},
    routing::{get, post},
    Json, Router,
};
use service_core::error::AppError;
use service_core::middleware::{
    rate_limit::{create_ip_rate_limiter, ip_rate_limit_middleware, IpRateLimiter},
    security_headers::security_headers_middleware,
    tracing::request_id_middleware,
};
use std::sync::Arc;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use utoipa::{openapi::security::SecurityScheme, Modify, OpenApi};
use utoipa_swagger_ui::SwaggerUi;

use crate::config::{Environment, IdpConfig};
use crate::services::login::LoginSettings;
use crate::services::{
    CasServer, Clock, ConditionalAccessEvaluator, EphemeralStore, EventSink, IdentityRepository,
    IssuanceService, LoginService, Metrics, NotificationQueue, Notifier, OAuth2Service, RiskEngine,
    SamlEndpoints, SamlService, ServiceError, TokenService,
};

#[derive(OpenApi)]
#[openapi(
    paths(
        health_check,
        handlers::metrics::metrics,
        handlers::well_known::openid_configuration,
        handlers::well_known::jwks,
        handlers::auth::login,
        handlers::auth::send_mfa_code,
        handlers::auth::refresh,
        handlers::auth::logout,
        handlers::auth::forgot_password,
        handlers::auth::reset_password,
        handlers::oauth2::authorize,
        handlers::oauth2::token,
        handlers::oauth2::userinfo,
        handlers::saml::sso_redirect,
        handlers::saml::sso_post,
        handlers::saml::metadata,
        handlers::saml::slo_redirect,
        handlers::saml::slo_post,
        handlers::cas::login,
        handlers::cas::validate,
        handlers::cas::service_validate,
    ),
    components(
        schemas(
            dtos::ErrorResponse,
            dtos::auth::LoginRequest,
            dtos::auth::LoginResponse,
            dtos::auth::MfaSendRequest,
            dtos::auth::RefreshRequest,
            dtos::auth::RefreshResponse,
            dtos::auth::LogoutRequest,
            dtos::auth::ForgotPasswordRequest,
            dtos::auth::ResetPasswordRequest,
            dtos::auth::MessageResponse,
            dtos::oauth2::OAuthErrorResponse,
            handlers::well_known::OpenIdConfiguration,
            models::UserSummary,
        )
    ),
    modifiers(&SecurityAddon),
    tags(
        (name = "Authentication", description = "First-party login, MFA, refresh, logout and password reset"),
        (name = "OAuth2", description = "OAuth2 / OpenID Connect authorization server"),
        (name = "SAML", description = "SAML 2.0 identity provider"),
        (name = "CAS", description = "CAS 1.0 / 2.0 server"),
        (name = "Well-Known", description = "Public service metadata"),
        (name = "Observability", description = "Service health and monitoring"),
    )
)]
pub struct ApiDoc;

struct SecurityAddon;

impl Modify for SecurityAddon {
    fn modify(&self, openapi: &mut utoipa::openapi::OpenApi) {
        if let Some(components) = openapi.components.as_mut() {
            components.add_security_scheme(
                "bearer_auth",
                SecurityScheme::Http(
                    utoipa::openapi::security::HttpBuilder::new()
                        .scheme(utoipa::openapi::security::HttpAuthScheme::Bearer)
                        .bearer_format("JWT")
                        .build(),
                ),
            );
        }
    }
}

/// Storage, time and outbound delivery the services run on.
pub struct Backends {
    pub repo: Arc<dyn IdentityRepository>,
    pub store: Arc<dyn EphemeralStore>,
    pub clock: Arc<dyn Clock>,
    pub email: Arc<dyn Notifier>,
    pub sms: Arc<dyn Notifier>,
    pub events: Arc<dyn EventSink>,
    pub metrics: Metrics,
}

#[derive(Clone)]
pub struct AppState {
    pub config: IdpConfig,
    pub repo: Arc<dyn IdentityRepository>,
    pub store: Arc<dyn EphemeralStore>,
    pub clock: Arc<dyn Clock>,
    pub metrics: Metrics,
    pub tokens: TokenService,
    pub login: LoginService,
    pub oauth2: OAuth2Service,
    pub saml: SamlService,
    pub cas: CasServer,
    pub login_rate_limiter: IpRateLimiter,
    pub token_rate_limiter: IpRateLimiter,
    pub ip_rate_limiter: IpRateLimiter,
}

impl AppState {
    /// Wire every service. Spawns the notification workers, so it must run
    /// inside a Tokio runtime.
    pub fn new(config: IdpConfig, tokens: TokenService, backends: Backends) -> Self {
        let Backends {
            repo,
            store,
            clock,
            email,
            sms,
            events,
            metrics,
        } = backends;
        let failure_window =
            chrono::Duration::seconds(config.risk.failed_attempt_window_seconds as i64);

        let access = ConditionalAccessEvaluator::new(repo.clone());
        let risk = RiskEngine::new(
            repo.clone(),
            store.clone(),
            clock.clone(),
            config.risk.mfa_threshold,
            failure_window,
        );
        let issuance = IssuanceService::new(
            repo.clone(),
            store.clone(),
            tokens.clone(),
            clock.clone(),
            metrics.clone(),
        );
        let notifications = Arc::new(NotificationQueue::new(
            &config.delivery,
            email,
            sms,
            metrics.clone(),
        ));

        let login = LoginService::new(
            repo.clone(),
            store.clone(),
            clock.clone(),
            risk,
            access.clone(),
            issuance.clone(),
            notifications,
            events.clone(),
            metrics.clone(),
            LoginSettings {
                on_risk_mfa_unavailable: config.risk.on_risk_mfa_unavailable,
                lockout_threshold: config.risk.lockout_threshold,
                failure_window,
                public_url: config.public_url.clone(),
            },
        );
        let oauth2 = OAuth2Service::new(
            repo.clone(),
            store.clone(),
            clock.clone(),
            access.clone(),
            issuance,
            login.clone(),
            events.clone(),
            metrics.clone(),
        );
        let base = config.public_url.trim_end_matches('/');
        let saml = SamlService::new(
            repo.clone(),
            store.clone(),
            clock.clone(),
            access.clone(),
            events.clone(),
            metrics.clone(),
            SamlEndpoints {
                entity_id: config.saml.entity_id.clone(),
                sso_url: format!("{}/saml/sso", base),
                slo_url: format!("{}/saml/slo", base),
            },
        );
        let cas = CasServer::new(
            repo.clone(),
            store.clone(),
            clock.clone(),
            access,
            events,
            metrics.clone(),
        );

        let limits = &config.rate_limit;
        Self {
            login_rate_limiter: create_ip_rate_limiter(
                limits.login_attempts,
                limits.login_window_seconds,
            ),
            token_rate_limiter: create_ip_rate_limiter(
                limits.token_attempts,
                limits.token_window_seconds,
            ),
            ip_rate_limiter: create_ip_rate_limiter(
                limits.global_ip_limit,
                limits.global_ip_window_seconds,
            ),
            config,
            repo,
            store,
            clock,
            metrics,
            tokens,
            login,
            oauth2,
            saml,
            cas,
        }
    }
}

pub fn build_router(state: AppState) -> Router {
    // Credential-guessing surfaces
    let login_routes = Router::new()
        .route("/auth/login", post(handlers::auth::login))
        .route("/auth/mfa/send", post(handlers::auth::send_mfa_code))
        .route("/auth/forgot-password", post(handlers::auth::forgot_password))
        .layer(from_fn_with_state(
            state.login_rate_limiter.clone(),
            ip_rate_limit_middleware,
        ));

    let token_routes = Router::new()
        .route("/oauth2/token", post(handlers::oauth2::token))
        .layer(from_fn_with_state(
            state.token_rate_limiter.clone(),
            ip_rate_limit_middleware,
        ));

    let session_routes = Router::new()
        .route("/auth/logout", post(handlers::auth::logout))
        .layer(from_fn_with_state(state.clone(), middleware::auth_middleware));

    let mut app = Router::new()
        .route("/health", get(health_check))
        .route("/metrics", get(handlers::metrics::metrics))
        .route(
            "/.well-known/openid-configuration",
            get(handlers::well_known::openid_configuration),
        )
        .route("/.well-known/jwks.json", get(handlers::well_known::jwks));

    if state.config.environment == Environment::Dev {
        app = app.merge(
            SwaggerUi::new("/docs").url("/.well-known/openapi.json", ApiDoc::openapi()),
        );
    } else {
        app = app.route(
            "/.well-known/openapi.json",
            get(|| async { Json(ApiDoc::openapi()) }),
        );
    }

    let allowed_origins: Vec<HeaderValue> = state
        .config
        .security
        .allowed_origins
        .iter()
        .filter_map(|o| match o.parse::<HeaderValue>() {
            Ok(v) => Some(v),
            Err(e) => {
                tracing::error!(origin = %o, error = %e, "Ignoring invalid CORS origin");
                None
            }
        })
        .collect();

    app.route("/auth/refresh", post(handlers::auth::refresh))
        .route("/auth/reset-password", post(handlers::auth::reset_password))
        .route("/oauth2/authorize", get(handlers::oauth2::authorize))
        .route("/oauth2/userinfo", get(handlers::oauth2::userinfo))
        .route(
            "/saml/sso",
            get(handlers::saml::sso_redirect).post(handlers::saml::sso_post),
        )
        .route("/saml/metadata", get(handlers::saml::metadata))
        .route(
            "/saml/slo",
            get(handlers::saml::slo_redirect).post(handlers::saml::slo_post),
        )
        .route("/cas/login", get(handlers::cas::login))
        .route("/cas/validate", get(handlers::cas::validate))
        .route("/cas/serviceValidate", get(handlers::cas::service_validate))
        .merge(login_routes)
        .merge(token_routes)
        .merge(session_routes)
        .with_state(state.clone())
        // Global IP rate limiting
        .layer(from_fn_with_state(
            state.ip_rate_limiter.clone(),
            ip_rate_limit_middleware,
        ))
        .layer(from_fn_with_state(
            state.metrics.clone(),
            middleware::metrics_middleware,
        ))
        .layer(TraceLayer::new_for_http().make_span_with(
            |request: &axum::http::Request<_>| {
                let request_id = request
                    .headers()
                    .get("x-request-id")
                    .and_then(|value| value.to_str().ok())
                    .unwrap_or("-");

                tracing::info_span!(
                    "http_request",
                    request_id = %request_id,
                    method = %request.method(),
                    uri = %request.uri().path(),
                    version = ?request.version(),
                )
            },
        ))
        .layer(from_fn(request_id_middleware))
        .layer(from_fn(security_headers_middleware))
        .layer(
            CorsLayer::new()
                .allow_origin(allowed_origins)
                .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
                .allow_headers([header::AUTHORIZATION, header::CONTENT_TYPE])
                .allow_credentials(true),
        )
}

/// Service health check
#[utoipa::path(
    get,
    path = "/health",
    responses(
        (status = 200, description = "Service is healthy"),
        (status = 503, description = "Service is unhealthy")
    ),
    tag = "Observability"
)]
pub async fn health_check(
    State(state): State<AppState>,
) -> Result<Json<serde_json::Value>, AppError> {
    state.repo.health_check().await.map_err(|e| {
        tracing::error!(error = %e, "Repository health check failed");
        AppError::ServiceUnavailable
    })?;

    state.store.health_check().await.map_err(|e| {
        tracing::error!(error = %e, "Ephemeral store health check failed");
        AppError::from(ServiceError::from(e))
    })?;

    Ok(Json(serde_json::json!({
        "status": "healthy",
        "service": state.config.service_name,
        "version": state.config.service_version,
        "environment": format!("{:?}", state.config.environment),
        "checks": {
            "repository": "up",
            "ephemeral_store": "up"
        }
    })))
}
