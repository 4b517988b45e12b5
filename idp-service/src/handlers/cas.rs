use axum::{
    extract::{Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
};
use serde::Deserialize;
use utoipa::IntoParams;

use crate::{
    handlers::{found, Origin},
    middleware::OptionalSession,
    services::{CasError, ServiceError},
    AppState,
};

#[derive(Debug, Deserialize, IntoParams)]
pub struct CasLoginParams {
    pub service: Option<String>,
}

#[derive(Debug, Deserialize, IntoParams)]
pub struct CasValidateParams {
    pub ticket: Option<String>,
    pub service: Option<String>,
}

fn plain(status: StatusCode, body: String) -> Response {
    (status, [(header::CONTENT_TYPE, "text/plain; charset=utf-8")], body).into_response()
}

/// Issue a service ticket and redirect back to the service
#[utoipa::path(
    get,
    path = "/cas/login",
    params(CasLoginParams),
    responses(
        (status = 302, description = "Redirect to the service with `ticket`"),
        (status = 400, description = "Missing or unregistered service", content_type = "text/plain"),
        (status = 401, description = "No authenticated session", content_type = "text/plain"),
        (status = 403, description = "Blocked by conditional access policy", content_type = "text/plain")
    ),
    tag = "CAS"
)]
pub async fn login(
    State(state): State<AppState>,
    Origin(origin): Origin,
    OptionalSession(session): OptionalSession,
    Query(params): Query<CasLoginParams>,
) -> Response {
    let session = match session {
        Ok(Some(session)) => session,
        Ok(None) => return plain(StatusCode::UNAUTHORIZED, "Authentication required\n".to_string()),
        Err(e) => {
            tracing::error!(error = %e, "CAS session lookup failed");
            return plain(StatusCode::SERVICE_UNAVAILABLE, "INTERNAL_ERROR\n".to_string());
        }
    };

    match state
        .cas
        .login(params.service.as_deref(), &session.user, origin.ip, &origin.user_agent)
        .await
    {
        Ok(location) => found(&location),
        Err(CasError::Service(ServiceError::PolicyBlocked(reason))) => plain(
            StatusCode::FORBIDDEN,
            format!("Access blocked by policy: {}\n", reason),
        ),
        Err(CasError::Service(e)) => {
            tracing::error!(error = %e, "CAS login failed");
            plain(StatusCode::SERVICE_UNAVAILABLE, "INTERNAL_ERROR\n".to_string())
        }
        Err(e) => plain(StatusCode::BAD_REQUEST, format!("{}: {}\n", e.code(), e)),
    }
}

/// CAS 1.0 ticket validation
#[utoipa::path(
    get,
    path = "/cas/validate",
    params(CasValidateParams),
    responses(
        (status = 200, description = "`yes\\n<username>\\n` or `no\\n`", content_type = "text/plain")
    ),
    tag = "CAS"
)]
pub async fn validate(
    State(state): State<AppState>,
    Query(params): Query<CasValidateParams>,
) -> Response {
    let body = state
        .cas
        .validate(params.ticket.as_deref(), params.service.as_deref())
        .await;
    plain(StatusCode::OK, body)
}

/// CAS 2.0 ticket validation
#[utoipa::path(
    get,
    path = "/cas/serviceValidate",
    params(CasValidateParams),
    responses(
        (status = 200, description = "cas:serviceResponse envelope", content_type = "application/xml")
    ),
    tag = "CAS"
)]
pub async fn service_validate(
    State(state): State<AppState>,
    Query(params): Query<CasValidateParams>,
) -> Response {
    let xml = state
        .cas
        .service_validate(params.ticket.as_deref(), params.service.as_deref())
        .await;
    ([(header::CONTENT_TYPE, "application/xml; charset=utf-8")], xml).into_response()
}
