use axum::{
    extract::{Query, State},
    http::{header, StatusCode},
    response::{Html, IntoResponse, Response},
    Form,
};
use serde::Deserialize;
use utoipa::IntoParams;

use crate::{
    handlers::{found, Origin},
    middleware::OptionalSession,
    services::saml::response::status_response,
    services::saml::{SamlBinding, SloRequest, SsoRequest},
    services::oauth2::RequestOrigin,
    services::{SamlDelivery, SamlError, ServiceError},
    AppState,
};

#[derive(Debug, Default, Deserialize, IntoParams)]
pub struct SamlMessageParams {
    #[serde(rename = "SAMLRequest")]
    pub saml_request: Option<String>,
    #[serde(rename = "RelayState")]
    pub relay_state: Option<String>,
    /// IdP-initiated SSO target application
    pub app_id: Option<String>,
}

#[derive(Debug, Deserialize, IntoParams)]
pub struct MetadataParams {
    pub app_id: String,
}

fn deliver(delivery: SamlDelivery) -> Response {
    match delivery {
        SamlDelivery::Post(html) => Html(html).into_response(),
        SamlDelivery::Redirect(location) => found(&location),
    }
}

/// Errors that cannot be delivered to a known ACS are answered directly
/// with a status-only `samlp:Response`.
fn error_response(state: &AppState, error: SamlError) -> Response {
    let status = match &error {
        SamlError::Requester(_) => StatusCode::BAD_REQUEST,
        SamlError::UnknownApplication(_) => StatusCode::NOT_FOUND,
        SamlError::AuthnFailed(_) => StatusCode::FORBIDDEN,
        SamlError::Responder(_) | SamlError::Configuration(_) => StatusCode::INTERNAL_SERVER_ERROR,
        SamlError::Service(ServiceError::StoreUnavailable(_)) => StatusCode::SERVICE_UNAVAILABLE,
        SamlError::Service(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };
    if status.is_server_error() {
        tracing::error!(error = %error, "SAML request failed");
    } else {
        tracing::warn!(error = %error, "SAML request rejected");
    }

    // Internal causes stay in the log.
    let message = if status.is_server_error() {
        "The identity provider could not process the request".to_string()
    } else {
        error.to_string()
    };
    let xml = status_response(
        &state.config.saml.entity_id,
        "",
        None,
        state.clock.now(),
        error.status_code(),
        &message,
    );
    (status, [(header::CONTENT_TYPE, "application/xml")], xml).into_response()
}

async fn sso(
    state: AppState,
    origin: RequestOrigin,
    session: OptionalSession,
    params: SamlMessageParams,
    binding: SamlBinding,
) -> Response {
    let request = SsoRequest {
        saml_request: params.saml_request,
        relay_state: params.relay_state,
        app_id: params.app_id,
        binding: Some(binding),
    };
    let session = match session.0 {
        Ok(session) => session,
        Err(e) => return error_response(&state, SamlError::Service(e)),
    };
    let user = session.as_ref().map(|s| &s.user);
    match state.saml.sso(request, user, origin.ip, &origin.user_agent).await {
        Ok(delivery) => deliver(delivery),
        Err(e) => error_response(&state, e),
    }
}

/// SAML SSO via HTTP-Redirect binding, or IdP-initiated with `app_id`
#[utoipa::path(
    get,
    path = "/saml/sso",
    params(SamlMessageParams),
    responses(
        (status = 200, description = "Auto-submitting form posting the response to the ACS", content_type = "text/html"),
        (status = 302, description = "Redirect to the ACS carrying the response"),
        (status = 400, description = "Malformed or unknown request", content_type = "application/xml"),
        (status = 500, description = "Signing material missing or invalid", content_type = "application/xml")
    ),
    tag = "SAML"
)]
pub async fn sso_redirect(
    State(state): State<AppState>,
    Origin(origin): Origin,
    session: OptionalSession,
    Query(params): Query<SamlMessageParams>,
) -> Response {
    sso(state, origin, session, params, SamlBinding::Redirect).await
}

/// SAML SSO via HTTP-POST binding
#[utoipa::path(
    post,
    path = "/saml/sso",
    request_body(content = String, content_type = "application/x-www-form-urlencoded", description = "SAMLRequest and RelayState"),
    responses(
        (status = 200, description = "Auto-submitting form posting the response to the ACS", content_type = "text/html"),
        (status = 302, description = "Redirect to the ACS carrying the response"),
        (status = 400, description = "Malformed or unknown request", content_type = "application/xml")
    ),
    tag = "SAML"
)]
pub async fn sso_post(
    State(state): State<AppState>,
    Origin(origin): Origin,
    session: OptionalSession,
    Form(params): Form<SamlMessageParams>,
) -> Response {
    sso(state, origin, session, params, SamlBinding::Post).await
}

/// IdP metadata for an application's service provider
#[utoipa::path(
    get,
    path = "/saml/metadata",
    params(MetadataParams),
    responses(
        (status = 200, description = "EntityDescriptor", content_type = "application/samlmetadata+xml"),
        (status = 404, description = "No SAML configuration for the application", content_type = "application/xml")
    ),
    tag = "SAML"
)]
pub async fn metadata(
    State(state): State<AppState>,
    Query(params): Query<MetadataParams>,
) -> Response {
    match state.saml.metadata(&params.app_id).await {
        Ok(xml) => ([(header::CONTENT_TYPE, "application/samlmetadata+xml")], xml).into_response(),
        Err(e) => error_response(&state, e),
    }
}

async fn slo(state: AppState, params: SamlMessageParams, binding: SamlBinding) -> Response {
    let Some(saml_request) = params.saml_request else {
        return error_response(&state, SamlError::Requester("SAMLRequest is required".to_string()));
    };
    let request = SloRequest {
        saml_request,
        relay_state: params.relay_state,
        binding,
    };
    match state.saml.slo(request).await {
        Ok(delivery) => deliver(delivery),
        Err(e) => error_response(&state, e),
    }
}

/// SAML single logout via HTTP-Redirect binding
#[utoipa::path(
    get,
    path = "/saml/slo",
    params(SamlMessageParams),
    responses(
        (status = 200, description = "LogoutResponse form", content_type = "text/html"),
        (status = 302, description = "Redirect to the SP's SLO endpoint"),
        (status = 400, description = "Malformed or unknown request", content_type = "application/xml")
    ),
    tag = "SAML"
)]
pub async fn slo_redirect(
    State(state): State<AppState>,
    Query(params): Query<SamlMessageParams>,
) -> Response {
    slo(state, params, SamlBinding::Redirect).await
}

/// SAML single logout via HTTP-POST binding
#[utoipa::path(
    post,
    path = "/saml/slo",
    request_body(content = String, content_type = "application/x-www-form-urlencoded", description = "SAMLRequest and RelayState"),
    responses(
        (status = 200, description = "LogoutResponse form", content_type = "text/html"),
        (status = 400, description = "Malformed or unknown request", content_type = "application/xml")
    ),
    tag = "SAML"
)]
pub async fn slo_post(
    State(state): State<AppState>,
    Form(params): Form<SamlMessageParams>,
) -> Response {
    slo(state, params, SamlBinding::Post).await
}
