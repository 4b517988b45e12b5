//! HTTP handlers for the identity provider.

pub mod auth;
pub mod cas;
pub mod metrics;
pub mod oauth2;
pub mod saml;
pub mod well_known;

use axum::{
    async_trait,
    extract::{ConnectInfo, FromRequestParts},
    http::{header, request::Parts, StatusCode},
    response::{IntoResponse, Response},
};
use service_core::middleware::rate_limit::client_ip;
use std::convert::Infallible;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};

use crate::services::oauth2::RequestOrigin;

/// Caller IP (forwarded header, then socket peer) and user agent.
pub struct Origin(pub RequestOrigin);

#[async_trait]
impl<S> FromRequestParts<S> for Origin
where
    S: Send + Sync,
{
    type Rejection = Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let connect = parts.extensions.get::<ConnectInfo<SocketAddr>>();
        let ip = client_ip(&parts.headers, connect).unwrap_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED));
        let user_agent = parts
            .headers
            .get(header::USER_AGENT)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string();
        Ok(Origin(RequestOrigin { ip, user_agent }))
    }
}

/// 302 Found. Protocol clients expect exactly this status.
pub(crate) fn found(location: &str) -> Response {
    (StatusCode::FOUND, [(header::LOCATION, location.to_string())]).into_response()
}
