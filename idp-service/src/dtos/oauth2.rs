use axum::{
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use utoipa::ToSchema;

use crate::services::oauth2::{OAuthError, OAuthErrorCode};

/// RFC 6749 §5.2 error body.
#[derive(Debug, Serialize, ToSchema)]
pub struct OAuthErrorResponse {
    #[schema(example = "invalid_grant")]
    pub error: String,
    #[schema(example = "Invalid, expired or already used grant")]
    pub error_description: String,
}

impl OAuthErrorCode {
    pub fn status(&self) -> StatusCode {
        match self {
            OAuthErrorCode::InvalidClient
            | OAuthErrorCode::InvalidToken
            | OAuthErrorCode::LoginRequired => StatusCode::UNAUTHORIZED,
            OAuthErrorCode::AccessDenied => StatusCode::FORBIDDEN,
            OAuthErrorCode::ServerError => StatusCode::INTERNAL_SERVER_ERROR,
            OAuthErrorCode::TemporarilyUnavailable => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::BAD_REQUEST,
        }
    }
}

impl IntoResponse for OAuthError {
    fn into_response(self) -> Response {
        let status = self.code.status();
        let body = Json(OAuthErrorResponse {
            error: self.code.as_str().to_string(),
            error_description: self.description,
        });
        let mut response = (status, [(header::CACHE_CONTROL, "no-store")], body).into_response();
        if status == StatusCode::UNAUTHORIZED {
            let challenge = match self.code {
                OAuthErrorCode::InvalidToken => r#"Bearer error="invalid_token""#,
                OAuthErrorCode::LoginRequired => "Bearer",
                _ => r#"Basic realm="oauth2""#,
            };
            response
                .headers_mut()
                .insert(header::WWW_AUTHENTICATE, header::HeaderValue::from_static(challenge));
        }
        response
    }
}
