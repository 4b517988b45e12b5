use axum::{
    extract::{rejection::JsonRejection, FromRequest, Request},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::de::DeserializeOwned;
use validator::{Validate, ValidationErrors};

use crate::dtos::ErrorResponse;

/// JSON body that has passed its `validator` rules.
///
/// Malformed JSON is a 400. A well-formed body that breaks a rule is a 422
/// naming the offending fields, so clients never learn more than the field
/// name and the rule message.
pub struct ValidatedJson<T>(pub T);

#[axum::async_trait]
impl<T, S> FromRequest<S> for ValidatedJson<T>
where
    T: DeserializeOwned + Validate + 'static,
    S: Send + Sync,
{
    type Rejection = Response;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        let Json(value) = Json::<T>::from_request(req, state)
            .await
            .map_err(reject_body)?;

        value.validate().map_err(|errors| {
            reject(StatusCode::UNPROCESSABLE_ENTITY, describe(&errors))
        })?;

        Ok(ValidatedJson(value))
    }
}

fn reject_body(rejection: JsonRejection) -> Response {
    // Missing content type stays 415; everything else about the body is a 400
    let status = match rejection {
        JsonRejection::MissingJsonContentType(_) => StatusCode::UNSUPPORTED_MEDIA_TYPE,
        _ => StatusCode::BAD_REQUEST,
    };
    reject(status, format!("Invalid request body: {}", rejection.body_text()))
}

fn reject(status: StatusCode, error: String) -> Response {
    (status, Json(ErrorResponse { error })).into_response()
}

/// "field: message" pairs in field order.
fn describe(errors: &ValidationErrors) -> String {
    let mut fields: Vec<String> = errors
        .field_errors()
        .into_iter()
        .map(|(field, failures)| {
            let message = failures
                .iter()
                .find_map(|f| f.message.as_ref().map(|m| m.to_string()))
                .unwrap_or_else(|| "is invalid".to_string());
            format!("{}: {}", field, message)
        })
        .collect();
    fields.sort();
    format!("Validation failed: {}", fields.join("; "))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Deserialize, Validate)]
    struct Reset {
        #[validate(length(min = 12, message = "must be at least 12 characters"))]
        new_password: String,
        #[validate(length(min = 1))]
        token: String,
    }

    #[test]
    fn test_describe_names_each_field() {
        let reset = Reset {
            new_password: "short".into(),
            token: String::new(),
        };
        let message = describe(&reset.validate().unwrap_err());
        assert_eq!(
            message,
            "Validation failed: new_password: must be at least 12 characters; token: is invalid"
        );
    }
}
