mod common;

use axum::http::StatusCode;
use common::{body_json, body_string, TestApp, PASSWORD};
use serde_json::json;

#[tokio::test]
async fn test_health_check() {
    let app = TestApp::spawn().await;

    let response = app.get("/health", None).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert!(response.headers().get("x-request-id").is_some());

    let body = body_json(response).await;
    assert_eq!(body["status"], "healthy");
    assert_eq!(body["checks"]["ephemeral_store"], "up");
}

#[tokio::test]
async fn test_health_check_reports_store_outage() {
    let app = TestApp::spawn().await;
    app.store.set_available(false);

    let response = app.get("/health", None).await;
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
}

#[tokio::test]
async fn test_login_fails_closed_when_store_is_down() {
    let app = TestApp::spawn().await;
    app.create_user("alice").await;
    app.store.set_available(false);

    let response = app
        .post_json("/auth/login", json!({ "username": "alice", "password": PASSWORD }), None)
        .await;
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
}

#[tokio::test]
async fn test_openid_configuration() {
    let app = TestApp::spawn().await;

    let response = app.get("/.well-known/openid-configuration", None).await;
    assert_eq!(response.status(), StatusCode::OK);

    let body = body_json(response).await;
    assert_eq!(body["issuer"], "https://idp.test");
    assert_eq!(body["token_endpoint"], "https://idp.test/oauth2/token");
    assert_eq!(body["jwks_uri"], "https://idp.test/.well-known/jwks.json");
    assert!(body["code_challenge_methods_supported"]
        .as_array()
        .unwrap()
        .contains(&json!("S256")));
}

#[tokio::test]
async fn test_jwks_publishes_signing_key() {
    let app = TestApp::spawn().await;

    let response = app.get("/.well-known/jwks.json", None).await;
    assert_eq!(response.status(), StatusCode::OK);

    let body = body_json(response).await;
    let key = &body["keys"][0];
    assert_eq!(key["kty"], "RSA");
    assert_eq!(key["alg"], "RS256");
    assert_eq!(key["kid"], "test-key");
    assert!(!key["n"].as_str().unwrap().is_empty());
}

#[tokio::test]
async fn test_metrics_count_logins_and_routes() {
    let app = TestApp::spawn().await;
    app.create_user("alice").await;
    app.login("alice", PASSWORD).await;

    let response = app.get("/metrics", None).await;
    assert_eq!(response.status(), StatusCode::OK);

    let text = body_string(response).await;
    assert!(text.contains("idp_login_outcomes_total"));
    assert!(text.contains(r#"path="/auth/login""#));
}

#[tokio::test]
async fn test_openapi_document_is_served() {
    let app = TestApp::spawn().await;

    let response = app.get("/.well-known/openapi.json", None).await;
    assert_eq!(response.status(), StatusCode::OK);

    let body = body_json(response).await;
    assert!(body["paths"].get("/oauth2/token").is_some());
    assert!(body["paths"].get("/cas/serviceValidate").is_some());
}

#[tokio::test]
async fn test_security_headers_are_set() {
    let app = TestApp::spawn().await;

    let response = app.get("/health", None).await;
    assert_eq!(
        response.headers().get("x-content-type-options").unwrap(),
        "nosniff"
    );
}
