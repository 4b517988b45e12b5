mod common;

use axum::http::StatusCode;
use common::{body_json, query_param, TestApp, PASSWORD};
use serde_json::json;
use std::time::Duration;

/// Request a reset for `email` and return the token from the delivered link.
async fn reset_token(app: &TestApp, email: &str) -> String {
    let response = app
        .post_json("/auth/forgot-password", json!({ "email": email }), None)
        .await;
    assert_eq!(response.status(), StatusCode::OK);

    let sent = app.notifier.wait_for(1, Duration::from_secs(2)).await;
    assert_eq!(sent.len(), 1, "reset link was not delivered");
    assert_eq!(sent[0].recipient, email);

    let link = sent[0]
        .body
        .split_whitespace()
        .find(|word| word.contains("/auth/reset-password?token="))
        .expect("reset link in body");
    query_param(link, "token").expect("token parameter")
}

#[tokio::test]
async fn test_reset_then_login_with_new_password() {
    let app = TestApp::spawn().await;
    app.create_user("alice").await;
    let token = reset_token(&app, "alice@example.com").await;

    let response = app
        .post_json(
            "/auth/reset-password",
            json!({ "token": token, "new_password": "a brand new secret" }),
            None,
        )
        .await;
    assert_eq!(response.status(), StatusCode::OK);

    app.login("alice", "a brand new secret").await;
    let old = app
        .post_json("/auth/login", json!({ "username": "alice", "password": PASSWORD }), None)
        .await;
    assert_eq!(old.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(app.events.of_type("user.password_reset").len(), 1);
}

#[tokio::test]
async fn test_reset_token_is_single_use() {
    let app = TestApp::spawn().await;
    app.create_user("alice").await;
    let token = reset_token(&app, "alice@example.com").await;

    let first = app
        .post_json(
            "/auth/reset-password",
            json!({ "token": token, "new_password": "first secret" }),
            None,
        )
        .await;
    assert_eq!(first.status(), StatusCode::OK);

    let second = app
        .post_json(
            "/auth/reset-password",
            json!({ "token": token, "new_password": "second secret" }),
            None,
        )
        .await;
    assert_eq!(second.status(), StatusCode::BAD_REQUEST);
    app.login("alice", "first secret").await;
}

#[tokio::test]
async fn test_unknown_email_gets_the_same_answer() {
    let app = TestApp::spawn().await;
    app.create_user("alice").await;

    let known = app
        .post_json("/auth/forgot-password", json!({ "email": "alice@example.com" }), None)
        .await;
    let unknown = app
        .post_json("/auth/forgot-password", json!({ "email": "nobody@example.com" }), None)
        .await;

    assert_eq!(known.status(), StatusCode::OK);
    assert_eq!(unknown.status(), StatusCode::OK);
    assert_eq!(body_json(known).await, body_json(unknown).await);
}

#[tokio::test]
async fn test_short_new_password_is_rejected() {
    let app = TestApp::spawn().await;

    let response = app
        .post_json(
            "/auth/reset-password",
            json!({ "token": "whatever", "new_password": "short" }),
            None,
        )
        .await;
    assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
}
