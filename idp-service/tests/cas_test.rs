mod common;

use axum::http::{header, StatusCode};
use common::{body_string, location, query_param, TestApp};

const SERVICE: &str = "https://portal.example.com/app";
const SERVICE_ENCODED: &str = "https%3A%2F%2Fportal.example.com%2Fapp";

async fn issue_ticket(app: &TestApp, session: &str) -> String {
    let response = app
        .get(&format!("/cas/login?service={}", SERVICE_ENCODED), Some(session))
        .await;
    assert_eq!(response.status(), StatusCode::FOUND);
    let target = location(&response);
    assert!(target.starts_with(SERVICE));
    let ticket = query_param(&target, "ticket").expect("ticket parameter");
    assert!(ticket.starts_with("ST-"));
    ticket
}

#[tokio::test]
async fn test_validate_answers_exact_bytes_and_burns_ticket() {
    let app = TestApp::spawn().await;
    app.create_user("alice").await;
    app.register_cas_service("https://portal.example.com/").await;
    let session = app.access_token("alice").await;
    let ticket = issue_ticket(&app, &session).await;

    let uri = format!("/cas/validate?ticket={}&service={}", ticket, SERVICE_ENCODED);
    let first = app.get(&uri, None).await;
    assert_eq!(first.status(), StatusCode::OK);
    assert!(first
        .headers()
        .get(header::CONTENT_TYPE)
        .unwrap()
        .to_str()
        .unwrap()
        .starts_with("text/plain"));
    assert_eq!(body_string(first).await, "yes\nalice\n");

    let second = app.get(&uri, None).await;
    assert_eq!(body_string(second).await, "no\n");
}

#[tokio::test]
async fn test_validate_unissued_ticket() {
    let app = TestApp::spawn().await;

    let response = app
        .get(&format!("/cas/validate?ticket=ST-bogus&service={}", SERVICE_ENCODED), None)
        .await;
    assert_eq!(body_string(response).await, "no\n");
}

#[tokio::test]
async fn test_service_validate_success_xml() {
    let app = TestApp::spawn().await;
    app.create_user("alice").await;
    app.register_cas_service("https://portal.example.com/").await;
    let session = app.access_token("alice").await;
    let ticket = issue_ticket(&app, &session).await;

    let response = app
        .get(
            &format!("/cas/serviceValidate?ticket={}&service={}", ticket, SERVICE_ENCODED),
            None,
        )
        .await;
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_string(response).await;
    assert!(body.contains("<cas:authenticationSuccess>"));
    assert!(body.contains("<cas:user>alice</cas:user>"));
    assert_eq!(app.events.of_type("cas.ticket_validated").len(), 1);
}

#[tokio::test]
async fn test_service_mismatch_consumes_ticket() {
    let app = TestApp::spawn().await;
    app.create_user("alice").await;
    app.register_cas_service("https://portal.example.com/").await;
    let session = app.access_token("alice").await;
    let ticket = issue_ticket(&app, &session).await;

    let other = app
        .get(
            &format!(
                "/cas/serviceValidate?ticket={}&service=https%3A%2F%2Fportal.example.com%2Fother",
                ticket
            ),
            None,
        )
        .await;
    assert!(body_string(other).await.contains("code=\"INVALID_SERVICE\""));

    let retry = app
        .get(&format!("/cas/serviceValidate?ticket={}&service={}", ticket, SERVICE_ENCODED), None)
        .await;
    assert!(body_string(retry).await.contains("code=\"INVALID_TICKET\""));
}

#[tokio::test]
async fn test_login_requires_session_and_registered_service() {
    let app = TestApp::spawn().await;
    app.create_user("alice").await;
    app.register_cas_service("https://portal.example.com/").await;

    let anonymous = app
        .get(&format!("/cas/login?service={}", SERVICE_ENCODED), None)
        .await;
    assert_eq!(anonymous.status(), StatusCode::UNAUTHORIZED);

    let session = app.access_token("alice").await;
    let unregistered = app
        .get("/cas/login?service=https%3A%2F%2Fevil.example.com%2F", Some(&session))
        .await;
    assert_eq!(unregistered.status(), StatusCode::BAD_REQUEST);
    assert!(body_string(unregistered).await.starts_with("INVALID_SERVICE"));
}

#[tokio::test]
async fn test_store_outage_fails_closed() {
    let app = TestApp::spawn().await;
    app.create_user("alice").await;
    app.register_cas_service("https://portal.example.com/").await;
    let session = app.access_token("alice").await;
    let ticket = issue_ticket(&app, &session).await;

    app.store.set_available(false);
    let response = app
        .get(&format!("/cas/validate?ticket={}&service={}", ticket, SERVICE_ENCODED), None)
        .await;
    assert_eq!(body_string(response).await, "no\n");
}
