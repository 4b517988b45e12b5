mod common;

use axum::http::{header, StatusCode};
use base64::{engine::general_purpose::STANDARD, Engine};
use common::{body_string, location, TestApp};
use idp_service::services::saml::response::deflate_base64;

const SUCCESS: &str = "urn:oasis:names:tc:SAML:2.0:status:Success";
const REQUESTER: &str = "urn:oasis:names:tc:SAML:2.0:status:Requester";

fn authn_request(id: &str) -> String {
    format!(
        r#"<samlp:AuthnRequest xmlns:samlp="urn:oasis:names:tc:SAML:2.0:protocol" xmlns:saml="urn:oasis:names:tc:SAML:2.0:assertion" ID="{}" Version="2.0" AssertionConsumerServiceURL="https://sp.example.com/acs"><saml:Issuer>https://sp.example.com</saml:Issuer></samlp:AuthnRequest>"#,
        id
    )
}

/// Decoded `SAMLResponse` from an auto-submitting POST form.
fn posted_response(html: &str) -> String {
    let marker = r#"name="SAMLResponse" value=""#;
    let start = html.find(marker).expect("SAMLResponse field") + marker.len();
    let end = start + html[start..].find('"').unwrap();
    String::from_utf8(STANDARD.decode(&html[start..end]).unwrap()).unwrap()
}

async fn sp_initiated(app: &TestApp, session: &str, request_id: &str) -> String {
    let encoded = deflate_base64(&authn_request(request_id)).unwrap();
    let response = app
        .get(
            &format!(
                "/saml/sso?SAMLRequest={}&RelayState=%2Fhome",
                urlencoding::encode(&encoded)
            ),
            Some(session),
        )
        .await;
    assert_eq!(response.status(), StatusCode::OK);
    body_string(response).await
}

#[tokio::test]
async fn test_sp_initiated_sso_posts_signed_assertion() {
    let app = TestApp::spawn().await;
    app.create_user("alice").await;
    app.register_saml_sp("wiki").await;
    let session = app.access_token("alice").await;

    let html = sp_initiated(&app, &session, "_req1").await;
    assert!(html.contains(r#"action="https://sp.example.com/acs""#));
    assert!(html.contains(r#"name="RelayState" value="/home""#));

    let xml = posted_response(&html);
    assert!(xml.contains(SUCCESS));
    assert!(xml.contains(r#"InResponseTo="_req1""#));
    assert!(xml.contains("<saml:Audience>https://sp.example.com</saml:Audience>"));
    assert!(xml.contains(">alice@example.com</saml:NameID>"));
    assert!(xml.contains("<ds:SignatureValue>"));
    assert!(xml.contains("<ds:X509Certificate>"));
    assert_eq!(app.events.of_type("saml.assertion_issued").len(), 1);
}

#[tokio::test]
async fn test_replayed_request_gets_requester_status() {
    let app = TestApp::spawn().await;
    app.create_user("alice").await;
    app.register_saml_sp("wiki").await;
    let session = app.access_token("alice").await;

    sp_initiated(&app, &session, "_req2").await;
    let replay = posted_response(&sp_initiated(&app, &session, "_req2").await);
    assert!(replay.contains(REQUESTER));
    assert!(!replay.contains("<saml:Assertion"));
}

#[tokio::test]
async fn test_idp_initiated_sso() {
    let app = TestApp::spawn().await;
    app.create_user("alice").await;
    app.register_saml_sp("wiki").await;
    let session = app.access_token("alice").await;

    let response = app.get("/saml/sso?app_id=wiki", Some(&session)).await;
    assert_eq!(response.status(), StatusCode::OK);
    let xml = posted_response(&body_string(response).await);
    assert!(xml.contains(SUCCESS));
    assert!(!xml.contains("InResponseTo"));
}

#[tokio::test]
async fn test_sso_without_session_is_not_a_success() {
    let app = TestApp::spawn().await;
    app.register_saml_sp("wiki").await;

    let response = app.get("/saml/sso?app_id=wiki", None).await;
    let xml = posted_response(&body_string(response).await);
    assert!(!xml.contains(SUCCESS));
    assert!(!xml.contains("<saml:Assertion"));
}

#[tokio::test]
async fn test_unknown_application_is_not_found() {
    let app = TestApp::spawn().await;
    app.create_user("alice").await;
    let session = app.access_token("alice").await;

    let response = app.get("/saml/sso?app_id=nope", Some(&session)).await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    assert!(body_string(response).await.contains("<samlp:StatusCode"));
}

#[tokio::test]
async fn test_metadata_publishes_certificate_and_endpoints() {
    let app = TestApp::spawn().await;
    app.register_saml_sp("wiki").await;

    let response = app.get("/saml/metadata?app_id=wiki", None).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers().get(header::CONTENT_TYPE).unwrap(),
        "application/samlmetadata+xml"
    );
    let xml = body_string(response).await;
    assert!(xml.contains(r#"entityID="https://idp.test/saml""#));
    assert!(xml.contains("https://idp.test/saml/sso"));
    assert!(xml.contains("<ds:X509Certificate>"));
}

#[tokio::test]
async fn test_slo_ends_sessions() {
    let app = TestApp::spawn().await;
    app.create_user("alice").await;
    app.register_saml_sp("wiki").await;
    let session = app.access_token("alice").await;

    let logout = r#"<samlp:LogoutRequest xmlns:samlp="urn:oasis:names:tc:SAML:2.0:protocol" xmlns:saml="urn:oasis:names:tc:SAML:2.0:assertion" ID="_lr1" Version="2.0"><saml:Issuer>https://sp.example.com</saml:Issuer><saml:NameID>alice@example.com</saml:NameID></samlp:LogoutRequest>"#;
    let response = app
        .get(
            &format!(
                "/saml/slo?SAMLRequest={}",
                urlencoding::encode(&deflate_base64(logout).unwrap())
            ),
            None,
        )
        .await;
    assert_eq!(response.status(), StatusCode::FOUND);
    assert!(location(&response).starts_with("https://sp.example.com/slo?SAMLResponse="));

    // The session behind the access token is gone
    let after = app.get("/saml/sso?app_id=wiki", Some(&session)).await;
    let xml = posted_response(&body_string(after).await);
    assert!(!xml.contains(SUCCESS));
    assert_eq!(app.events.of_type("user.logout").len(), 1);
}

#[tokio::test]
async fn test_slo_post_binding_answers_with_form() {
    let app = TestApp::spawn().await;
    app.create_user("alice").await;
    app.register_saml_sp("wiki").await;

    let logout = r#"<samlp:LogoutRequest xmlns:samlp="urn:oasis:names:tc:SAML:2.0:protocol" xmlns:saml="urn:oasis:names:tc:SAML:2.0:assertion" ID="_lr2" Version="2.0"><saml:Issuer>https://sp.example.com</saml:Issuer><saml:NameID>alice@example.com</saml:NameID></samlp:LogoutRequest>"#;
    let response = app
        .post_form(
            "/saml/slo",
            &format!("SAMLRequest={}", urlencoding::encode(&STANDARD.encode(logout))),
            None,
        )
        .await;
    assert_eq!(response.status(), StatusCode::OK);
    let html = body_string(response).await;
    assert!(html.contains(r#"action="https://sp.example.com/slo""#));
    assert!(posted_response(&html).contains(r#"InResponseTo="_lr2""#));
}
