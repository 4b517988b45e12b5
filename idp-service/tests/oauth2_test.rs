mod common;

use axum::http::{header, StatusCode};
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use chrono::{TimeZone, Utc};
use common::{body_json, location, query_param, TestApp, PASSWORD};
use idp_service::models::{ConditionalAccessPolicy, MfaDevice, PolicyActions, User};
use idp_service::services::totp::generate_totp;
use idp_service::services::IdentityRepository;
use sha2::{Digest, Sha256};

const CLIENT_ID: &str = "crm-web";
const CLIENT_SECRET: &str = "s3cret";
const REDIRECT_URI: &str = "https://crm.example.com/cb";
const REDIRECT_URI_ENCODED: &str = "https%3A%2F%2Fcrm.example.com%2Fcb";

/// Run the authorize step as `username` and return the issued code.
async fn authorize(app: &TestApp, bearer: &str, extra: &str) -> String {
    let uri = format!(
        "/oauth2/authorize?response_type=code&client_id={}&redirect_uri={}&scope=openid%20email&state=xyz{}",
        CLIENT_ID, REDIRECT_URI_ENCODED, extra
    );
    let response = app.get(&uri, Some(bearer)).await;
    assert_eq!(response.status(), StatusCode::FOUND);

    let target = location(&response);
    assert!(target.starts_with(REDIRECT_URI));
    assert_eq!(query_param(&target, "state").as_deref(), Some("xyz"));
    query_param(&target, "code").expect("code parameter")
}

fn password_form(username: &str) -> String {
    format!(
        "grant_type=password&username={}&password={}",
        username,
        PASSWORD.replace(' ', "+")
    )
}

fn exchange_form(code: &str) -> String {
    format!(
        "grant_type=authorization_code&code={}&redirect_uri={}",
        code, REDIRECT_URI_ENCODED
    )
}

#[tokio::test]
async fn test_authorization_code_is_redeemed_once() {
    let app = TestApp::spawn().await;
    let alice = app.create_user("alice").await;
    app.create_client(CLIENT_ID, CLIENT_SECRET, REDIRECT_URI).await;
    let session = app.access_token("alice").await;

    let code = authorize(&app, &session, "&nonce=n-0S6").await;

    let first = app
        .post_form("/oauth2/token", &exchange_form(&code), Some((CLIENT_ID, CLIENT_SECRET)))
        .await;
    assert_eq!(first.status(), StatusCode::OK);
    assert_eq!(first.headers().get(header::CACHE_CONTROL).unwrap(), "no-store");
    let tokens = body_json(first).await;
    assert_eq!(tokens["token_type"], "Bearer");
    assert_eq!(tokens["scope"], "openid email");

    let id_token = tokens["id_token"].as_str().expect("id_token for openid scope");
    let claims = app.state.tokens.decode_id_token(id_token, CLIENT_ID).unwrap();
    assert_eq!(claims.sub, alice.user_id.to_string());
    assert_eq!(claims.nonce.as_deref(), Some("n-0S6"));

    let second = app
        .post_form("/oauth2/token", &exchange_form(&code), Some((CLIENT_ID, CLIENT_SECRET)))
        .await;
    assert_eq!(second.status(), StatusCode::BAD_REQUEST);
    assert_eq!(body_json(second).await["error"], "invalid_grant");
    assert_eq!(app.events.of_type("oauth2.token_issued").len(), 1);
}

#[tokio::test]
async fn test_userinfo_follows_granted_scope() {
    let app = TestApp::spawn().await;
    let alice = app.create_user("alice").await;
    app.create_client(CLIENT_ID, CLIENT_SECRET, REDIRECT_URI).await;
    let session = app.access_token("alice").await;

    let code = authorize(&app, &session, "").await;
    let tokens = body_json(
        app.post_form("/oauth2/token", &exchange_form(&code), Some((CLIENT_ID, CLIENT_SECRET)))
            .await,
    )
    .await;
    let access = tokens["access_token"].as_str().unwrap();

    let info = body_json(app.get("/oauth2/userinfo", Some(access)).await).await;
    assert_eq!(info["sub"], alice.user_id.to_string());
    assert_eq!(info["email"], "alice@example.com");
    assert!(info.get("preferred_username").is_none());
}

#[tokio::test]
async fn test_userinfo_rejects_unknown_token() {
    let app = TestApp::spawn().await;

    let response = app.get("/oauth2/userinfo", Some("not-a-token")).await;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    assert!(response.headers().get(header::WWW_AUTHENTICATE).is_some());
    assert_eq!(body_json(response).await["error"], "invalid_token");
}

#[tokio::test]
async fn test_pkce_verifier_must_match() {
    let app = TestApp::spawn().await;
    app.create_user("alice").await;
    app.create_client(CLIENT_ID, CLIENT_SECRET, REDIRECT_URI).await;
    let session = app.access_token("alice").await;

    let verifier = "dBjftJeZ4CVP-mB92K27uhbUJU1p1r_wW1gFWFOEjXk";
    let challenge = URL_SAFE_NO_PAD.encode(Sha256::digest(verifier.as_bytes()));
    let extra = format!("&code_challenge={}&code_challenge_method=S256", challenge);

    let code = authorize(&app, &session, &extra).await;
    let wrong = app
        .post_form(
            "/oauth2/token",
            &format!("{}&code_verifier=wrong", exchange_form(&code)),
            Some((CLIENT_ID, CLIENT_SECRET)),
        )
        .await;
    assert_eq!(wrong.status(), StatusCode::BAD_REQUEST);

    let code = authorize(&app, &session, &extra).await;
    let right = app
        .post_form(
            "/oauth2/token",
            &format!("{}&code_verifier={}", exchange_form(&code), verifier),
            Some((CLIENT_ID, CLIENT_SECRET)),
        )
        .await;
    assert_eq!(right.status(), StatusCode::OK);
}

#[tokio::test]
async fn test_authorize_without_session_requires_login() {
    let app = TestApp::spawn().await;
    app.create_client(CLIENT_ID, CLIENT_SECRET, REDIRECT_URI).await;

    let uri = format!(
        "/oauth2/authorize?response_type=code&client_id={}&redirect_uri={}",
        CLIENT_ID, REDIRECT_URI_ENCODED
    );
    let response = app.get(&uri, None).await;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(body_json(response).await["error"], "login_required");
}

#[tokio::test]
async fn test_authorize_rejects_unregistered_redirect() {
    let app = TestApp::spawn().await;
    app.create_user("alice").await;
    app.create_client(CLIENT_ID, CLIENT_SECRET, REDIRECT_URI).await;
    let session = app.access_token("alice").await;

    let uri = format!(
        "/oauth2/authorize?response_type=code&client_id={}&redirect_uri=https%3A%2F%2Fevil.example.com%2Fcb",
        CLIENT_ID
    );
    let response = app.get(&uri, Some(&session)).await;
    assert!(response.headers().get(header::LOCATION).is_none());
    assert_eq!(body_json(response).await["error"], "invalid_client");
}

#[tokio::test]
async fn test_client_credentials_grant() {
    let app = TestApp::spawn().await;
    app.create_client(CLIENT_ID, CLIENT_SECRET, REDIRECT_URI).await;

    let response = app
        .post_form(
            "/oauth2/token",
            &format!(
                "grant_type=client_credentials&client_id={}&client_secret={}&scope=profile",
                CLIENT_ID, CLIENT_SECRET
            ),
            None,
        )
        .await;
    assert_eq!(response.status(), StatusCode::OK);
    let tokens = body_json(response).await;
    assert!(tokens.get("refresh_token").is_none());
    assert_eq!(tokens["scope"], "profile");
}

#[tokio::test]
async fn test_wrong_client_secret_is_invalid_client() {
    let app = TestApp::spawn().await;
    app.create_client(CLIENT_ID, CLIENT_SECRET, REDIRECT_URI).await;

    let response = app
        .post_form("/oauth2/token", "grant_type=client_credentials", Some((CLIENT_ID, "guess")))
        .await;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(body_json(response).await["error"], "invalid_client");
}

#[tokio::test]
async fn test_password_and_refresh_grants() {
    let app = TestApp::spawn().await;
    app.create_user("alice").await;
    app.create_client(CLIENT_ID, CLIENT_SECRET, REDIRECT_URI).await;

    let response = app
        .post_form(
            "/oauth2/token",
            &format!("grant_type=password&username=alice&password={}", PASSWORD.replace(' ', "+")),
            Some((CLIENT_ID, CLIENT_SECRET)),
        )
        .await;
    assert_eq!(response.status(), StatusCode::OK);
    let tokens = body_json(response).await;
    let refresh = tokens["refresh_token"].as_str().expect("refresh token").to_string();

    let refreshed = app
        .post_form(
            "/oauth2/token",
            &format!("grant_type=refresh_token&refresh_token={}", urlencoding::encode(&refresh)),
            Some((CLIENT_ID, CLIENT_SECRET)),
        )
        .await;
    assert_eq!(refreshed.status(), StatusCode::OK);
    let body = body_json(refreshed).await;
    assert!(!body["access_token"].as_str().unwrap().is_empty());
}

#[tokio::test]
async fn test_unsupported_grant_type() {
    let app = TestApp::spawn().await;

    let response = app.post_form("/oauth2/token", "grant_type=implicit", None).await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(body_json(response).await["error"], "unsupported_grant_type");
}

#[tokio::test]
async fn test_password_grant_honours_block_policy() {
    let app = TestApp::spawn().await;
    app.create_user("alice").await;
    app.create_client(CLIENT_ID, CLIENT_SECRET, REDIRECT_URI).await;
    app.repo
        .insert_policy(
            &ConditionalAccessPolicy::new("lockdown", 100, vec![], PolicyActions::block()).unwrap(),
        )
        .await
        .unwrap();

    let first_party = app.post_form("/oauth2/token", &password_form("alice"), None).await;
    assert_eq!(first_party.status(), StatusCode::FORBIDDEN);
    let body = body_json(first_party).await;
    assert_eq!(body["error"], "access_denied");
    assert!(body.get("access_token").is_none());

    let with_client = app
        .post_form("/oauth2/token", &password_form("alice"), Some((CLIENT_ID, CLIENT_SECRET)))
        .await;
    assert_eq!(with_client.status(), StatusCode::FORBIDDEN);
    assert_eq!(body_json(with_client).await["error"], "access_denied");

    let attempts = app.repo.list_login_attempts("alice", 10).await.unwrap();
    assert_eq!(attempts.len(), 2);
    assert!(attempts.iter().all(|a| !a.success));
}

#[tokio::test]
async fn test_password_grant_requires_mfa_when_risk_is_high() {
    // Off-hours first login from a new device and address
    let at = Utc.with_ymd_and_hms(2024, 6, 5, 3, 0, 0).unwrap();
    let app = TestApp::spawn_with(at, |_| {}).await;
    app.create_user("carol").await;
    app.create_client(CLIENT_ID, CLIENT_SECRET, REDIRECT_URI).await;

    let first_party = app.post_form("/oauth2/token", &password_form("carol"), None).await;
    assert_eq!(first_party.status(), StatusCode::BAD_REQUEST);
    assert_eq!(body_json(first_party).await["error"], "invalid_grant");

    let with_client = app
        .post_form("/oauth2/token", &password_form("carol"), Some((CLIENT_ID, CLIENT_SECRET)))
        .await;
    assert_eq!(with_client.status(), StatusCode::BAD_REQUEST);
    assert_eq!(body_json(with_client).await["error"], "invalid_grant");
}

#[tokio::test]
async fn test_password_grant_accepts_second_factor() {
    const SECRET: &str = "JBSWY3DPEHPK3PXPJBSWY3DPEHPK3PXP";

    let app = TestApp::spawn().await;
    app.create_client(CLIENT_ID, CLIENT_SECRET, REDIRECT_URI).await;
    let mut dave = User::new(
        "dave".into(),
        "dave@example.com".into(),
        idp_service::utils::hash_password(PASSWORD).unwrap(),
    );
    dave.mfa_enabled = true;
    let dave = app.repo.insert_user(&dave).await.unwrap();
    app.repo
        .insert_mfa_device(&MfaDevice::totp(dave.user_id, SECRET))
        .await
        .unwrap();

    let without_code = app
        .post_form("/oauth2/token", &password_form("dave"), Some((CLIENT_ID, CLIENT_SECRET)))
        .await;
    assert_eq!(body_json(without_code).await["error"], "invalid_grant");

    let code = generate_totp(SECRET, common::noon()).unwrap();
    let response = app
        .post_form(
            "/oauth2/token",
            &format!("{}&mfa_code={}", password_form("dave"), code),
            Some((CLIENT_ID, CLIENT_SECRET)),
        )
        .await;
    assert_eq!(response.status(), StatusCode::OK);
    assert!(body_json(response).await["access_token"].is_string());

    let logged = app.repo.list_login_attempts("dave", 1).await.unwrap();
    assert!(logged[0].success);
    assert!(logged[0].mfa_required);
    assert_eq!(app.events.of_type("user.login").len(), 1);
}
