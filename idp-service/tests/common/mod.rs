//! Shared harness for the HTTP integration tests.
//!
//! Builds the real router over in-memory storage, a fixed clock and
//! recording notifier/event sinks, with RSA keys written to temp files.

#![allow(dead_code)]

use axum::{
    body::Body,
    http::{header, Request, Response, StatusCode},
    Router,
};
use base64::{engine::general_purpose::STANDARD, Engine};
use chrono::{DateTime, TimeZone, Utc};
use http_body_util::BodyExt;
use idp_service::{
    build_router,
    config::{
        DeliveryConfig, Environment, IdpConfig, JwtConfig, RateLimitConfig, RiskConfig,
        RiskMfaFallback, SamlIdpConfig, SecurityConfig, WebhookConfig,
    },
    models::{federation::NAME_ID_EMAIL, CasService, OAuthClient, SamlConfig, User},
    services::{
        FixedClock, InMemoryRepository, MemoryStore, RecordingEventSink, RecordingNotifier,
        TokenService,
    },
    utils::hash_password,
    AppState, Backends,
};
use idp_service::services::{IdentityRepository, Metrics};
use std::io::Write;
use std::sync::Arc;
use tempfile::NamedTempFile;
use tower::util::ServiceExt;

pub const PRIVATE_KEY: &str = include_str!("../fixtures/jwt_private.pem");
pub const PUBLIC_KEY: &str = include_str!("../fixtures/jwt_public.pem");
pub const SAML_CERT: &str = include_str!("../fixtures/saml_cert.pem");

pub const PASSWORD: &str = "correct horse battery";
pub const CLIENT_IP: &str = "203.0.113.7";
pub const USER_AGENT: &str = "Mozilla/5.0 (X11; Linux x86_64) Firefox/128.0";
pub const PUBLIC_URL: &str = "https://idp.test";

/// Wednesday, inside business hours.
pub fn noon() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 6, 5, 12, 0, 0).unwrap()
}

pub fn test_config(private_key_path: &str, public_key_path: &str) -> IdpConfig {
    IdpConfig {
        common: Default::default(),
        environment: Environment::Dev,
        service_name: "idp-service".to_string(),
        service_version: "test".to_string(),
        log_level: "error".to_string(),
        otlp_endpoint: None,
        public_url: PUBLIC_URL.to_string(),
        database: None,
        redis: None,
        jwt: JwtConfig {
            private_key_path: private_key_path.to_string(),
            public_key_path: public_key_path.to_string(),
            issuer: PUBLIC_URL.to_string(),
            key_id: "test-key".to_string(),
            access_token_expiry_minutes: 15,
            refresh_token_expiry_days: 7,
        },
        risk: RiskConfig {
            on_risk_mfa_unavailable: RiskMfaFallback::Deny,
            mfa_threshold: 50,
            failed_attempt_window_seconds: 900,
            lockout_threshold: 10,
        },
        saml: SamlIdpConfig {
            entity_id: format!("{}/saml", PUBLIC_URL),
        },
        smtp: None,
        sms: None,
        webhooks: WebhookConfig::default(),
        delivery: DeliveryConfig {
            workers: 1,
            queue_capacity: 16,
            max_retries: 0,
            attempt_timeout_seconds: 1,
        },
        security: SecurityConfig {
            allowed_origins: vec!["https://app.test".to_string()],
            secure_cookies: false,
        },
        rate_limit: RateLimitConfig {
            login_attempts: 1000,
            login_window_seconds: 60,
            token_attempts: 1000,
            token_window_seconds: 60,
            global_ip_limit: 10000,
            global_ip_window_seconds: 60,
        },
        bootstrap_admin: None,
    }
}

pub struct TestApp {
    pub router: Router,
    pub state: AppState,
    pub repo: Arc<InMemoryRepository>,
    pub store: Arc<MemoryStore>,
    pub clock: Arc<FixedClock>,
    pub notifier: Arc<RecordingNotifier>,
    pub events: Arc<RecordingEventSink>,
    _key_files: (NamedTempFile, NamedTempFile),
}

impl TestApp {
    pub async fn spawn() -> Self {
        Self::spawn_with(noon(), |_| {}).await
    }

    pub async fn spawn_with(at: DateTime<Utc>, customize: impl FnOnce(&mut IdpConfig)) -> Self {
        let mut private_file = NamedTempFile::new().expect("Failed to create temp file");
        private_file
            .write_all(PRIVATE_KEY.as_bytes())
            .expect("Failed to write private key");
        let mut public_file = NamedTempFile::new().expect("Failed to create temp file");
        public_file
            .write_all(PUBLIC_KEY.as_bytes())
            .expect("Failed to write public key");

        let mut config = test_config(
            private_file.path().to_str().unwrap(),
            public_file.path().to_str().unwrap(),
        );
        customize(&mut config);

        let clock = Arc::new(FixedClock::new(at));
        let repo = Arc::new(InMemoryRepository::new());
        let store = Arc::new(MemoryStore::new(clock.clone()));
        let notifier = Arc::new(RecordingNotifier::new());
        let events = Arc::new(RecordingEventSink::new());
        let tokens =
            TokenService::new(&config.jwt, clock.clone()).expect("Failed to load test keys");

        let state = AppState::new(
            config,
            tokens,
            Backends {
                repo: repo.clone(),
                store: store.clone(),
                clock: clock.clone(),
                email: notifier.clone(),
                sms: notifier.clone(),
                events: events.clone(),
                metrics: Metrics::new().expect("Failed to build metrics registry"),
            },
        );

        Self {
            router: build_router(state.clone()),
            state,
            repo,
            store,
            clock,
            notifier,
            events,
            _key_files: (private_file, public_file),
        }
    }

    // ==================== Fixtures ====================

    pub async fn create_user(&self, username: &str) -> User {
        let user = User::new(
            username.to_string(),
            format!("{}@example.com", username),
            hash_password(PASSWORD).unwrap(),
        );
        self.repo.insert_user(&user).await.unwrap()
    }

    pub async fn create_client(
        &self,
        client_id: &str,
        secret: &str,
        redirect_uri: &str,
    ) -> OAuthClient {
        let client = OAuthClient::new(client_id, secret, "crm").with_redirect_uri(redirect_uri);
        self.repo.insert_oauth_client(&client).await.unwrap();
        client
    }

    pub async fn register_cas_service(&self, prefix: &str) {
        self.repo
            .insert_cas_service(&CasService::new("portal", prefix))
            .await
            .unwrap();
    }

    pub async fn register_saml_sp(&self, app_id: &str) {
        self.repo
            .insert_saml_config(&SamlConfig {
                app_id: app_id.to_string(),
                sp_entity_id: "https://sp.example.com".to_string(),
                acs_url: "https://sp.example.com/acs".to_string(),
                acs_binding: "post".to_string(),
                slo_url: Some("https://sp.example.com/slo".to_string()),
                name_id_format: NAME_ID_EMAIL.to_string(),
                certificate_pem: SAML_CERT.to_string(),
                private_key_pem: PRIVATE_KEY.to_string(),
                created_utc: Utc::now(),
            })
            .await
            .unwrap();
    }

    // ==================== Requests ====================

    pub async fn send(&self, request: Request<Body>) -> Response<Body> {
        self.router.clone().oneshot(request).await.unwrap()
    }

    fn builder(method: &str, uri: &str) -> axum::http::request::Builder {
        Request::builder()
            .method(method)
            .uri(uri)
            .header("x-forwarded-for", CLIENT_IP)
            .header(header::USER_AGENT, USER_AGENT)
    }

    pub async fn get(&self, uri: &str, bearer: Option<&str>) -> Response<Body> {
        let mut builder = Self::builder("GET", uri);
        if let Some(token) = bearer {
            builder = builder.header(header::AUTHORIZATION, format!("Bearer {}", token));
        }
        self.send(builder.body(Body::empty()).unwrap()).await
    }

    pub async fn post_json(
        &self,
        uri: &str,
        body: serde_json::Value,
        bearer: Option<&str>,
    ) -> Response<Body> {
        let mut builder =
            Self::builder("POST", uri).header(header::CONTENT_TYPE, "application/json");
        if let Some(token) = bearer {
            builder = builder.header(header::AUTHORIZATION, format!("Bearer {}", token));
        }
        self.send(builder.body(Body::from(body.to_string())).unwrap()).await
    }

    pub async fn post_form(
        &self,
        uri: &str,
        form: &str,
        basic: Option<(&str, &str)>,
    ) -> Response<Body> {
        let mut builder = Self::builder("POST", uri)
            .header(header::CONTENT_TYPE, "application/x-www-form-urlencoded");
        if let Some((id, secret)) = basic {
            let encoded = STANDARD.encode(format!("{}:{}", id, secret));
            builder = builder.header(header::AUTHORIZATION, format!("Basic {}", encoded));
        }
        self.send(builder.body(Body::from(form.to_string())).unwrap()).await
    }

    /// Password login; panics unless it succeeds.
    pub async fn login(&self, username: &str, password: &str) -> serde_json::Value {
        let response = self
            .post_json(
                "/auth/login",
                serde_json::json!({ "username": username, "password": password }),
                None,
            )
            .await;
        assert_eq!(response.status(), StatusCode::OK, "login for {} failed", username);
        body_json(response).await
    }

    pub async fn access_token(&self, username: &str) -> String {
        self.login(username, PASSWORD).await["access_token"]
            .as_str()
            .unwrap()
            .to_string()
    }
}

pub async fn body_string(response: Response<Body>) -> String {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    String::from_utf8(bytes.to_vec()).unwrap()
}

pub async fn body_json(response: Response<Body>) -> serde_json::Value {
    serde_json::from_str(&body_string(response).await).unwrap()
}

pub fn location(response: &Response<Body>) -> String {
    response
        .headers()
        .get(header::LOCATION)
        .expect("missing Location header")
        .to_str()
        .unwrap()
        .to_string()
}

/// Value of `name` in the query string of `url`.
pub fn query_param(url: &str, name: &str) -> Option<String> {
    let (_, query) = url.split_once('?')?;
    query.split('&').find_map(|pair| {
        let (key, value) = pair.split_once('=')?;
        (key == name).then(|| urlencoding::decode(value).unwrap().into_owned())
    })
}
