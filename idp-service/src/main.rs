use idp_service::{
    build_router,
    config::IdpConfig,
    db,
    services::{
        bootstrap, Clock, EphemeralStore, LogNotifier, MemoryStore, Metrics, Notifier, RedisStore,
        SmsGatewayNotifier, SmtpNotifier, SystemClock, TokenService, WebhookDispatcher,
    },
    AppState, Backends,
};
use service_core::error::AppError;
use service_core::observability::logging::init_tracing;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::signal;

#[tokio::main]
async fn main() -> Result<(), AppError> {
    dotenvy::dotenv().ok();

    // Load configuration - fail fast if invalid
    let config = IdpConfig::from_env()?;

    init_tracing(&config.service_name, &config.log_level, config.otlp_endpoint.as_deref())?;

    tracing::info!(
        service = %config.service_name,
        version = %config.service_version,
        environment = ?config.environment,
        "Starting identity provider"
    );

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let metrics = Metrics::new().map_err(|e| AppError::InternalError(e.into()))?;

    let repo = db::open_repository(config.database.as_ref()).await?;

    let store: Arc<dyn EphemeralStore> = match &config.redis {
        Some(redis) => Arc::new(
            RedisStore::connect(&redis.url)
                .await
                .map_err(AppError::ConfigError)?,
        ),
        None => {
            tracing::warn!("REDIS_URL not set, ephemeral state is held in memory");
            Arc::new(MemoryStore::new(clock.clone()))
        }
    };
    tracing::info!("Storage initialized");

    let tokens = TokenService::new(&config.jwt, clock.clone()).map_err(AppError::ConfigError)?;
    tracing::info!(key_id = %config.jwt.key_id, "Token signing keys loaded");

    let email: Arc<dyn Notifier> = match &config.smtp {
        Some(smtp) => Arc::new(SmtpNotifier::new(smtp).map_err(AppError::ConfigError)?),
        None => Arc::new(LogNotifier),
    };
    let sms: Arc<dyn Notifier> = match &config.sms {
        Some(gateway) => Arc::new(SmsGatewayNotifier::new(gateway)),
        None => Arc::new(LogNotifier),
    };
    let events = Arc::new(WebhookDispatcher::new(
        config.webhooks.urls.clone(),
        &config.delivery,
        metrics.clone(),
    ));

    if let Some(admin) = &config.bootstrap_admin {
        bootstrap::ensure_admin(&repo, admin).await?;
    }

    let addr = config.common.socket_addr();
    let state = AppState::new(
        config.clone(),
        tokens,
        Backends {
            repo,
            store,
            clock,
            email,
            sms,
            events,
            metrics,
        },
    );
    let app = build_router(state);

    let service_span = tracing::info_span!(
        "service",
        service = %config.service_name,
        version = %config.service_version,
        environment = ?config.environment,
    );
    let _guard = service_span.enter();

    tracing::info!(address = %addr, "Listening");

    let listener = tokio::net::TcpListener::bind(addr).await?;

    axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("Service shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received SIGINT, starting graceful shutdown");
        },
        _ = terminate => {
            tracing::info!("Received SIGTERM, starting graceful shutdown");
        },
    }
}
