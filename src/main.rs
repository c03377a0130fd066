mod config;
mod delivery;
mod domain;
mod repository;
mod telemetry;
mod usecase;

use std::sync::Arc;

use axum::{
    extract::State,
    middleware,
    routing::{delete, get, post},
    Router,
};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use tokio::sync::watch;
use tower_http::trace::TraceLayer;

use crate::delivery::http::v1::middleware::auth_middleware;
use crate::delivery::http::v1::notifications::{
    dismiss, list_notifications, mark_all_read, mark_read, refresh, sign_out, unread_count,
};
use crate::delivery::http::v1::ws::websocket_handler;
use crate::repository::local;
use crate::repository::postgres::{create_pool, PgChangeFeed, PostgresNotificationSource};
use crate::usecase::contracts::LocalStorage;
use crate::usecase::feed::{FeedSettings, NotificationFeed};
use crate::usecase::jwt::JwtService;
use crate::usecase::session::SessionRegistry;

pub type Sessions = SessionRegistry<PostgresNotificationSource, dyn LocalStorage, PgChangeFeed>;
pub type Feed = NotificationFeed<PostgresNotificationSource, dyn LocalStorage>;

pub struct AppState {
    pub sessions: Sessions,
    pub jwt_service: JwtService,
    pub metrics_handle: PrometheusHandle,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = config::AppConfig::from_env()?;

    telemetry::init(&telemetry::TelemetryConfig::from(&config))
        .map_err(|e| anyhow::anyhow!("failed to initialize telemetry: {}", e))?;

    tracing::info!("starting the notification feed service");

    let metrics_handle = PrometheusBuilder::new().install_recorder()?;
    metrics_process::Collector::default().describe();
    tracing::info!("prometheus metrics initialized");

    tracing::info!("config loaded, telemetry_enabled={}", config.telemetry_enabled);

    let pool = create_pool(&config.database_url, config.database_max_connections).await?;
    tracing::info!("database pool created");

    if config.run_migrations {
        sqlx::migrate!().run(&pool).await?;
        tracing::info!("database migrations applied");
    }

    let (change_feed, listener_task) = PgChangeFeed::listen(&pool).await?;
    // Read state degrades to memory-only instead of blocking startup.
    let storage = local::open_or_unavailable(&config.storage_dir);

    let settings = FeedSettings {
        owned_posts_limit: config.owned_posts_limit,
        fetch_timeout: config.fetch_timeout(),
        fallback_actor_name: config.fallback_actor_name.clone(),
    };

    let sessions = SessionRegistry::new(
        Arc::new(PostgresNotificationSource::new(pool)),
        storage,
        Arc::new(change_feed),
        settings,
        config.debounce(),
    );

    let shared_state = Arc::new(AppState {
        sessions,
        jwt_service: JwtService::new(config.jwt_secret.clone()),
        metrics_handle,
    });

    let notifications_api = Router::new()
        .route("/api/v1/notifications", get(list_notifications))
        .route("/api/v1/notifications/unread-count", get(unread_count))
        .route("/api/v1/notifications/read-all", post(mark_all_read))
        .route("/api/v1/notifications/refresh", post(refresh))
        .route("/api/v1/notifications/{id}", delete(dismiss))
        .route("/api/v1/notifications/{id}/read", post(mark_read))
        .route("/api/v1/session/sign-out", post(sign_out))
        .layer(middleware::from_fn_with_state(
            shared_state.clone(),
            auth_middleware,
        ));

    // Token comes in the query string, outside the bearer middleware.
    let router = Router::new()
        .route("/healthz", get(healthz))
        .route("/metrics", get(metrics))
        .route("/api/v1/notifications/ws", get(websocket_handler))
        .merge(notifications_api)
        .layer(TraceLayer::new_for_http())
        .with_state(shared_state.clone());

    let (sweeper_stop, sweeper_rx) = watch::channel(false);
    let sweeper = tokio::spawn({
        let state = shared_state.clone();
        let idle = config.session_idle();
        let every = config.session_sweep();
        async move {
            state.sessions.run_idle_sweeper(idle, every, sweeper_rx).await;
        }
    });
    tracing::info!(
        idle_secs = config.session_idle_secs,
        sweep_secs = config.session_sweep_secs,
        "idle session sweeper started"
    );

    let listener = tokio::net::TcpListener::bind(&config.listen_addr).await?;
    tracing::info!("notification feed service running on {}", config.listen_addr);
    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    let _ = sweeper_stop.send(true);
    if let Err(e) = sweeper.await {
        tracing::warn!(error = %e, "idle session sweeper ended abnormally");
    }
    shared_state.sessions.sign_out_all().await;
    listener_task.abort();
    tracing::info!("all notification sessions closed");

    Ok(())
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    tracing::info!("shutdown signal received");
}

async fn metrics(State(state): State<Arc<AppState>>) -> String {
    metrics_process::Collector::default().collect();
    state.metrics_handle.render()
}

#[tracing::instrument]
async fn healthz() -> &'static str {
    "OK"
}
