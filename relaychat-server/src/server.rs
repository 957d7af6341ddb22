use std::{
    sync::{Arc, OnceLock},
    time::Duration,
};

use anyhow::Context;
use axum::{
    Extension, Router,
    http::{HeaderValue, StatusCode, header},
    response::IntoResponse,
    routing::get,
    serve,
};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use shared::config::server::{Backend, Config, LogFormat};
use tokio::net::TcpListener;
use tower_http::cors::{AllowHeaders, AllowMethods, AllowOrigin, CorsLayer};
use tracing::{info, level_filters::LevelFilter, warn};
use tracing_subscriber::{EnvFilter, fmt};

use crate::{
    app_state::AppState,
    broker,
    db::bootstrap,
    handlers,
    middleware::request_context::{self, RequestIdState},
    routes::{self, openapi::openapi_routes},
    store, tracer,
};

static PROMETHEUS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Process-wide Prometheus handle. The first call installs the recorder; if
/// another recorder is already installed the handle still renders, just
/// without the metrics recorded elsewhere.
pub fn metrics_handle() -> PrometheusHandle {
    PROMETHEUS_HANDLE
        .get_or_init(|| {
            let recorder = PrometheusBuilder::new().build_recorder();
            let handle = recorder.handle();
            if let Err(err) = metrics::set_global_recorder(recorder) {
                warn!(error = %err, "metrics recorder already installed");
            }
            handle
        })
        .clone()
}

async fn metrics_endpoint(Extension(handle): Extension<PrometheusHandle>) -> impl IntoResponse {
    (
        StatusCode::OK,
        [(
            header::CONTENT_TYPE,
            HeaderValue::from_static("text/plain; version=0.0.4"),
        )],
        handle.render(),
    )
}

/// Initializes the tracing subscriber for logging using the provided configuration.
///
/// A subscriber that is already installed (tests, embedding) is left alone.
pub fn initialize_tracing(config: &Config) -> String {
    let env_filter = build_env_filter(config);

    let fmt_builder = fmt::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_level(true)
        .with_thread_ids(false)
        .with_thread_names(false);

    let installed = if matches!(config.logging.format, LogFormat::Json) {
        fmt_builder.json().with_ansi(false).try_init()
    } else {
        fmt_builder.with_ansi(true).try_init()
    };
    if installed.is_err() {
        warn!("tracing subscriber already installed");
    }

    config.logging.level.clone()
}

fn build_env_filter(config: &Config) -> EnvFilter {
    let default_level = config
        .logging
        .level
        .parse::<LevelFilter>()
        .unwrap_or(LevelFilter::INFO);

    EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::builder()
            .with_default_directive(default_level.into())
            .from_env_lossy()
    })
}

/// Creates the CORS layer for the application.
pub fn create_cors_layer(config: &Config) -> CorsLayer {
    use http::Method;

    let methods = vec![
        Method::GET,
        Method::POST,
        Method::PATCH,
        Method::DELETE,
        Method::OPTIONS,
    ];

    let mut cors = CorsLayer::new()
        .allow_methods(AllowMethods::list(methods))
        .allow_headers(AllowHeaders::any())
        .allow_credentials(config.server.cors.allow_credentials)
        .max_age(Duration::from_secs(config.server.cors.max_age_seconds));

    if config.server.cors.allowed_origins.is_empty() {
        cors = cors.allow_origin(AllowOrigin::any());
    } else {
        let origins = config
            .server
            .cors
            .allowed_origins
            .iter()
            .filter_map(|origin| http::HeaderValue::from_str(origin).ok())
            .collect::<Vec<_>>();
        cors = cors.allow_origin(AllowOrigin::list(origins));
    }

    cors
}

/// Routes under `/api` for the configured role. Writers expose commands,
/// readers expose queries and the event stream, combined processes both.
pub fn create_api_router(config: &Config) -> Router<Arc<AppState>> {
    let role = config.server.role;
    let mut router = Router::new();

    if role.serves_commands() {
        router = router.merge(handlers::commands::routes());
    }
    if role.serves_queries() {
        router = router.merge(handlers::queries::routes());
    }

    router
}

/// Creates the main application router with all middleware and routes.
pub fn create_app_router(state: Arc<AppState>, metrics_handle: PrometheusHandle) -> Router {
    let config = Arc::clone(&state.config);
    let cors = create_cors_layer(&config);
    let request_id_state = RequestIdState::from_config(&config);

    Router::new()
        .nest("/api", create_api_router(&config))
        .merge(routes::health::create_health_router())
        .route("/metrics", get(metrics_endpoint))
        .merge(openapi_routes())
        .layer(Extension(metrics_handle))
        .layer(tracer::create_trace_layer())
        .layer(axum::middleware::from_fn_with_state(
            request_id_state,
            request_context::assign_request_id,
        ))
        .layer(cors)
        .with_state(state)
}

/// Resolves when the process receives CTRL+C.
pub async fn create_shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!(error = %err, "failed to listen for shutdown signal");
        return;
    }
    info!("Shutting down...");
}

/// Builds the shared state for `config`: connects and bootstraps the
/// database when the store is Postgres, then opens the broker handles the
/// role needs.
///
/// # Errors
/// Returns an error if the database or broker cannot be reached, or the
/// bootstrap scripts fail.
pub async fn create_app_state(config: Arc<Config>) -> anyhow::Result<Arc<AppState>> {
    let pool = if config.store.backend == Backend::Postgres {
        let pool = bootstrap::connect_pool(&config.db)
            .await
            .context("failed to connect to the database")?;
        bootstrap::ensure_liveness(&pool)
            .await
            .context("database liveness check failed")?;
        if config.db.run_bootstrap {
            bootstrap::run(&pool, &config.db)
                .await
                .context("database bootstrap failed")?;
        }
        bootstrap::ensure_readiness(&pool)
            .await
            .context("database readiness check failed")?;
        Some(pool)
    } else {
        None
    };

    let store = store::build_store(&config, pool)?;
    let handles = broker::connect(&config)
        .await
        .context("failed to connect to the broker")?;

    let state = Arc::new(AppState::new(config, store, handles));
    if let Some(hub) = &state.hub {
        hub.ensure_started()
            .await
            .context("failed to subscribe to broker topics")?;
    }
    Ok(state)
}

/// Starts the server for the configured role and serves until shutdown.
///
/// # Errors
/// Returns an error if startup fails or the listener cannot be bound.
pub async fn run(config: Config) -> anyhow::Result<()> {
    initialize_tracing(&config);
    let config = Arc::new(config);
    info!(
        role = config.server.role.as_str(),
        instance_id = %config.server.instance_id,
        "Starting server..."
    );

    let metrics_handle = metrics_handle();
    let state = create_app_state(Arc::clone(&config)).await?;
    let app = create_app_router(Arc::clone(&state), metrics_handle);

    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    info!("Listening on {}", addr);

    serve(listener, app)
        .with_graceful_shutdown(create_shutdown_signal())
        .await?;

    if let Some(hub) = &state.hub {
        hub.shutdown().await;
    }
    Ok(())
}
