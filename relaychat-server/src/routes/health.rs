use std::sync::Arc;

use axum::{
    Router,
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Json},
    routing::get,
};
use serde::Serialize;
use tracing::warn;

use crate::app_state::AppState;

#[derive(Serialize)]
struct HealthResponse<'a> {
    status: &'a str,
    role: &'a str,
}

async fn healthz(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    metrics::counter!("health_checks_total", "endpoint" => "healthz", "status" => "ok")
        .increment(1);
    (
        StatusCode::OK,
        Json(HealthResponse {
            status: "ok",
            role: state.config.server.role.as_str(),
        }),
    )
}

async fn readyz(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let role = state.config.server.role.as_str();
    match state.store.health_check().await {
        Ok(()) => {
            metrics::counter!(
                "health_checks_total",
                "endpoint" => "readyz",
                "status" => "ok"
            )
            .increment(1);
            (
                StatusCode::OK,
                Json(HealthResponse {
                    status: "ready",
                    role,
                }),
            )
        }
        Err(err) => {
            warn!(error = %err, "readiness check failed");
            metrics::counter!(
                "health_checks_total",
                "endpoint" => "readyz",
                "status" => "error"
            )
            .increment(1);
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(HealthResponse {
                    status: "degraded",
                    role,
                }),
            )
        }
    }
}

pub fn create_health_router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{broker::BrokerHandles, store::memory::MemoryChatStore};
    use axum::{body::Body, http::Request};
    use shared::config::server::{Config, Profile};
    use tower::ServiceExt;

    fn state_with(store: Arc<MemoryChatStore>) -> Arc<AppState> {
        Arc::new(AppState::new(
            Arc::new(Config::default_for_profile(Profile::Test)),
            store,
            BrokerHandles::default(),
        ))
    }

    async fn status_of(app: Router, uri: &str) -> StatusCode {
        app.oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap()
            .status()
    }

    #[tokio::test]
    async fn healthz_returns_ok() {
        let _ = crate::server::metrics_handle();
        let app = create_health_router().with_state(state_with(Arc::new(MemoryChatStore::new())));
        assert_eq!(status_of(app, "/healthz").await, StatusCode::OK);
    }

    #[tokio::test]
    async fn readyz_follows_store_health() {
        let _ = crate::server::metrics_handle();
        let store = Arc::new(MemoryChatStore::new());
        let app = create_health_router().with_state(state_with(store.clone()));

        assert_eq!(status_of(app.clone(), "/readyz").await, StatusCode::OK);

        store.set_offline(true);
        assert_eq!(
            status_of(app, "/readyz").await,
            StatusCode::SERVICE_UNAVAILABLE
        );
    }
}
