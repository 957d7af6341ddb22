use std::sync::Arc;

use crate::{app_state::AppState, openapi::ApiDoc};
use axum::{
    Json, Router,
    http::StatusCode,
    response::IntoResponse,
    routing::get,
};
use utoipa::OpenApi;

async fn openapi_yaml() -> impl IntoResponse {
    match ApiDoc::openapi().to_yaml() {
        Ok(yaml) => (StatusCode::OK, yaml),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("YAML error: {e}"),
        ),
    }
}

async fn openapi_json() -> impl IntoResponse {
    Json(ApiDoc::openapi())
}

pub fn openapi_routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/openapi/relaychat.yaml", get(openapi_yaml))
        .route("/openapi/relaychat.json", get(openapi_json))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn document_lists_command_and_query_paths() {
        let doc = ApiDoc::openapi();
        for path in [
            "/api/chats",
            "/api/chats/{chat_id}/messages",
            "/api/messages/{message_id}",
            "/api/messages/{message_id}/read",
            "/api/messages/{message_id}/read-status",
            "/api/users/{user_id}/unread",
            "/api/commands",
            "/api/queries",
        ] {
            assert!(doc.paths.paths.contains_key(path), "missing {path}");
        }
    }

    #[tokio::test]
    async fn yaml_renders() {
        let response = openapi_yaml().await.into_response();
        assert_eq!(response.status(), StatusCode::OK);
    }
}
