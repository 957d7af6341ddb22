//! Reader endpoints. Queries never mutate the store.

use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Path, State},
    routing::{get, post},
};
use shared::models::{
    ChatSummary, ErrorResponse, Message, Query, QueryOutcome, ReadStatus, UnreadCounter,
};
use tracing::instrument;
use uuid::Uuid;

use crate::{app_state::AppState, handlers::socket, http::error::AppResult};

pub fn routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/chats/{chat_id}/messages", get(list_messages))
        .route("/users/{user_id}/chats", get(list_chats_for_user))
        .route("/messages/{message_id}/read-status", get(get_read_status))
        .route("/users/{user_id}/unread", get(get_unread_counts))
        .route("/queries", post(execute_query))
        .route("/ws", get(socket::stream_handler))
}

#[utoipa::path(
    get,
    path = "/api/chats/{chat_id}/messages",
    params(("chat_id" = Uuid, Path, description = "Chat id")),
    responses(
        (status = 200, description = "Messages ordered by creation time", body = [Message]),
        (status = 404, description = "Chat not found", body = ErrorResponse)
    ),
    tag = "Queries"
)]
#[instrument(skip(state))]
pub async fn list_messages(
    State(state): State<Arc<AppState>>,
    Path(chat_id): Path<Uuid>,
) -> AppResult<Json<Vec<Message>>> {
    Ok(Json(state.queries()?.list_messages(chat_id).await?))
}

#[utoipa::path(
    get,
    path = "/api/users/{user_id}/chats",
    params(("user_id" = Uuid, Path, description = "User id")),
    responses(
        (status = 200, description = "Chats the user participates in", body = [ChatSummary])
    ),
    tag = "Queries"
)]
#[instrument(skip(state))]
pub async fn list_chats_for_user(
    State(state): State<Arc<AppState>>,
    Path(user_id): Path<Uuid>,
) -> AppResult<Json<Vec<ChatSummary>>> {
    Ok(Json(state.queries()?.list_chats_for_user(user_id).await?))
}

#[utoipa::path(
    get,
    path = "/api/messages/{message_id}/read-status",
    params(("message_id" = Uuid, Path, description = "Message id")),
    responses(
        (status = 200, description = "Read status of the message", body = ReadStatus),
        (status = 404, description = "Message not found", body = ErrorResponse)
    ),
    tag = "Queries"
)]
#[instrument(skip(state))]
pub async fn get_read_status(
    State(state): State<Arc<AppState>>,
    Path(message_id): Path<Uuid>,
) -> AppResult<Json<ReadStatus>> {
    Ok(Json(state.queries()?.get_read_status(message_id).await?))
}

#[utoipa::path(
    get,
    path = "/api/users/{user_id}/unread",
    params(("user_id" = Uuid, Path, description = "User id")),
    responses(
        (status = 200, description = "Unread counters per chat", body = [UnreadCounter])
    ),
    tag = "Queries"
)]
#[instrument(skip(state))]
pub async fn get_unread_counts(
    State(state): State<Arc<AppState>>,
    Path(user_id): Path<Uuid>,
) -> AppResult<Json<Vec<UnreadCounter>>> {
    Ok(Json(state.queries()?.get_unread_counts(user_id).await?))
}

#[utoipa::path(
    post,
    path = "/api/queries",
    request_body = Query,
    responses(
        (status = 200, description = "Query result", body = QueryOutcome)
    ),
    tag = "Queries"
)]
#[instrument(skip(state, query), fields(query = query.name()))]
pub async fn execute_query(
    State(state): State<Arc<AppState>>,
    Json(query): Json<Query>,
) -> AppResult<Json<QueryOutcome>> {
    Ok(Json(state.queries()?.execute(query).await?))
}
