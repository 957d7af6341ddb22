//! Writer endpoints. Every handler resolves the acting user from the request
//! context and runs exactly one command.

use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Path, State},
    http::StatusCode,
    routing::{patch, post},
};
use shared::models::{
    AddParticipantsRequest, Chat, Command, CommandOutcome, CreateChatRequest, EditMessageRequest,
    ErrorResponse, MarkReadOutcome, Message, MessageDeleted, SendMessageRequest,
};
use tracing::instrument;
use uuid::Uuid;

use crate::{
    app_state::AppState,
    http::error::{ApiError, AppResult},
    middleware::request_context::RequestContext,
};

pub fn routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/chats", post(create_chat))
        .route("/chats/{chat_id}/participants", post(add_participants))
        .route("/chats/{chat_id}/messages", post(send_message))
        .route(
            "/messages/{message_id}",
            patch(edit_message).delete(delete_message),
        )
        .route("/messages/{message_id}/read", post(mark_as_read))
        .route("/commands", post(execute_command))
}

#[utoipa::path(
    post,
    path = "/api/chats",
    request_body = CreateChatRequest,
    responses(
        (status = 201, description = "Chat created", body = Chat),
        (status = 400, description = "Invalid request", body = ErrorResponse),
        (status = 503, description = "Store unavailable", body = ErrorResponse)
    ),
    tag = "Commands"
)]
#[instrument(skip(state, context, payload))]
pub async fn create_chat(
    State(state): State<Arc<AppState>>,
    context: RequestContext,
    Json(payload): Json<CreateChatRequest>,
) -> AppResult<(StatusCode, Json<Chat>)> {
    context.require_user()?;
    let chat = state
        .commands()?
        .create_chat(payload.name, payload.participant_ids)
        .await?;
    Ok((StatusCode::CREATED, Json(chat)))
}

#[utoipa::path(
    post,
    path = "/api/chats/{chat_id}/participants",
    request_body = AddParticipantsRequest,
    params(("chat_id" = Uuid, Path, description = "Chat id")),
    responses(
        (status = 200, description = "Participants added", body = Chat),
        (status = 400, description = "Participant limit exceeded", body = ErrorResponse),
        (status = 404, description = "Chat not found", body = ErrorResponse)
    ),
    tag = "Commands"
)]
#[instrument(skip(state, context, payload))]
pub async fn add_participants(
    State(state): State<Arc<AppState>>,
    context: RequestContext,
    Path(chat_id): Path<Uuid>,
    Json(payload): Json<AddParticipantsRequest>,
) -> AppResult<Json<Chat>> {
    context.require_user()?;
    let chat = state
        .commands()?
        .add_participants(chat_id, payload.user_ids)
        .await?;
    Ok(Json(chat))
}

#[utoipa::path(
    post,
    path = "/api/chats/{chat_id}/messages",
    request_body = SendMessageRequest,
    params(("chat_id" = Uuid, Path, description = "Chat id")),
    responses(
        (status = 201, description = "Message sent", body = Message),
        (status = 400, description = "Content empty or over the size limit", body = ErrorResponse),
        (status = 403, description = "Sender is not a participant", body = ErrorResponse),
        (status = 404, description = "Chat not found", body = ErrorResponse)
    ),
    tag = "Commands"
)]
#[instrument(skip(state, context, payload))]
pub async fn send_message(
    State(state): State<Arc<AppState>>,
    context: RequestContext,
    Path(chat_id): Path<Uuid>,
    Json(payload): Json<SendMessageRequest>,
) -> AppResult<(StatusCode, Json<Message>)> {
    let sender_id = context.require_user()?;
    let message = state
        .commands()?
        .send_message(chat_id, sender_id, payload.content)
        .await?;
    Ok((StatusCode::CREATED, Json(message)))
}

#[utoipa::path(
    patch,
    path = "/api/messages/{message_id}",
    request_body = EditMessageRequest,
    params(("message_id" = Uuid, Path, description = "Message id")),
    responses(
        (status = 200, description = "Message edited", body = Message),
        (status = 403, description = "Only the sender may edit", body = ErrorResponse),
        (status = 404, description = "Message not found", body = ErrorResponse)
    ),
    tag = "Commands"
)]
#[instrument(skip(state, context, payload))]
pub async fn edit_message(
    State(state): State<Arc<AppState>>,
    context: RequestContext,
    Path(message_id): Path<Uuid>,
    Json(payload): Json<EditMessageRequest>,
) -> AppResult<Json<Message>> {
    let sender_id = context.require_user()?;
    let message = state
        .commands()?
        .edit_message(message_id, sender_id, payload.content)
        .await?;
    Ok(Json(message))
}

#[utoipa::path(
    delete,
    path = "/api/messages/{message_id}",
    params(("message_id" = Uuid, Path, description = "Message id")),
    responses(
        (status = 200, description = "Message deleted", body = MessageDeleted),
        (status = 403, description = "Only the sender may delete", body = ErrorResponse),
        (status = 404, description = "Message not found", body = ErrorResponse)
    ),
    tag = "Commands"
)]
#[instrument(skip(state, context))]
pub async fn delete_message(
    State(state): State<Arc<AppState>>,
    context: RequestContext,
    Path(message_id): Path<Uuid>,
) -> AppResult<Json<MessageDeleted>> {
    let sender_id = context.require_user()?;
    let deleted = state
        .commands()?
        .delete_message(message_id, sender_id)
        .await?;
    Ok(Json(deleted))
}

#[utoipa::path(
    post,
    path = "/api/messages/{message_id}/read",
    params(("message_id" = Uuid, Path, description = "Message id")),
    responses(
        (status = 200, description = "Message marked as read", body = MarkReadOutcome),
        (status = 403, description = "Reader is not a participant", body = ErrorResponse),
        (status = 404, description = "Message not found", body = ErrorResponse)
    ),
    tag = "Commands"
)]
#[instrument(skip(state, context))]
pub async fn mark_as_read(
    State(state): State<Arc<AppState>>,
    context: RequestContext,
    Path(message_id): Path<Uuid>,
) -> AppResult<Json<MarkReadOutcome>> {
    let user_id = context.require_user()?;
    let outcome = state
        .commands()?
        .mark_as_read(message_id, user_id)
        .await?;
    Ok(Json(outcome))
}

/// Generic command endpoint. Commands that name an actor must name the
/// caller.
#[utoipa::path(
    post,
    path = "/api/commands",
    request_body = Command,
    responses(
        (status = 200, description = "Command applied", body = CommandOutcome),
        (status = 403, description = "Actor does not match the caller", body = ErrorResponse)
    ),
    tag = "Commands"
)]
#[instrument(skip(state, context, command), fields(command = command.name()))]
pub async fn execute_command(
    State(state): State<Arc<AppState>>,
    context: RequestContext,
    Json(command): Json<Command>,
) -> AppResult<Json<CommandOutcome>> {
    let caller = context.require_user()?;
    if command.actor().is_some_and(|actor| actor != caller) {
        return Err(ApiError::forbidden(
            "commands may only act on behalf of the caller",
        ));
    }
    let outcome = state.commands()?.execute(command).await?;
    Ok(Json(outcome))
}
