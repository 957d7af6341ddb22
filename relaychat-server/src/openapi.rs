#![allow(clippy::needless_for_each)] // Derive macro emits a for_each internally

use shared::models::{
    AddParticipantsRequest, Chat, ChatListRefreshEvent, ChatNotificationEvent, ChatSummary,
    ChatUpdatedEvent, ClientFrame, Command, CommandOutcome, CreateChatRequest, EditMessageRequest,
    ErrorResponse, EventEnvelope, EventPayload, MarkReadOutcome, Message, MessageDeleted,
    MessageDeletedEvent, Query, QueryOutcome, ReadReceipt, ReadReceiptCreatedEvent, ReadStatus,
    RefreshReason, SendMessageRequest, ServerFrame, SubscribeRequest, Timestamp, Topic,
    UnreadCounter,
};
use utoipa::OpenApi;

#[derive(OpenApi)]
#[openapi(
    info(
        title = "relaychat API",
        version = "1.0.0",
        description = "Commands are served by writer instances, queries and streams by readers"
    ),
    paths(
        crate::handlers::commands::create_chat,
        crate::handlers::commands::add_participants,
        crate::handlers::commands::send_message,
        crate::handlers::commands::edit_message,
        crate::handlers::commands::delete_message,
        crate::handlers::commands::mark_as_read,
        crate::handlers::commands::execute_command,
        crate::handlers::queries::list_messages,
        crate::handlers::queries::list_chats_for_user,
        crate::handlers::queries::get_read_status,
        crate::handlers::queries::get_unread_counts,
        crate::handlers::queries::execute_query,
        crate::handlers::socket::stream_handler,
    ),
    components(
        schemas(
            Timestamp,
            Chat,
            ChatSummary,
            Message,
            MessageDeleted,
            ReadReceipt,
            ReadStatus,
            UnreadCounter,
            MarkReadOutcome,
            CreateChatRequest,
            AddParticipantsRequest,
            SendMessageRequest,
            EditMessageRequest,
            Command,
            CommandOutcome,
            Query,
            QueryOutcome,
            Topic,
            EventEnvelope,
            EventPayload,
            MessageDeletedEvent,
            ChatUpdatedEvent,
            ReadReceiptCreatedEvent,
            ChatNotificationEvent,
            ChatListRefreshEvent,
            RefreshReason,
            SubscribeRequest,
            ClientFrame,
            ServerFrame,
            ErrorResponse,
        )
    ),
    tags(
        (name = "Commands", description = "Writer endpoints"),
        (name = "Queries", description = "Reader endpoints"),
        (name = "Streaming", description = "Real-time event channel")
    )
)]
pub struct ApiDoc;
