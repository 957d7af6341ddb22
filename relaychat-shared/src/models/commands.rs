//! Commands are served by writer processes, queries by reader processes.
//! The two never share a type, so routing is decided by the type itself.

use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use uuid::Uuid;

use super::{
    chat::{Chat, ChatSummary, Message},
    receipts::{ReadReceipt, ReadStatus, UnreadCounter},
};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, ToSchema)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Command {
    SendMessage {
        chat_id: Uuid,
        sender_id: Uuid,
        content: String,
    },
    EditMessage {
        message_id: Uuid,
        sender_id: Uuid,
        content: String,
    },
    DeleteMessage {
        message_id: Uuid,
        sender_id: Uuid,
    },
    MarkAsRead {
        message_id: Uuid,
        user_id: Uuid,
    },
    CreateChat {
        name: String,
        participant_ids: Vec<Uuid>,
    },
    AddParticipants {
        chat_id: Uuid,
        user_ids: Vec<Uuid>,
    },
}

impl Command {
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::SendMessage { .. } => "send_message",
            Self::EditMessage { .. } => "edit_message",
            Self::DeleteMessage { .. } => "delete_message",
            Self::MarkAsRead { .. } => "mark_as_read",
            Self::CreateChat { .. } => "create_chat",
            Self::AddParticipants { .. } => "add_participants",
        }
    }

    /// The user the command acts on behalf of, for commands that name one.
    #[must_use]
    pub const fn actor(&self) -> Option<Uuid> {
        match self {
            Self::SendMessage { sender_id, .. }
            | Self::EditMessage { sender_id, .. }
            | Self::DeleteMessage { sender_id, .. } => Some(*sender_id),
            Self::MarkAsRead { user_id, .. } => Some(*user_id),
            Self::CreateChat { .. } | Self::AddParticipants { .. } => None,
        }
    }
}

/// Result of a mark-as-read command.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, ToSchema)]
pub struct MarkReadOutcome {
    /// `None` when the reader is the message's own sender.
    pub receipt: Option<ReadReceipt>,
    /// `true` only when this call created the receipt.
    pub created: bool,
    /// Post-reset counter when this call reset it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reset_counter: Option<UnreadCounter>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, ToSchema)]
pub struct MessageDeleted {
    pub message_id: Uuid,
    pub chat_id: Uuid,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, ToSchema)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum CommandOutcome {
    Message(Message),
    MessageDeleted(MessageDeleted),
    MarkedRead(MarkReadOutcome),
    Chat(Chat),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, ToSchema)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Query {
    ListMessages { chat_id: Uuid },
    ListChatsForUser { user_id: Uuid },
    GetReadStatus { message_id: Uuid },
    GetUnreadCounts { user_id: Uuid },
}

impl Query {
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::ListMessages { .. } => "list_messages",
            Self::ListChatsForUser { .. } => "list_chats_for_user",
            Self::GetReadStatus { .. } => "get_read_status",
            Self::GetUnreadCounts { .. } => "get_unread_counts",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, ToSchema)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum QueryOutcome {
    Messages(Vec<Message>),
    Chats(Vec<ChatSummary>),
    ReadStatus(ReadStatus),
    UnreadCounts(Vec<UnreadCounter>),
}
