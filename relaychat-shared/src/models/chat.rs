use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use uuid::Uuid;

use super::timestamp::Timestamp;

/// A chat and its participant set. The set is never empty and only grows.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, ToSchema)]
pub struct Chat {
    pub id: Uuid,
    pub name: String,
    #[schema(value_type = Vec<Uuid>)]
    pub participants: BTreeSet<Uuid>,
    pub active: bool,
    pub created_at: Timestamp,
}

impl Chat {
    #[must_use]
    pub fn is_participant(&self, user_id: Uuid) -> bool {
        self.participants.contains(&user_id)
    }

    #[must_use]
    pub fn participant_count(&self) -> usize {
        self.participants.len()
    }

    /// Participants that receive unread increments for a message from `sender_id`.
    pub fn recipients_of(&self, sender_id: Uuid) -> impl Iterator<Item = Uuid> + '_ {
        self.participants
            .iter()
            .copied()
            .filter(move |participant| *participant != sender_id)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, ToSchema)]
pub struct Message {
    pub id: Uuid,
    pub chat_id: Uuid,
    pub sender_id: Uuid,
    pub content: String,
    pub created_at: Timestamp,
    pub edited: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub edited_at: Option<Timestamp>,
}

impl Message {
    /// Ordering key clients use instead of delivery order.
    #[must_use]
    pub fn ordering_key(&self) -> (Timestamp, Uuid) {
        (self.created_at, self.id)
    }
}

/// A chat as seen by one participant, with that participant's unread count.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, ToSchema)]
pub struct ChatSummary {
    pub chat: Chat,
    pub unread_count: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_message_at: Option<Timestamp>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, ToSchema)]
pub struct CreateChatRequest {
    pub name: String,
    pub participant_ids: Vec<Uuid>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, ToSchema)]
pub struct AddParticipantsRequest {
    pub user_ids: Vec<Uuid>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, ToSchema)]
pub struct SendMessageRequest {
    pub content: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, ToSchema)]
pub struct EditMessageRequest {
    pub content: String,
}
