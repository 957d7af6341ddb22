use std::collections::{HashSet, VecDeque};

use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use uuid::Uuid;

use super::{
    chat::{Chat, Message},
    receipts::{ReadReceipt, UnreadCounter},
    timestamp::Timestamp,
};

/// Characters of message content carried by a `chat-notification`.
pub const NOTIFICATION_PREVIEW_CHARS: usize = 140;

/// Size of `value` once JSON-encoded, the form it takes on the broker.
#[must_use]
pub fn encoded_len<T: Serialize + ?Sized>(value: &T) -> usize {
    serde_json::to_vec(value).map_or(usize::MAX, |bytes| bytes.len())
}

/// Broker topics. The serialized name is also the broker channel name.
#[derive(
    Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash, ToSchema,
)]
pub enum Topic {
    #[serde(rename = "message.created")]
    MessageCreated,
    #[serde(rename = "message.updated")]
    MessageUpdated,
    #[serde(rename = "message.deleted")]
    MessageDeleted,
    #[serde(rename = "chat.created")]
    ChatCreated,
    #[serde(rename = "chat.updated")]
    ChatUpdated,
    #[serde(rename = "read-receipt.created")]
    ReadReceiptCreated,
    #[serde(rename = "unread-counter.changed")]
    UnreadCounterChanged,
    #[serde(rename = "chat-notification")]
    ChatNotification,
    #[serde(rename = "chat-list-refresh")]
    ChatListRefresh,
}

/// How subscriptions to a topic are scoped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TopicScope {
    /// Filtered by the chat the event belongs to.
    Chat,
    /// Filtered by the user the event is about.
    User,
    /// Filtered by membership in the audience the event names.
    Audience,
}

impl Topic {
    pub const ALL: [Self; 9] = [
        Self::MessageCreated,
        Self::MessageUpdated,
        Self::MessageDeleted,
        Self::ChatCreated,
        Self::ChatUpdated,
        Self::ReadReceiptCreated,
        Self::UnreadCounterChanged,
        Self::ChatNotification,
        Self::ChatListRefresh,
    ];

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::MessageCreated => "message.created",
            Self::MessageUpdated => "message.updated",
            Self::MessageDeleted => "message.deleted",
            Self::ChatCreated => "chat.created",
            Self::ChatUpdated => "chat.updated",
            Self::ReadReceiptCreated => "read-receipt.created",
            Self::UnreadCounterChanged => "unread-counter.changed",
            Self::ChatNotification => "chat-notification",
            Self::ChatListRefresh => "chat-list-refresh",
        }
    }

    #[must_use]
    pub const fn scope(self) -> TopicScope {
        match self {
            Self::MessageCreated
            | Self::MessageUpdated
            | Self::MessageDeleted
            | Self::ChatUpdated
            | Self::ReadReceiptCreated => TopicScope::Chat,
            Self::UnreadCounterChanged => TopicScope::User,
            Self::ChatCreated | Self::ChatNotification | Self::ChatListRefresh => {
                TopicScope::Audience
            }
        }
    }
}

impl TryFrom<&str> for Topic {
    type Error = &'static str;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        Self::ALL
            .into_iter()
            .find(|topic| topic.as_str() == value)
            .ok_or("unknown topic")
    }
}

impl std::fmt::Display for Topic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, ToSchema)]
pub struct MessageDeletedEvent {
    pub message_id: Uuid,
    pub chat_id: Uuid,
    pub sender_id: Uuid,
    pub deleted_at: Timestamp,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, ToSchema)]
pub struct ChatUpdatedEvent {
    pub chat: Chat,
    pub added_user_ids: Vec<Uuid>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, ToSchema)]
pub struct ReadReceiptCreatedEvent {
    pub receipt: ReadReceipt,
    pub sender_id: Uuid,
    pub read_by_count: usize,
    pub participant_count: usize,
    pub fully_read: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, ToSchema)]
pub struct ChatNotificationEvent {
    pub chat_id: Uuid,
    pub message_id: Uuid,
    pub sender_id: Uuid,
    pub recipients: Vec<Uuid>,
    pub preview: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum RefreshReason {
    ChatCreated,
    ParticipantsAdded,
    MessageCreated,
    MessageUpdated,
    MessageDeleted,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, ToSchema)]
pub struct ChatListRefreshEvent {
    pub chat_id: Uuid,
    pub user_ids: Vec<Uuid>,
    pub reason: RefreshReason,
}

/// Typed body of every broker event, tagged with its topic name.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, ToSchema)]
#[serde(tag = "type", content = "data")]
pub enum EventPayload {
    #[serde(rename = "message.created")]
    MessageCreated(Message),
    #[serde(rename = "message.updated")]
    MessageUpdated(Message),
    #[serde(rename = "message.deleted")]
    MessageDeleted(MessageDeletedEvent),
    #[serde(rename = "chat.created")]
    ChatCreated(Chat),
    #[serde(rename = "chat.updated")]
    ChatUpdated(ChatUpdatedEvent),
    #[serde(rename = "read-receipt.created")]
    ReadReceiptCreated(ReadReceiptCreatedEvent),
    #[serde(rename = "unread-counter.changed")]
    UnreadCounterChanged(UnreadCounter),
    #[serde(rename = "chat-notification")]
    ChatNotification(ChatNotificationEvent),
    #[serde(rename = "chat-list-refresh")]
    ChatListRefresh(ChatListRefreshEvent),
}

impl EventPayload {
    #[must_use]
    pub const fn topic(&self) -> Topic {
        match self {
            Self::MessageCreated(_) => Topic::MessageCreated,
            Self::MessageUpdated(_) => Topic::MessageUpdated,
            Self::MessageDeleted(_) => Topic::MessageDeleted,
            Self::ChatCreated(_) => Topic::ChatCreated,
            Self::ChatUpdated(_) => Topic::ChatUpdated,
            Self::ReadReceiptCreated(_) => Topic::ReadReceiptCreated,
            Self::UnreadCounterChanged(_) => Topic::UnreadCounterChanged,
            Self::ChatNotification(_) => Topic::ChatNotification,
            Self::ChatListRefresh(_) => Topic::ChatListRefresh,
        }
    }

    #[must_use]
    pub fn chat_id(&self) -> Uuid {
        match self {
            Self::MessageCreated(message) | Self::MessageUpdated(message) => message.chat_id,
            Self::MessageDeleted(event) => event.chat_id,
            Self::ChatCreated(chat) => chat.id,
            Self::ChatUpdated(event) => event.chat.id,
            Self::ReadReceiptCreated(event) => event.receipt.chat_id,
            Self::UnreadCounterChanged(counter) => counter.chat_id,
            Self::ChatNotification(event) => event.chat_id,
            Self::ChatListRefresh(event) => event.chat_id,
        }
    }

    /// Whether `user_id` is among the users an audience-scoped event is addressed to.
    #[must_use]
    pub fn addresses(&self, user_id: Uuid) -> bool {
        match self {
            Self::ChatCreated(chat) => chat.is_participant(user_id),
            Self::ChatNotification(event) => event.recipients.contains(&user_id),
            Self::ChatListRefresh(event) => event.user_ids.contains(&user_id),
            Self::UnreadCounterChanged(counter) => counter.user_id == user_id,
            _ => false,
        }
    }

    /// The user whose action produced the event, when the event carries one.
    #[must_use]
    pub fn originator(&self) -> Option<Uuid> {
        match self {
            Self::MessageCreated(message) | Self::MessageUpdated(message) => {
                Some(message.sender_id)
            }
            Self::MessageDeleted(event) => Some(event.sender_id),
            Self::ReadReceiptCreated(event) => Some(event.receipt.user_id),
            Self::ChatNotification(event) => Some(event.sender_id),
            _ => None,
        }
    }
}

/// What actually travels over the broker.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, ToSchema)]
pub struct EventEnvelope {
    pub event_id: Uuid,
    pub topic: Topic,
    /// Instance id of the publishing process.
    pub origin: String,
    pub published_at: Timestamp,
    pub payload: EventPayload,
}

impl EventEnvelope {
    #[must_use]
    pub fn new(origin: impl Into<String>, payload: EventPayload) -> Self {
        Self {
            event_id: Uuid::new_v4(),
            topic: payload.topic(),
            origin: origin.into(),
            published_at: Timestamp::now(),
            payload,
        }
    }

    /// An envelope is consistent when its routing topic matches its payload.
    #[must_use]
    pub fn is_consistent(&self) -> bool {
        self.topic == self.payload.topic()
    }
}

/// Bounded window of recently seen event ids used to absorb redeliveries.
#[derive(Debug, Clone)]
pub struct RecentEventIds {
    capacity: usize,
    order: VecDeque<Uuid>,
    seen: HashSet<Uuid>,
}

impl RecentEventIds {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            order: VecDeque::with_capacity(capacity),
            seen: HashSet::with_capacity(capacity),
        }
    }

    /// Records `event_id`. Returns `false` when it was already in the window.
    pub fn insert(&mut self, event_id: Uuid) -> bool {
        if !self.seen.insert(event_id) {
            return false;
        }
        self.order.push_back(event_id);
        if self.order.len() > self.capacity
            && let Some(evicted) = self.order.pop_front()
        {
            self.seen.remove(&evicted);
        }
        true
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.order.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}
