//! Transactional chat store.
//!
//! Every mutating method is one transaction: authorization, the write and its
//! derived unread-counter / read-receipt side effects either all commit or
//! none do. Counter mutations are atomic per (chat, user) key.

use std::sync::Arc;

use async_trait::async_trait;
use shared::{
    config::server::{Backend, Config},
    models::{Chat, ChatSummary, MarkReadOutcome, Message, ReadReceipt, Timestamp, UnreadCounter},
};
use sqlx::error::ErrorKind;
use thiserror::Error;
use uuid::Uuid;

pub mod memory;
pub mod postgres;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("forbidden: {0}")]
    Forbidden(String),
    #[error("validation error: {0}")]
    Validation(String),
    #[error("store unavailable: {0}")]
    Unavailable(#[source] sqlx::Error),
    #[error(transparent)]
    Unexpected(#[from] anyhow::Error),
}

/// Constraint violations describe the request, not the database's health:
/// a dangling reference means the row was removed by a concurrent command.
impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        if let sqlx::Error::Database(db_err) = &err {
            let constraint = db_err.constraint().unwrap_or("unnamed constraint");
            match db_err.kind() {
                ErrorKind::ForeignKeyViolation => {
                    return Self::NotFound(format!(
                        "referenced row no longer exists ({constraint})"
                    ));
                }
                ErrorKind::UniqueViolation => {
                    return Self::Validation(format!("duplicate key ({constraint})"));
                }
                _ => {}
            }
        }
        Self::Unavailable(err)
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

#[derive(Debug, Clone)]
pub struct NewChat {
    pub id: Uuid,
    pub name: String,
    pub participants: Vec<Uuid>,
    pub created_at: Timestamp,
}

#[derive(Debug, Clone)]
pub struct NewMessage {
    pub id: Uuid,
    pub chat_id: Uuid,
    pub sender_id: Uuid,
    pub content: String,
    pub created_at: Timestamp,
}

/// A persisted message together with the counters its insert incremented.
#[derive(Debug, Clone)]
pub struct MessagePosted {
    pub message: Message,
    pub chat: Chat,
    pub counters: Vec<UnreadCounter>,
}

#[derive(Debug, Clone)]
pub struct MessageRemoved {
    pub message: Message,
    pub chat: Chat,
}

#[derive(Debug, Clone)]
pub struct ReadMarked {
    pub outcome: MarkReadOutcome,
    pub message: Message,
    pub chat: Chat,
    /// Distinct non-sender participants holding a receipt after the write.
    pub read_by_count: usize,
}

#[derive(Debug, Clone)]
pub struct ParticipantsAdded {
    pub chat: Chat,
    pub added: Vec<Uuid>,
}

#[async_trait]
pub trait ChatStore: Send + Sync {
    async fn create_chat(&self, chat: NewChat) -> StoreResult<Chat>;

    /// Adds the users not yet present. Fails with `Validation` when the chat
    /// would end up with more than `max_participants` members.
    async fn add_participants(
        &self,
        chat_id: Uuid,
        user_ids: &[Uuid],
        max_participants: usize,
    ) -> StoreResult<ParticipantsAdded>;

    /// Inserts the message and increments the counter of every participant
    /// except the sender.
    async fn insert_message(&self, message: NewMessage) -> StoreResult<MessagePosted>;
    async fn update_message(
        &self,
        message_id: Uuid,
        editor_id: Uuid,
        content: &str,
        edited_at: Timestamp,
    ) -> StoreResult<Message>;
    async fn delete_message(&self, message_id: Uuid, requester_id: Uuid)
    -> StoreResult<MessageRemoved>;

    /// Inserts the receipt if missing and, only when it was created, resets
    /// the reader's counter for the chat if it is above zero.
    async fn mark_read(
        &self,
        message_id: Uuid,
        user_id: Uuid,
        read_at: Timestamp,
    ) -> StoreResult<ReadMarked>;

    async fn get_chat(&self, chat_id: Uuid) -> StoreResult<Chat>;
    async fn get_message(&self, message_id: Uuid) -> StoreResult<Message>;
    async fn list_messages(&self, chat_id: Uuid) -> StoreResult<Vec<Message>>;
    async fn list_chats_for_user(&self, user_id: Uuid) -> StoreResult<Vec<ChatSummary>>;
    async fn list_receipts(&self, message_id: Uuid) -> StoreResult<Vec<ReadReceipt>>;
    async fn unread_counters(&self, user_id: Uuid) -> StoreResult<Vec<UnreadCounter>>;

    async fn health_check(&self) -> StoreResult<()>;
    fn backend_name(&self) -> &'static str;
}

pub type SharedStore = Arc<dyn ChatStore>;

/// Builds the configured store. Postgres pools are created (and bootstrapped)
/// by the caller and handed in.
pub fn build_store(config: &Config, pool: Option<sqlx::PgPool>) -> StoreResult<SharedStore> {
    match (config.store.backend, pool) {
        (Backend::Memory, _) => Ok(Arc::new(memory::MemoryChatStore::new())),
        (Backend::Postgres, Some(pool)) => Ok(Arc::new(postgres::PgChatStore::new(pool))),
        (Backend::Postgres, None) => Err(StoreError::Unexpected(anyhow::anyhow!(
            "postgres store selected without a database pool"
        ))),
    }
}

pub(crate) fn chat_not_found(chat_id: Uuid) -> StoreError {
    StoreError::NotFound(format!("chat {chat_id}"))
}

pub(crate) fn message_not_found(message_id: Uuid) -> StoreError {
    StoreError::NotFound(format!("message {message_id}"))
}

/// Participation rule shared by every backend for message operations.
pub(crate) fn ensure_can_post(chat: &Chat, user_id: Uuid) -> StoreResult<()> {
    if !chat.active {
        return Err(StoreError::Forbidden(format!("chat {} is inactive", chat.id)));
    }
    if !chat.is_participant(user_id) {
        return Err(StoreError::Forbidden(format!(
            "user {user_id} is not a participant of chat {}",
            chat.id
        )));
    }
    Ok(())
}

pub(crate) fn ensure_capacity(chat: &Chat, joining: usize, max: usize) -> StoreResult<()> {
    let total = chat.participant_count() + joining;
    if total > max {
        return Err(StoreError::Validation(format!(
            "chat {} would have {total} participants, limit is {max}",
            chat.id
        )));
    }
    Ok(())
}

pub(crate) fn ensure_sender(message: &Message, user_id: Uuid) -> StoreResult<()> {
    if message.sender_id == user_id {
        Ok(())
    } else {
        Err(StoreError::Forbidden(format!(
            "only the sender may modify message {}",
            message.id
        )))
    }
}
