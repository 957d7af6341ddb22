use std::fmt;

use metrics::counter;
use shared::models::{ChatSummary, Message, Query, QueryOutcome, ReadStatus, UnreadCounter};
use thiserror::Error;
use tracing::instrument;
use uuid::Uuid;

use crate::store::{SharedStore, StoreError};

#[derive(Debug, Error)]
pub enum QueryServiceError {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("store unavailable: {0}")]
    Unavailable(#[source] sqlx::Error),
    #[error(transparent)]
    Unexpected(anyhow::Error),
}

impl From<StoreError> for QueryServiceError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(message) => Self::NotFound(message),
            StoreError::Unavailable(source) => Self::Unavailable(source),
            StoreError::Unexpected(source) => Self::Unexpected(source),
            StoreError::Forbidden(message) | StoreError::Validation(message) => {
                Self::Unexpected(anyhow::anyhow!(message))
            }
        }
    }
}

pub type QueryServiceResult<T> = Result<T, QueryServiceError>;

/// Read side. Stateless over the store; never mutates it.
#[derive(Clone)]
pub struct QueryService {
    store: SharedStore,
}

impl fmt::Debug for QueryService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueryService")
            .field("store", &self.store.backend_name())
            .finish()
    }
}

impl QueryService {
    pub fn new(store: SharedStore) -> Self {
        Self { store }
    }

    pub async fn execute(&self, query: Query) -> QueryServiceResult<QueryOutcome> {
        let name = query.name();
        let result = match query {
            Query::ListMessages { chat_id } => self
                .list_messages(chat_id)
                .await
                .map(QueryOutcome::Messages),
            Query::ListChatsForUser { user_id } => self
                .list_chats_for_user(user_id)
                .await
                .map(QueryOutcome::Chats),
            Query::GetReadStatus { message_id } => self
                .get_read_status(message_id)
                .await
                .map(QueryOutcome::ReadStatus),
            Query::GetUnreadCounts { user_id } => self
                .get_unread_counts(user_id)
                .await
                .map(QueryOutcome::UnreadCounts),
        };

        let status = match &result {
            Ok(_) => "ok",
            Err(QueryServiceError::NotFound(_)) => "not_found",
            Err(QueryServiceError::Unavailable(_)) => "unavailable",
            Err(QueryServiceError::Unexpected(_)) => "error",
        };
        counter!("chat_queries_total", "query" => name, "status" => status).increment(1);
        result
    }

    /// Messages of a chat ordered by `(created_at, id)`.
    #[instrument(name = "query.list_messages", skip(self), err)]
    pub async fn list_messages(&self, chat_id: Uuid) -> QueryServiceResult<Vec<Message>> {
        Ok(self.store.list_messages(chat_id).await?)
    }

    #[instrument(name = "query.list_chats_for_user", skip(self), err)]
    pub async fn list_chats_for_user(&self, user_id: Uuid) -> QueryServiceResult<Vec<ChatSummary>> {
        Ok(self.store.list_chats_for_user(user_id).await?)
    }

    #[instrument(name = "query.get_read_status", skip(self), err)]
    pub async fn get_read_status(&self, message_id: Uuid) -> QueryServiceResult<ReadStatus> {
        let message = self.store.get_message(message_id).await?;
        let chat = self.store.get_chat(message.chat_id).await?;
        let receipts = self.store.list_receipts(message_id).await?;
        Ok(ReadStatus::from_parts(&message, &chat, receipts))
    }

    /// Current counters for every chat the user has one in. Chats with no
    /// counter row have never had an unread message and count as zero.
    #[instrument(name = "query.get_unread_counts", skip(self), err)]
    pub async fn get_unread_counts(&self, user_id: Uuid) -> QueryServiceResult<Vec<UnreadCounter>> {
        Ok(self.store.unread_counters(user_id).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{ChatStore, NewChat, NewMessage, memory::MemoryChatStore};
    use shared::models::Timestamp;
    use std::sync::Arc;

    async fn seeded() -> (QueryService, Arc<MemoryChatStore>, [Uuid; 3], Uuid, Uuid) {
        let store = Arc::new(MemoryChatStore::new());
        let users = [Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4()];
        let chat = store
            .create_chat(NewChat {
                id: Uuid::new_v4(),
                name: "room".into(),
                participants: users.to_vec(),
                created_at: Timestamp::now(),
            })
            .await
            .unwrap();
        let posted = store
            .insert_message(NewMessage {
                id: Uuid::new_v4(),
                chat_id: chat.id,
                sender_id: users[0],
                content: "hello".into(),
                created_at: Timestamp::now(),
            })
            .await
            .unwrap();
        (
            QueryService::new(store.clone()),
            store,
            users,
            chat.id,
            posted.message.id,
        )
    }

    #[tokio::test]
    async fn read_status_becomes_fully_read_after_all_recipients() {
        let (queries, store, users, _, message_id) = seeded().await;

        store
            .mark_read(message_id, users[1], Timestamp::now())
            .await
            .unwrap();
        let partial = queries.get_read_status(message_id).await.unwrap();
        assert_eq!(partial.read_by_count, 1);
        assert!(!partial.fully_read);

        store
            .mark_read(message_id, users[2], Timestamp::now())
            .await
            .unwrap();
        let full = queries.get_read_status(message_id).await.unwrap();
        assert_eq!(full.read_by_count, 2);
        assert_eq!(full.participant_count, 3);
        assert!(full.fully_read);
    }

    #[tokio::test]
    async fn chat_list_carries_unread_counts() {
        let (queries, _, users, chat_id, _) = seeded().await;

        let chats = queries.list_chats_for_user(users[1]).await.unwrap();
        assert_eq!(chats.len(), 1);
        assert_eq!(chats[0].chat.id, chat_id);
        assert_eq!(chats[0].unread_count, 1);

        let sender_view = queries.list_chats_for_user(users[0]).await.unwrap();
        assert_eq!(sender_view[0].unread_count, 0);
    }

    #[tokio::test]
    async fn execute_maps_missing_entities() {
        let (queries, _, _, _, _) = seeded().await;
        let err = queries
            .execute(Query::GetReadStatus {
                message_id: Uuid::new_v4(),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, QueryServiceError::NotFound(_)));

        let outcome = queries
            .execute(Query::ListChatsForUser {
                user_id: Uuid::new_v4(),
            })
            .await
            .unwrap();
        assert_eq!(outcome, QueryOutcome::Chats(Vec::new()));
    }
}
