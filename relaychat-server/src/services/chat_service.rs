use std::{collections::BTreeSet, fmt};

use metrics::counter;
use shared::{
    config::server::LimitsConfig,
    models::{
        Chat, ChatListRefreshEvent, ChatNotificationEvent, ChatUpdatedEvent, Command,
        CommandOutcome, EventPayload, MarkReadOutcome, Message, MessageDeleted,
        MessageDeletedEvent, NOTIFICATION_PREVIEW_CHARS, ReadReceiptCreatedEvent, RefreshReason,
        Timestamp, encoded_len, is_fully_read,
    },
};
use thiserror::Error;
use tracing::{debug, instrument};
use uuid::Uuid;

use crate::{
    services::publisher::EventPublisher,
    store::{NewChat, NewMessage, SharedStore, StoreError},
};

#[derive(Debug, Error)]
pub enum ChatServiceError {
    #[error("validation error: {0}")]
    Validation(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("forbidden: {0}")]
    Forbidden(String),
    #[error("store unavailable: {0}")]
    Unavailable(#[source] sqlx::Error),
    #[error(transparent)]
    Unexpected(anyhow::Error),
}

impl ChatServiceError {
    const fn status_label(&self) -> &'static str {
        match self {
            Self::Validation(_) => "invalid",
            Self::NotFound(_) => "not_found",
            Self::Forbidden(_) => "forbidden",
            Self::Unavailable(_) => "unavailable",
            Self::Unexpected(_) => "error",
        }
    }
}

impl From<StoreError> for ChatServiceError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(message) => Self::NotFound(message),
            StoreError::Forbidden(message) => Self::Forbidden(message),
            StoreError::Validation(message) => Self::Validation(message),
            StoreError::Unavailable(source) => Self::Unavailable(source),
            StoreError::Unexpected(source) => Self::Unexpected(source),
        }
    }
}

pub type ChatServiceResult<T> = Result<T, ChatServiceError>;

/// Write side. Each command authorizes and persists in one store transaction,
/// then publishes the events the committed state implies. Nothing is published
/// when the transaction fails.
///
/// Input is bounded by [`LimitsConfig`] before anything is written, so every
/// committed change produces events small enough for the broker.
#[derive(Clone)]
pub struct ChatService {
    store: SharedStore,
    publisher: EventPublisher,
    limits: LimitsConfig,
}

impl fmt::Debug for ChatService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChatService")
            .field("store", &self.store.backend_name())
            .field("publisher", &self.publisher)
            .field("limits", &self.limits)
            .finish()
    }
}

impl ChatService {
    pub fn new(store: SharedStore, publisher: EventPublisher) -> Self {
        Self {
            store,
            publisher,
            limits: LimitsConfig::default(),
        }
    }

    #[must_use]
    pub fn with_limits(mut self, limits: LimitsConfig) -> Self {
        self.limits = limits;
        self
    }

    /// Dispatches a command to its handler.
    pub async fn execute(&self, command: Command) -> ChatServiceResult<CommandOutcome> {
        let name = command.name();
        let result = match command {
            Command::SendMessage {
                chat_id,
                sender_id,
                content,
            } => self
                .send_message(chat_id, sender_id, content)
                .await
                .map(CommandOutcome::Message),
            Command::EditMessage {
                message_id,
                sender_id,
                content,
            } => self
                .edit_message(message_id, sender_id, content)
                .await
                .map(CommandOutcome::Message),
            Command::DeleteMessage {
                message_id,
                sender_id,
            } => self
                .delete_message(message_id, sender_id)
                .await
                .map(CommandOutcome::MessageDeleted),
            Command::MarkAsRead {
                message_id,
                user_id,
            } => self
                .mark_as_read(message_id, user_id)
                .await
                .map(CommandOutcome::MarkedRead),
            Command::CreateChat {
                name,
                participant_ids,
            } => self
                .create_chat(name, participant_ids)
                .await
                .map(CommandOutcome::Chat),
            Command::AddParticipants { chat_id, user_ids } => self
                .add_participants(chat_id, user_ids)
                .await
                .map(CommandOutcome::Chat),
        };

        let status = result.as_ref().map_or_else(|err| err.status_label(), |_| "ok");
        counter!("chat_commands_total", "command" => name, "status" => status).increment(1);
        result
    }

    #[instrument(name = "chat.send_message", skip(self, content), err)]
    pub async fn send_message(
        &self,
        chat_id: Uuid,
        sender_id: Uuid,
        content: String,
    ) -> ChatServiceResult<Message> {
        self.check_content(&content)?;

        let posted = self
            .store
            .insert_message(NewMessage {
                id: Uuid::new_v4(),
                chat_id,
                sender_id,
                content,
                created_at: Timestamp::now(),
            })
            .await?;

        let recipients: Vec<Uuid> = posted.chat.recipients_of(sender_id).collect();
        let mut events = Vec::with_capacity(posted.counters.len() + 3);
        events.push(EventPayload::MessageCreated(posted.message.clone()));
        events.extend(
            posted
                .counters
                .into_iter()
                .map(EventPayload::UnreadCounterChanged),
        );
        if !recipients.is_empty() {
            events.push(EventPayload::ChatNotification(ChatNotificationEvent {
                chat_id,
                message_id: posted.message.id,
                sender_id,
                recipients,
                preview: preview(&posted.message.content),
            }));
        }
        events.push(refresh(&posted.chat, RefreshReason::MessageCreated));

        self.publisher.publish_all(events).await;
        Ok(posted.message)
    }

    #[instrument(name = "chat.edit_message", skip(self, content), err)]
    pub async fn edit_message(
        &self,
        message_id: Uuid,
        sender_id: Uuid,
        content: String,
    ) -> ChatServiceResult<Message> {
        self.check_content(&content)?;

        let message = self
            .store
            .update_message(message_id, sender_id, &content, Timestamp::now())
            .await?;
        let chat = self.store.get_chat(message.chat_id).await?;

        self.publisher
            .publish_all(vec![
                EventPayload::MessageUpdated(message.clone()),
                refresh(&chat, RefreshReason::MessageUpdated),
            ])
            .await;
        Ok(message)
    }

    #[instrument(name = "chat.delete_message", skip(self), err)]
    pub async fn delete_message(
        &self,
        message_id: Uuid,
        sender_id: Uuid,
    ) -> ChatServiceResult<MessageDeleted> {
        let removed = self.store.delete_message(message_id, sender_id).await?;

        self.publisher
            .publish_all(vec![
                EventPayload::MessageDeleted(MessageDeletedEvent {
                    message_id,
                    chat_id: removed.chat.id,
                    sender_id: removed.message.sender_id,
                    deleted_at: Timestamp::now(),
                }),
                refresh(&removed.chat, RefreshReason::MessageDeleted),
            ])
            .await;

        Ok(MessageDeleted {
            message_id,
            chat_id: removed.chat.id,
        })
    }

    /// Idempotent: repeating the call for the same (message, user) returns
    /// the original receipt and publishes nothing.
    #[instrument(name = "chat.mark_as_read", skip(self), err)]
    pub async fn mark_as_read(
        &self,
        message_id: Uuid,
        user_id: Uuid,
    ) -> ChatServiceResult<MarkReadOutcome> {
        let marked = self
            .store
            .mark_read(message_id, user_id, Timestamp::now())
            .await?;

        let mut events = Vec::with_capacity(2);
        if marked.outcome.created
            && let Some(receipt) = marked.outcome.receipt.clone()
        {
            let participant_count = marked.chat.participant_count();
            events.push(EventPayload::ReadReceiptCreated(ReadReceiptCreatedEvent {
                receipt,
                sender_id: marked.message.sender_id,
                read_by_count: marked.read_by_count,
                participant_count,
                fully_read: is_fully_read(marked.read_by_count, participant_count),
            }));
        }
        if let Some(counter) = marked.outcome.reset_counter.clone() {
            events.push(EventPayload::UnreadCounterChanged(counter));
        }

        if events.is_empty() {
            debug!(%message_id, %user_id, "mark as read changed nothing");
        } else {
            self.publisher.publish_all(events).await;
        }
        Ok(marked.outcome)
    }

    #[instrument(name = "chat.create_chat", skip(self), err)]
    pub async fn create_chat(
        &self,
        name: String,
        participant_ids: Vec<Uuid>,
    ) -> ChatServiceResult<Chat> {
        if participant_ids.is_empty() {
            return Err(ChatServiceError::Validation(
                "participant_ids must not be empty".into(),
            ));
        }
        let name_bytes = encoded_len(&name);
        if name_bytes > self.limits.max_chat_name_bytes {
            return Err(ChatServiceError::Validation(format!(
                "chat name is {name_bytes} bytes encoded, limit is {}",
                self.limits.max_chat_name_bytes
            )));
        }
        let distinct = participant_ids.iter().collect::<BTreeSet<_>>().len();
        if distinct > self.limits.max_participants {
            return Err(ChatServiceError::Validation(format!(
                "{distinct} participants requested, limit is {}",
                self.limits.max_participants
            )));
        }

        let chat = self
            .store
            .create_chat(NewChat {
                id: Uuid::new_v4(),
                name,
                participants: participant_ids,
                created_at: Timestamp::now(),
            })
            .await?;

        self.publisher
            .publish_all(vec![
                EventPayload::ChatCreated(chat.clone()),
                refresh(&chat, RefreshReason::ChatCreated),
            ])
            .await;
        Ok(chat)
    }

    #[instrument(name = "chat.add_participants", skip(self), err)]
    pub async fn add_participants(
        &self,
        chat_id: Uuid,
        user_ids: Vec<Uuid>,
    ) -> ChatServiceResult<Chat> {
        if user_ids.is_empty() {
            return Err(ChatServiceError::Validation(
                "user_ids must not be empty".into(),
            ));
        }

        let added = self
            .store
            .add_participants(chat_id, &user_ids, self.limits.max_participants)
            .await?;
        if added.added.is_empty() {
            debug!(%chat_id, "participants already present");
            return Ok(added.chat);
        }

        self.publisher
            .publish_all(vec![
                EventPayload::ChatUpdated(ChatUpdatedEvent {
                    chat: added.chat.clone(),
                    added_user_ids: added.added,
                }),
                refresh(&added.chat, RefreshReason::ParticipantsAdded),
            ])
            .await;
        Ok(added.chat)
    }
}

impl ChatService {
    fn check_content(&self, content: &str) -> ChatServiceResult<()> {
        if content.trim().is_empty() {
            return Err(ChatServiceError::Validation(
                "content must not be empty".into(),
            ));
        }
        let bytes = encoded_len(content);
        if bytes > self.limits.max_content_bytes {
            return Err(ChatServiceError::Validation(format!(
                "content is {bytes} bytes encoded, limit is {}",
                self.limits.max_content_bytes
            )));
        }
        Ok(())
    }
}

fn preview(content: &str) -> String {
    content.chars().take(NOTIFICATION_PREVIEW_CHARS).collect()
}

fn refresh(chat: &Chat, reason: RefreshReason) -> EventPayload {
    EventPayload::ChatListRefresh(ChatListRefreshEvent {
        chat_id: chat.id,
        user_ids: chat.participants.iter().copied().collect(),
        reason,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        broker::{BrokerError, MockBrokerPublisher, memory::MemoryBroker},
        store::{ChatStore, memory::MemoryChatStore},
    };
    use shared::models::Topic;
    use std::sync::{Arc, Mutex};

    /// Records the topics the service publishes, in order.
    fn recording_publisher() -> (EventPublisher, Arc<Mutex<Vec<Topic>>>) {
        let topics = Arc::new(Mutex::new(Vec::new()));
        let seen = Arc::clone(&topics);
        let mut broker = MockBrokerPublisher::new();
        broker.expect_publish().returning(move |topic, _| {
            seen.lock().unwrap().push(topic);
            Ok(())
        });
        (EventPublisher::new(Arc::new(broker), "test"), topics)
    }

    fn service_with(publisher: EventPublisher) -> (ChatService, Arc<MemoryChatStore>) {
        let store = Arc::new(MemoryChatStore::new());
        (ChatService::new(store.clone(), publisher), store)
    }

    #[tokio::test]
    async fn send_publishes_message_counters_notification_and_refresh() {
        let (publisher, topics) = recording_publisher();
        let (service, _) = service_with(publisher);
        let (u1, u2, u3) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
        let chat = service
            .create_chat("room".into(), vec![u1, u2, u3])
            .await
            .unwrap();
        topics.lock().unwrap().clear();

        service
            .send_message(chat.id, u1, "hello".into())
            .await
            .unwrap();

        assert_eq!(
            *topics.lock().unwrap(),
            vec![
                Topic::MessageCreated,
                Topic::UnreadCounterChanged,
                Topic::UnreadCounterChanged,
                Topic::ChatNotification,
                Topic::ChatListRefresh,
            ]
        );
    }

    #[tokio::test]
    async fn repeated_mark_as_read_publishes_once() {
        let (publisher, topics) = recording_publisher();
        let (service, _) = service_with(publisher);
        let (u1, u2) = (Uuid::new_v4(), Uuid::new_v4());
        let chat = service.create_chat("dm".into(), vec![u1, u2]).await.unwrap();
        let message = service
            .send_message(chat.id, u1, "ping".into())
            .await
            .unwrap();
        topics.lock().unwrap().clear();

        let first = service.mark_as_read(message.id, u2).await.unwrap();
        let second = service.mark_as_read(message.id, u2).await.unwrap();

        assert!(first.created);
        assert!(!second.created);
        assert_eq!(first.receipt, second.receipt);
        assert_eq!(
            *topics.lock().unwrap(),
            vec![Topic::ReadReceiptCreated, Topic::UnreadCounterChanged]
        );
    }

    #[tokio::test]
    async fn rejected_commands_publish_nothing() {
        let (publisher, topics) = recording_publisher();
        let (service, _) = service_with(publisher);
        let (u1, outsider) = (Uuid::new_v4(), Uuid::new_v4());
        let chat = service.create_chat("solo".into(), vec![u1]).await.unwrap();
        topics.lock().unwrap().clear();

        let err = service
            .send_message(chat.id, outsider, "let me in".into())
            .await
            .unwrap_err();
        assert!(matches!(err, ChatServiceError::Forbidden(_)));

        let err = service
            .edit_message(Uuid::new_v4(), u1, "nope".into())
            .await
            .unwrap_err();
        assert!(matches!(err, ChatServiceError::NotFound(_)));
        assert!(topics.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn store_outage_fails_the_command_without_events() {
        let (publisher, topics) = recording_publisher();
        let (service, store) = service_with(publisher);
        store.set_offline(true);

        let err = service
            .create_chat("room".into(), vec![Uuid::new_v4()])
            .await
            .unwrap_err();
        assert!(matches!(err, ChatServiceError::Unavailable(_)));
        assert!(topics.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn broker_outage_keeps_the_write() {
        let broker = Arc::new(MemoryBroker::new(16));
        broker.set_unavailable(true);
        let (service, store) = service_with(EventPublisher::new(broker, "test"));
        let (u1, u2) = (Uuid::new_v4(), Uuid::new_v4());

        let chat = service.create_chat("dm".into(), vec![u1, u2]).await.unwrap();
        let message = service
            .send_message(chat.id, u1, "still saved".into())
            .await
            .unwrap();

        assert_eq!(store.list_messages(chat.id).await.unwrap(), vec![message]);
        assert_eq!(store.unread_counters(u2).await.unwrap()[0].count, 1);
    }

    #[tokio::test]
    async fn adding_existing_participants_is_silent() {
        let (publisher, topics) = recording_publisher();
        let (service, _) = service_with(publisher);
        let u1 = Uuid::new_v4();
        let chat = service.create_chat("room".into(), vec![u1]).await.unwrap();
        topics.lock().unwrap().clear();

        let unchanged = service.add_participants(chat.id, vec![u1]).await.unwrap();
        assert_eq!(unchanged.participants, chat.participants);
        assert!(topics.lock().unwrap().is_empty());

        let newcomer = Uuid::new_v4();
        let grown = service
            .add_participants(chat.id, vec![newcomer])
            .await
            .unwrap();
        assert!(grown.is_participant(newcomer));
        assert_eq!(
            *topics.lock().unwrap(),
            vec![Topic::ChatUpdated, Topic::ChatListRefresh]
        );
    }

    fn small_limits() -> LimitsConfig {
        LimitsConfig {
            max_content_bytes: 16,
            max_chat_name_bytes: 10,
            max_participants: 3,
        }
    }

    #[tokio::test]
    async fn oversized_input_is_rejected_before_any_write() {
        let (publisher, topics) = recording_publisher();
        let (service, store) = service_with(publisher);
        let service = service.with_limits(small_limits());
        let (u1, u2) = (Uuid::new_v4(), Uuid::new_v4());
        let chat = service.create_chat("dm".into(), vec![u1, u2]).await.unwrap();
        let message = service
            .send_message(chat.id, u1, "short".into())
            .await
            .unwrap();
        topics.lock().unwrap().clear();

        // 13 characters, but quotes and escapes push it past 16 bytes.
        let err = service
            .send_message(chat.id, u1, "say \"hi\" now".into())
            .await
            .unwrap_err();
        assert!(matches!(err, ChatServiceError::Validation(_)));
        let err = service
            .edit_message(message.id, u1, "x".repeat(15))
            .await
            .unwrap_err();
        assert!(matches!(err, ChatServiceError::Validation(_)));

        let err = service
            .create_chat("a much longer name".into(), vec![u1])
            .await
            .unwrap_err();
        assert!(matches!(err, ChatServiceError::Validation(_)));
        let crowd: Vec<Uuid> = (0..4).map(|_| Uuid::new_v4()).collect();
        let err = service
            .create_chat("big".into(), crowd)
            .await
            .unwrap_err();
        assert!(matches!(err, ChatServiceError::Validation(_)));

        assert_eq!(store.list_messages(chat.id).await.unwrap(), vec![message]);
        assert!(topics.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn participant_cap_counts_existing_members() {
        let (publisher, topics) = recording_publisher();
        let (service, _) = service_with(publisher);
        let service = service.with_limits(small_limits());
        let (u1, u2) = (Uuid::new_v4(), Uuid::new_v4());
        let chat = service.create_chat("room".into(), vec![u1, u2]).await.unwrap();
        topics.lock().unwrap().clear();

        let err = service
            .add_participants(chat.id, vec![Uuid::new_v4(), Uuid::new_v4()])
            .await
            .unwrap_err();
        assert!(matches!(err, ChatServiceError::Validation(_)));
        assert!(topics.lock().unwrap().is_empty());

        // Members already present do not count again.
        let third = Uuid::new_v4();
        let grown = service
            .add_participants(chat.id, vec![u1, u2, third])
            .await
            .unwrap();
        assert_eq!(grown.participant_count(), 3);
    }

    #[tokio::test]
    async fn largest_accepted_commands_fit_the_broker_budget() {
        let budget = shared::config::server::BrokerConfig::default().max_payload_bytes;
        let limits = LimitsConfig::default();
        let sizes = Arc::new(Mutex::new(Vec::new()));
        let seen = Arc::clone(&sizes);
        let mut broker = MockBrokerPublisher::new();
        broker.expect_publish().returning(move |topic, payload| {
            seen.lock().unwrap().push((topic, encoded_len(&payload)));
            Ok(())
        });
        let (service, _) = service_with(EventPublisher::new(Arc::new(broker), "writer-a"));
        let service = service.with_limits(limits.clone());

        let members: Vec<Uuid> = (0..limits.max_participants - 1)
            .map(|_| Uuid::new_v4())
            .collect();
        let sender = members[0];
        let chat = service
            .create_chat("n".repeat(limits.max_chat_name_bytes - 2), members)
            .await
            .unwrap();
        service
            .add_participants(chat.id, vec![Uuid::new_v4()])
            .await
            .unwrap();
        service
            .send_message(chat.id, sender, "\u{1}".repeat((limits.max_content_bytes - 2) / 6))
            .await
            .unwrap();

        let sizes = sizes.lock().unwrap();
        assert!(sizes.len() > limits.max_participants);
        for (topic, size) in sizes.iter() {
            assert!(*size <= budget, "{topic} event is {size} bytes");
        }
    }

    #[tokio::test]
    async fn edit_and_delete_publish_for_the_sender_only() {
        let (publisher, topics) = recording_publisher();
        let (service, store) = service_with(publisher);
        let (u1, u2) = (Uuid::new_v4(), Uuid::new_v4());
        let chat = service.create_chat("dm".into(), vec![u1, u2]).await.unwrap();
        let message = service
            .send_message(chat.id, u1, "draft".into())
            .await
            .unwrap();
        topics.lock().unwrap().clear();

        let err = service
            .edit_message(message.id, u2, "hijack".into())
            .await
            .unwrap_err();
        assert!(matches!(err, ChatServiceError::Forbidden(_)));

        let edited = service
            .edit_message(message.id, u1, "final".into())
            .await
            .unwrap();
        assert!(edited.edited);
        assert_eq!(edited.content, "final");

        let deleted = service.delete_message(message.id, u1).await.unwrap();
        assert_eq!(deleted.chat_id, chat.id);
        assert!(store.list_messages(chat.id).await.unwrap().is_empty());

        assert_eq!(
            *topics.lock().unwrap(),
            vec![
                Topic::MessageUpdated,
                Topic::ChatListRefresh,
                Topic::MessageDeleted,
                Topic::ChatListRefresh,
            ]
        );
    }

    #[tokio::test]
    async fn execute_routes_commands() {
        let mut broker = MockBrokerPublisher::new();
        broker
            .expect_publish()
            .returning(|_, _| Err(BrokerError::Closed));
        let (service, _) = service_with(EventPublisher::new(Arc::new(broker), "test"));

        let outcome = service
            .execute(Command::CreateChat {
                name: "room".into(),
                participant_ids: vec![Uuid::new_v4()],
            })
            .await
            .unwrap();
        assert!(matches!(outcome, CommandOutcome::Chat(_)));

        let err = service
            .execute(Command::SendMessage {
                chat_id: Uuid::new_v4(),
                sender_id: Uuid::new_v4(),
                content: "   ".into(),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, ChatServiceError::Validation(_)));
    }
}
