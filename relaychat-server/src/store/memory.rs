//! In-memory implementation of the chat store.
//!
//! All state sits behind one async mutex, so every method observes and
//! mutates a consistent snapshot; holding the lock for the whole method is
//! this backend's transaction. Nothing survives a restart and nothing is
//! shared between processes. Used for tests and single-process development.

use std::{
    collections::{BTreeSet, HashMap},
    sync::atomic::{AtomicBool, Ordering},
};

use async_trait::async_trait;
use shared::models::{
    Chat, ChatSummary, CounterTransition, MarkReadOutcome, Message, ReadReceipt, ReadState,
    Timestamp, UnreadCounter,
};
use tokio::sync::Mutex;
use uuid::Uuid;

use super::{
    ChatStore, MessagePosted, MessageRemoved, NewChat, NewMessage, ParticipantsAdded, ReadMarked,
    StoreError, StoreResult, chat_not_found, ensure_can_post, ensure_capacity, ensure_sender,
    message_not_found,
};

type PairKey = (Uuid, Uuid);

#[derive(Debug, Default)]
struct MemoryState {
    chats: HashMap<Uuid, Chat>,
    messages: HashMap<Uuid, Message>,
    /// Keyed by (message, user).
    receipts: HashMap<PairKey, ReadReceipt>,
    /// Keyed by (chat, user).
    counters: HashMap<PairKey, UnreadCounter>,
}

impl MemoryState {
    fn chat(&self, chat_id: Uuid) -> StoreResult<&Chat> {
        self.chats.get(&chat_id).ok_or_else(|| chat_not_found(chat_id))
    }

    fn message(&self, message_id: Uuid) -> StoreResult<&Message> {
        self.messages
            .get(&message_id)
            .ok_or_else(|| message_not_found(message_id))
    }

    fn read_state(&self, message_id: Uuid, user_id: Uuid) -> ReadState {
        if self.receipts.contains_key(&(message_id, user_id)) {
            ReadState::Read
        } else {
            ReadState::Unread
        }
    }

    fn transition_counter(
        &mut self,
        chat_id: Uuid,
        user_id: Uuid,
        transition: CounterTransition,
    ) -> Option<UnreadCounter> {
        let counter = self
            .counters
            .entry((chat_id, user_id))
            .or_insert_with(|| UnreadCounter::zero(chat_id, user_id));
        counter.apply(transition).then(|| counter.clone())
    }

    fn read_by_count(&self, message: &Message, chat: &Chat) -> usize {
        chat.recipients_of(message.sender_id)
            .filter(|user_id| self.receipts.contains_key(&(message.id, *user_id)))
            .count()
    }
}

#[derive(Debug, Default)]
pub struct MemoryChatStore {
    state: Mutex<MemoryState>,
    offline: AtomicBool,
}

impl MemoryChatStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulates losing the store: every call fails with `Unavailable` until
    /// brought back online.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    fn ensure_online(&self) -> StoreResult<()> {
        if self.offline.load(Ordering::SeqCst) {
            Err(StoreError::Unavailable(sqlx::Error::PoolTimedOut))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl ChatStore for MemoryChatStore {
    async fn create_chat(&self, chat: NewChat) -> StoreResult<Chat> {
        self.ensure_online()?;
        if chat.participants.is_empty() {
            return Err(StoreError::Validation(
                "a chat needs at least one participant".into(),
            ));
        }

        let mut state = self.state.lock().await;
        let created = Chat {
            id: chat.id,
            name: chat.name,
            participants: chat.participants.into_iter().collect(),
            active: true,
            created_at: chat.created_at,
        };
        state.chats.insert(created.id, created.clone());
        Ok(created)
    }

    async fn add_participants(
        &self,
        chat_id: Uuid,
        user_ids: &[Uuid],
        max_participants: usize,
    ) -> StoreResult<ParticipantsAdded> {
        self.ensure_online()?;
        let mut state = self.state.lock().await;
        let chat = state
            .chats
            .get_mut(&chat_id)
            .ok_or_else(|| chat_not_found(chat_id))?;

        let joining: BTreeSet<Uuid> = user_ids
            .iter()
            .copied()
            .filter(|user_id| !chat.is_participant(*user_id))
            .collect();
        ensure_capacity(chat, joining.len(), max_participants)?;

        let added: Vec<Uuid> = joining.into_iter().collect();
        chat.participants.extend(added.iter().copied());

        Ok(ParticipantsAdded {
            chat: chat.clone(),
            added,
        })
    }

    async fn insert_message(&self, message: NewMessage) -> StoreResult<MessagePosted> {
        self.ensure_online()?;
        let mut state = self.state.lock().await;
        let chat = state.chat(message.chat_id)?.clone();
        ensure_can_post(&chat, message.sender_id)?;

        let stored = Message {
            id: message.id,
            chat_id: message.chat_id,
            sender_id: message.sender_id,
            content: message.content,
            created_at: message.created_at,
            edited: false,
            edited_at: None,
        };
        state.messages.insert(stored.id, stored.clone());

        let counters = chat
            .recipients_of(stored.sender_id)
            .filter_map(|recipient| {
                state.transition_counter(chat.id, recipient, CounterTransition::Increment)
            })
            .collect();

        Ok(MessagePosted {
            message: stored,
            chat,
            counters,
        })
    }

    async fn update_message(
        &self,
        message_id: Uuid,
        editor_id: Uuid,
        content: &str,
        edited_at: Timestamp,
    ) -> StoreResult<Message> {
        self.ensure_online()?;
        let mut state = self.state.lock().await;
        let message = state
            .messages
            .get_mut(&message_id)
            .ok_or_else(|| message_not_found(message_id))?;
        ensure_sender(message, editor_id)?;

        message.content = content.to_string();
        message.edited = true;
        message.edited_at = Some(edited_at);
        Ok(message.clone())
    }

    async fn delete_message(
        &self,
        message_id: Uuid,
        requester_id: Uuid,
    ) -> StoreResult<MessageRemoved> {
        self.ensure_online()?;
        let mut state = self.state.lock().await;
        ensure_sender(state.message(message_id)?, requester_id)?;

        let message = state
            .messages
            .remove(&message_id)
            .ok_or_else(|| message_not_found(message_id))?;
        state.receipts.retain(|(receipt_message, _), _| *receipt_message != message_id);
        let chat = state.chat(message.chat_id)?.clone();

        Ok(MessageRemoved { message, chat })
    }

    async fn mark_read(
        &self,
        message_id: Uuid,
        user_id: Uuid,
        read_at: Timestamp,
    ) -> StoreResult<ReadMarked> {
        self.ensure_online()?;
        let mut state = self.state.lock().await;
        let message = state.message(message_id)?.clone();
        let chat = state.chat(message.chat_id)?.clone();
        if !chat.is_participant(user_id) {
            return Err(StoreError::Forbidden(format!(
                "user {user_id} is not a participant of chat {}",
                chat.id
            )));
        }

        if message.sender_id == user_id {
            let read_by_count = state.read_by_count(&message, &chat);
            return Ok(ReadMarked {
                outcome: MarkReadOutcome {
                    receipt: None,
                    created: false,
                    reset_counter: None,
                },
                message,
                chat,
                read_by_count,
            });
        }

        let (_, created) = state.read_state(message_id, user_id).mark_read();
        let receipt = state
            .receipts
            .entry((message_id, user_id))
            .or_insert_with(|| ReadReceipt {
                message_id,
                chat_id: chat.id,
                user_id,
                read_at,
            })
            .clone();

        let reset_counter = if created {
            state.transition_counter(chat.id, user_id, CounterTransition::ResetToZero)
        } else {
            None
        };
        let read_by_count = state.read_by_count(&message, &chat);

        Ok(ReadMarked {
            outcome: MarkReadOutcome {
                receipt: Some(receipt),
                created,
                reset_counter,
            },
            message,
            chat,
            read_by_count,
        })
    }

    async fn get_chat(&self, chat_id: Uuid) -> StoreResult<Chat> {
        self.ensure_online()?;
        let state = self.state.lock().await;
        state.chat(chat_id).cloned()
    }

    async fn get_message(&self, message_id: Uuid) -> StoreResult<Message> {
        self.ensure_online()?;
        let state = self.state.lock().await;
        state.message(message_id).cloned()
    }

    async fn list_messages(&self, chat_id: Uuid) -> StoreResult<Vec<Message>> {
        self.ensure_online()?;
        let state = self.state.lock().await;
        state.chat(chat_id)?;

        let mut messages: Vec<Message> = state
            .messages
            .values()
            .filter(|message| message.chat_id == chat_id)
            .cloned()
            .collect();
        messages.sort_by_key(Message::ordering_key);
        Ok(messages)
    }

    async fn list_chats_for_user(&self, user_id: Uuid) -> StoreResult<Vec<ChatSummary>> {
        self.ensure_online()?;
        let state = self.state.lock().await;

        let mut summaries: Vec<ChatSummary> = state
            .chats
            .values()
            .filter(|chat| chat.is_participant(user_id))
            .map(|chat| ChatSummary {
                chat: chat.clone(),
                unread_count: state
                    .counters
                    .get(&(chat.id, user_id))
                    .map_or(0, |counter| counter.count),
                last_message_at: state
                    .messages
                    .values()
                    .filter(|message| message.chat_id == chat.id)
                    .map(|message| message.created_at)
                    .max(),
            })
            .collect();
        summaries.sort_by(|a, b| {
            b.last_message_at
                .cmp(&a.last_message_at)
                .then_with(|| b.chat.created_at.cmp(&a.chat.created_at))
        });
        Ok(summaries)
    }

    async fn list_receipts(&self, message_id: Uuid) -> StoreResult<Vec<ReadReceipt>> {
        self.ensure_online()?;
        let state = self.state.lock().await;
        state.message(message_id)?;

        let mut receipts: Vec<ReadReceipt> = state
            .receipts
            .values()
            .filter(|receipt| receipt.message_id == message_id)
            .cloned()
            .collect();
        receipts.sort_by_key(|receipt| (receipt.read_at, receipt.user_id));
        Ok(receipts)
    }

    async fn unread_counters(&self, user_id: Uuid) -> StoreResult<Vec<UnreadCounter>> {
        self.ensure_online()?;
        let state = self.state.lock().await;

        let mut counters: Vec<UnreadCounter> = state
            .counters
            .values()
            .filter(|counter| counter.user_id == user_id)
            .cloned()
            .collect();
        counters.sort_by_key(|counter| counter.chat_id);
        Ok(counters)
    }

    async fn health_check(&self) -> StoreResult<()> {
        self.ensure_online()
    }

    fn backend_name(&self) -> &'static str {
        "memory"
    }
}
