//! Client-side read model.
//!
//! Reconciles query snapshots with forwarded events. Events may arrive more
//! than once and in any order, so every apply is idempotent: messages are
//! keyed by id and ordered by creation time, deletes leave tombstones,
//! unread badges are replaced by the authoritative value and read ticks only
//! ever move towards "fully read".

use std::collections::{HashMap, HashSet};

use uuid::Uuid;

use crate::models::{
    Chat, ChatSummary, EventEnvelope, EventPayload, Message, ReadStatus, RecentEventIds,
    Timestamp,
};

const DEFAULT_EVENT_WINDOW: usize = 1024;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReadTick {
    pub read_by_count: usize,
    pub fully_read: bool,
}

#[derive(Debug, Default)]
struct ChatView {
    chat: Option<Chat>,
    messages: HashMap<Uuid, Message>,
    deleted: HashSet<Uuid>,
    unread: i64,
    needs_refresh: bool,
}

#[derive(Debug)]
pub struct ClientReadModel {
    user_id: Uuid,
    chats: HashMap<Uuid, ChatView>,
    ticks: HashMap<Uuid, ReadTick>,
    recent: RecentEventIds,
}

impl ClientReadModel {
    #[must_use]
    pub fn new(user_id: Uuid) -> Self {
        Self::with_event_window(user_id, DEFAULT_EVENT_WINDOW)
    }

    #[must_use]
    pub fn with_event_window(user_id: Uuid, window: usize) -> Self {
        Self {
            user_id,
            chats: HashMap::new(),
            ticks: HashMap::new(),
            recent: RecentEventIds::new(window),
        }
    }

    #[must_use]
    pub const fn user_id(&self) -> Uuid {
        self.user_id
    }

    /// Replaces the chat list with a `listChatsForUser` snapshot.
    pub fn apply_chat_summaries(&mut self, summaries: Vec<ChatSummary>) {
        for summary in summaries {
            let view = self.chats.entry(summary.chat.id).or_default();
            view.unread = summary.unread_count;
            view.chat = Some(summary.chat);
            view.needs_refresh = false;
        }
    }

    /// Merges a `listMessages` snapshot. The store is authoritative, so
    /// anything not in the snapshot and not newer than it is dropped.
    pub fn apply_message_snapshot(&mut self, chat_id: Uuid, messages: Vec<Message>) {
        let view = self.chats.entry(chat_id).or_default();
        let newest = messages.iter().map(|message| message.created_at).max();
        view.messages.retain(|_, existing| {
            newest.is_some_and(|newest: Timestamp| existing.created_at > newest)
        });
        for message in messages {
            view.deleted.remove(&message.id);
            view.messages.insert(message.id, message);
        }
    }

    pub fn apply_read_status(&mut self, status: &ReadStatus) {
        self.merge_tick(status.message_id, status.read_by_count, status.fully_read);
    }

    /// Applies a forwarded event. Returns `false` when it was a redelivery.
    pub fn apply_event(&mut self, envelope: &EventEnvelope) -> bool {
        if !self.recent.insert(envelope.event_id) {
            return false;
        }

        match &envelope.payload {
            EventPayload::MessageCreated(message) | EventPayload::MessageUpdated(message) => {
                self.upsert_message(message);
            }
            EventPayload::MessageDeleted(event) => {
                let view = self.chats.entry(event.chat_id).or_default();
                view.messages.remove(&event.message_id);
                view.deleted.insert(event.message_id);
                self.ticks.remove(&event.message_id);
            }
            EventPayload::ChatCreated(chat) => {
                self.chats.entry(chat.id).or_default().chat = Some(chat.clone());
            }
            EventPayload::ChatUpdated(event) => {
                let view = self.chats.entry(event.chat.id).or_default();
                let grows = view.chat.as_ref().is_none_or(|current| {
                    current.participants.is_subset(&event.chat.participants)
                });
                if grows {
                    view.chat = Some(event.chat.clone());
                }
            }
            EventPayload::ReadReceiptCreated(event) => {
                self.merge_tick(
                    event.receipt.message_id,
                    event.read_by_count,
                    event.fully_read,
                );
            }
            EventPayload::UnreadCounterChanged(counter) if counter.user_id == self.user_id => {
                self.chats.entry(counter.chat_id).or_default().unread = counter.count;
            }
            EventPayload::UnreadCounterChanged(_) => {}
            EventPayload::ChatNotification(event) => {
                self.chats.entry(event.chat_id).or_default().needs_refresh = true;
            }
            EventPayload::ChatListRefresh(event) => {
                if event.user_ids.contains(&self.user_id) {
                    self.chats.entry(event.chat_id).or_default().needs_refresh = true;
                }
            }
        }

        true
    }

    /// Messages of a chat in creation order, independent of arrival order.
    #[must_use]
    pub fn messages(&self, chat_id: Uuid) -> Vec<&Message> {
        let Some(view) = self.chats.get(&chat_id) else {
            return Vec::new();
        };
        let mut messages: Vec<&Message> = view.messages.values().collect();
        messages.sort_by_key(|message| message.ordering_key());
        messages
    }

    #[must_use]
    pub fn unread_count(&self, chat_id: Uuid) -> i64 {
        self.chats.get(&chat_id).map_or(0, |view| view.unread)
    }

    #[must_use]
    pub fn read_tick(&self, message_id: Uuid) -> ReadTick {
        self.ticks.get(&message_id).copied().unwrap_or_default()
    }

    #[must_use]
    pub fn chat(&self, chat_id: Uuid) -> Option<&Chat> {
        self.chats.get(&chat_id).and_then(|view| view.chat.as_ref())
    }

    /// Chats whose list entry should be re-queried.
    #[must_use]
    pub fn stale_chats(&self) -> Vec<Uuid> {
        let mut stale: Vec<Uuid> = self
            .chats
            .iter()
            .filter(|(_, view)| view.needs_refresh)
            .map(|(chat_id, _)| *chat_id)
            .collect();
        stale.sort();
        stale
    }

    fn upsert_message(&mut self, message: &Message) {
        let view = self.chats.entry(message.chat_id).or_default();
        if view.deleted.contains(&message.id) {
            return;
        }
        let newer = view
            .messages
            .get(&message.id)
            .is_none_or(|current| message.edited_at >= current.edited_at);
        if newer {
            view.messages.insert(message.id, message.clone());
        }
    }

    fn merge_tick(&mut self, message_id: Uuid, read_by_count: usize, fully_read: bool) {
        let tick = self.ticks.entry(message_id).or_default();
        tick.read_by_count = tick.read_by_count.max(read_by_count);
        tick.fully_read |= fully_read;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{
        MessageDeletedEvent, ReadReceipt, ReadReceiptCreatedEvent, UnreadCounter,
    };
    use chrono::{Duration, Utc};

    fn message(chat_id: Uuid, offset_ms: i64) -> Message {
        Message {
            id: Uuid::new_v4(),
            chat_id,
            sender_id: Uuid::new_v4(),
            content: format!("m{offset_ms}"),
            created_at: Timestamp(Utc::now() + Duration::milliseconds(offset_ms)),
            edited: false,
            edited_at: None,
        }
    }

    fn envelope(payload: EventPayload) -> EventEnvelope {
        EventEnvelope::new("writer-test", payload)
    }

    #[test]
    fn orders_by_creation_time_not_arrival() {
        let chat_id = Uuid::new_v4();
        let mut model = ClientReadModel::new(Uuid::new_v4());
        let first = message(chat_id, 0);
        let second = message(chat_id, 5);

        model.apply_event(&envelope(EventPayload::MessageCreated(second.clone())));
        model.apply_event(&envelope(EventPayload::MessageCreated(first.clone())));

        let ids: Vec<Uuid> = model.messages(chat_id).iter().map(|m| m.id).collect();
        assert_eq!(ids, vec![first.id, second.id]);
    }

    #[test]
    fn redelivered_events_are_ignored() {
        let chat_id = Uuid::new_v4();
        let mut model = ClientReadModel::new(Uuid::new_v4());
        let event = envelope(EventPayload::MessageCreated(message(chat_id, 0)));

        assert!(model.apply_event(&event));
        assert!(!model.apply_event(&event));
        assert_eq!(model.messages(chat_id).len(), 1);
    }

    #[test]
    fn late_create_does_not_resurrect_deleted_message() {
        let chat_id = Uuid::new_v4();
        let mut model = ClientReadModel::new(Uuid::new_v4());
        let msg = message(chat_id, 0);

        model.apply_event(&envelope(EventPayload::MessageDeleted(MessageDeletedEvent {
            message_id: msg.id,
            chat_id,
            sender_id: msg.sender_id,
            deleted_at: Timestamp::now(),
        })));
        model.apply_event(&envelope(EventPayload::MessageCreated(msg)));

        assert!(model.messages(chat_id).is_empty());
    }

    #[test]
    fn stale_edit_does_not_overwrite_newer_edit() {
        let chat_id = Uuid::new_v4();
        let mut model = ClientReadModel::new(Uuid::new_v4());
        let original = message(chat_id, 0);

        let mut first_edit = original.clone();
        first_edit.content = "first".into();
        first_edit.edited = true;
        first_edit.edited_at = Some(Timestamp(Utc::now()));

        let mut second_edit = original.clone();
        second_edit.content = "second".into();
        second_edit.edited = true;
        second_edit.edited_at = Some(Timestamp(Utc::now() + Duration::seconds(1)));

        model.apply_event(&envelope(EventPayload::MessageUpdated(second_edit)));
        model.apply_event(&envelope(EventPayload::MessageUpdated(first_edit)));

        assert_eq!(model.messages(chat_id)[0].content, "second");
    }

    #[test]
    fn unread_badge_takes_authoritative_value() {
        let (user, chat_id) = (Uuid::new_v4(), Uuid::new_v4());
        let mut model = ClientReadModel::new(user);

        for count in [1, 2, 5] {
            model.apply_event(&envelope(EventPayload::UnreadCounterChanged(UnreadCounter {
                chat_id,
                user_id: user,
                count,
            })));
        }
        assert_eq!(model.unread_count(chat_id), 5);

        model.apply_event(&envelope(EventPayload::UnreadCounterChanged(UnreadCounter {
            chat_id,
            user_id: Uuid::new_v4(),
            count: 9,
        })));
        assert_eq!(model.unread_count(chat_id), 5);
    }

    #[test]
    fn read_tick_never_regresses() {
        let chat_id = Uuid::new_v4();
        let mut model = ClientReadModel::new(Uuid::new_v4());
        let msg = message(chat_id, 0);
        let receipt_event = |count: usize, fully_read: bool| {
            envelope(EventPayload::ReadReceiptCreated(ReadReceiptCreatedEvent {
                receipt: ReadReceipt {
                    message_id: msg.id,
                    chat_id,
                    user_id: Uuid::new_v4(),
                    read_at: Timestamp::now(),
                },
                sender_id: msg.sender_id,
                read_by_count: count,
                participant_count: 3,
                fully_read,
            }))
        };

        model.apply_event(&receipt_event(2, true));
        model.apply_event(&receipt_event(1, false));

        assert_eq!(
            model.read_tick(msg.id),
            ReadTick {
                read_by_count: 2,
                fully_read: true
            }
        );
    }

    #[test]
    fn snapshot_replaces_messages_missed_while_disconnected() {
        let chat_id = Uuid::new_v4();
        let mut model = ClientReadModel::new(Uuid::new_v4());
        let kept = message(chat_id, 0);
        let gone = message(chat_id, -10);

        model.apply_event(&envelope(EventPayload::MessageCreated(gone)));
        model.apply_message_snapshot(chat_id, vec![kept.clone()]);

        let ids: Vec<Uuid> = model.messages(chat_id).iter().map(|m| m.id).collect();
        assert_eq!(ids, vec![kept.id]);
    }
}
