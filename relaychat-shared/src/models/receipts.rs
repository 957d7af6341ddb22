use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use uuid::Uuid;

use super::{
    chat::{Chat, Message},
    timestamp::Timestamp,
};

/// Proof that `user_id` has seen `message_id`. Unique per (message, user).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, ToSchema)]
pub struct ReadReceipt {
    pub message_id: Uuid,
    pub chat_id: Uuid,
    pub user_id: Uuid,
    pub read_at: Timestamp,
}

/// Per (message, user) read state. `Read` is terminal.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum ReadState {
    #[default]
    Unread,
    Read,
}

impl ReadState {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Unread => "unread",
            Self::Read => "read",
        }
    }

    /// Moves to `Read`. The flag is `true` only on the first transition.
    #[must_use]
    pub const fn mark_read(self) -> (Self, bool) {
        match self {
            Self::Unread => (Self::Read, true),
            Self::Read => (Self::Read, false),
        }
    }
}

impl TryFrom<&str> for ReadState {
    type Error = &'static str;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        match value {
            "unread" => Ok(Self::Unread),
            "read" => Ok(Self::Read),
            _ => Err("invalid read state"),
        }
    }
}

/// A message is fully read once every participant except its sender read it.
#[must_use]
pub const fn is_fully_read(read_by_count: usize, participant_count: usize) -> bool {
    read_by_count >= participant_count.saturating_sub(1)
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, ToSchema)]
pub struct ReadStatus {
    pub message_id: Uuid,
    pub chat_id: Uuid,
    pub sender_id: Uuid,
    pub read_by: Vec<ReadReceipt>,
    pub read_by_count: usize,
    pub participant_count: usize,
    pub fully_read: bool,
}

impl ReadStatus {
    /// Builds the status from persisted receipts. Receipts held by the sender
    /// or by non-participants never count towards `fully_read`.
    #[must_use]
    pub fn from_parts(message: &Message, chat: &Chat, receipts: Vec<ReadReceipt>) -> Self {
        let mut read_by: Vec<ReadReceipt> = receipts
            .into_iter()
            .filter(|receipt| {
                receipt.message_id == message.id
                    && receipt.user_id != message.sender_id
                    && chat.is_participant(receipt.user_id)
            })
            .collect();
        read_by.sort_by_key(|receipt| (receipt.user_id, receipt.read_at));
        read_by.dedup_by_key(|receipt| receipt.user_id);
        read_by.sort_by_key(|receipt| (receipt.read_at, receipt.user_id));

        let read_by_count = read_by.len();
        let participant_count = chat.participant_count();
        Self {
            message_id: message.id,
            chat_id: message.chat_id,
            sender_id: message.sender_id,
            read_by,
            read_by_count,
            participant_count,
            fully_read: is_fully_read(read_by_count, participant_count),
        }
    }
}

/// Number of unread messages `user_id` has in `chat_id`. Never negative.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, ToSchema)]
pub struct UnreadCounter {
    pub chat_id: Uuid,
    pub user_id: Uuid,
    pub count: i64,
}

/// The only two legal counter transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CounterTransition {
    Increment,
    ResetToZero,
}

impl UnreadCounter {
    #[must_use]
    pub const fn zero(chat_id: Uuid, user_id: Uuid) -> Self {
        Self {
            chat_id,
            user_id,
            count: 0,
        }
    }

    /// Applies a transition and reports whether the stored value changed.
    /// A reset on a counter already at zero is not a change.
    pub fn apply(&mut self, transition: CounterTransition) -> bool {
        match transition {
            CounterTransition::Increment => {
                self.count = self.count.saturating_add(1);
                true
            }
            CounterTransition::ResetToZero if self.count > 0 => {
                self.count = 0;
                true
            }
            CounterTransition::ResetToZero => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;

    fn fixture(participants: &[Uuid], sender: Uuid) -> (Chat, Message) {
        let chat = Chat {
            id: Uuid::new_v4(),
            name: "team".into(),
            participants: participants.iter().copied().collect::<BTreeSet<_>>(),
            active: true,
            created_at: Timestamp::now(),
        };
        let message = Message {
            id: Uuid::new_v4(),
            chat_id: chat.id,
            sender_id: sender,
            content: "hi".into(),
            created_at: Timestamp::now(),
            edited: false,
            edited_at: None,
        };
        (chat, message)
    }

    fn receipt(message: &Message, user_id: Uuid) -> ReadReceipt {
        ReadReceipt {
            message_id: message.id,
            chat_id: message.chat_id,
            user_id,
            read_at: Timestamp::now(),
        }
    }

    #[test]
    fn read_state_transitions_once() {
        let (state, first) = ReadState::Unread.mark_read();
        assert_eq!(state, ReadState::Read);
        assert!(first);

        let (state, first) = state.mark_read();
        assert_eq!(state, ReadState::Read);
        assert!(!first);
    }

    #[test]
    fn fully_read_excludes_sender_from_denominator() {
        assert!(!is_fully_read(1, 3));
        assert!(is_fully_read(2, 3));
        assert!(is_fully_read(0, 1));
    }

    #[test]
    fn read_status_ignores_sender_and_outsider_receipts() {
        let (u1, u2, u3) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
        let (chat, message) = fixture(&[u1, u2, u3], u1);

        let status = ReadStatus::from_parts(
            &message,
            &chat,
            vec![
                receipt(&message, u1),
                receipt(&message, u2),
                receipt(&message, Uuid::new_v4()),
            ],
        );
        assert_eq!(status.read_by_count, 1);
        assert!(!status.fully_read);

        let status = ReadStatus::from_parts(
            &message,
            &chat,
            vec![receipt(&message, u2), receipt(&message, u3)],
        );
        assert_eq!(status.read_by_count, 2);
        assert!(status.fully_read);
    }

    #[test]
    fn counter_equals_increments_after_last_reset() {
        let mut counter = UnreadCounter::zero(Uuid::new_v4(), Uuid::new_v4());
        for _ in 0..4 {
            assert!(counter.apply(CounterTransition::Increment));
        }
        assert!(counter.apply(CounterTransition::ResetToZero));
        assert!(!counter.apply(CounterTransition::ResetToZero));
        for _ in 0..3 {
            counter.apply(CounterTransition::Increment);
        }
        assert_eq!(counter.count, 3);
    }
}
