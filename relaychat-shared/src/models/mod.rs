pub mod chat;
pub mod commands;
pub mod errors;
pub mod events;
pub mod receipts;
pub mod stream;
pub mod timestamp;

pub use chat::{
    AddParticipantsRequest, Chat, ChatSummary, CreateChatRequest, EditMessageRequest, Message,
    SendMessageRequest,
};
pub use commands::{
    Command, CommandOutcome, MarkReadOutcome, MessageDeleted, Query, QueryOutcome,
};
pub use errors::ErrorResponse;
pub use events::{
    ChatListRefreshEvent, ChatNotificationEvent, ChatUpdatedEvent, EventEnvelope, EventPayload,
    MessageDeletedEvent, NOTIFICATION_PREVIEW_CHARS, ReadReceiptCreatedEvent, RecentEventIds,
    RefreshReason, Topic, TopicScope, encoded_len,
};
pub use receipts::{
    CounterTransition, ReadReceipt, ReadState, ReadStatus, UnreadCounter, is_fully_read,
};
pub use stream::{
    ClientFrame, FilterError, FilterKey, ServerFrame, SubscribeRequest, SubscriptionFilter,
};
pub use timestamp::Timestamp;
