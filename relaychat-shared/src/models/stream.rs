//! Frames exchanged over a client's duplex channel and the filters that
//! decide which broker events a subscription receives.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use utoipa::ToSchema;
use uuid::Uuid;

use super::events::{EventEnvelope, EventPayload, Topic, TopicScope};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, ToSchema)]
pub struct SubscribeRequest {
    pub subscription_id: String,
    pub topic: Topic,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chat_id: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<Uuid>,
}

/// Frames sent by a client.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, ToSchema)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
    Subscribe(SubscribeRequest),
    Unsubscribe { subscription_id: String },
    Ping,
}

/// Frames sent to a client.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, ToSchema)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerFrame {
    Ready {
        client_id: Uuid,
    },
    Subscribed {
        subscription_id: String,
    },
    Unsubscribed {
        subscription_id: String,
    },
    Event {
        subscription_id: String,
        topic: Topic,
        event_id: Uuid,
        payload: EventPayload,
    },
    Error {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        subscription_id: Option<String>,
        code: String,
        message: String,
    },
    Pong,
    Heartbeat,
}

impl ServerFrame {
    #[must_use]
    pub fn event(subscription_id: &str, envelope: &EventEnvelope) -> Self {
        Self::Event {
            subscription_id: subscription_id.to_string(),
            topic: envelope.topic,
            event_id: envelope.event_id,
            payload: envelope.payload.clone(),
        }
    }

    #[must_use]
    pub fn error(subscription_id: Option<String>, err: &FilterError) -> Self {
        Self::Error {
            subscription_id,
            code: err.code().to_string(),
            message: err.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FilterError {
    #[error("topic {0} requires a chat_id")]
    MissingChatId(Topic),
    #[error("cannot subscribe to another user's {0} stream")]
    ForeignUser(Topic),
    #[error("subscription id must not be empty")]
    EmptySubscriptionId,
}

impl FilterError {
    #[must_use]
    pub const fn code(&self) -> &'static str {
        match self {
            Self::MissingChatId(_) | Self::EmptySubscriptionId => "invalid_subscription",
            Self::ForeignUser(_) => "forbidden",
        }
    }
}

/// The scoping key a subscription was registered with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterKey {
    Chat(Uuid),
    User { user_id: Uuid, chat_id: Option<Uuid> },
    Audience { user_id: Uuid },
}

/// Resolved predicate for one client subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubscriptionFilter {
    pub topic: Topic,
    pub key: FilterKey,
}

impl SubscriptionFilter {
    /// Validates a subscribe request on behalf of `connected_user`.
    ///
    /// # Errors
    /// Returns [`FilterError`] when a chat-scoped topic has no chat id or a
    /// user-scoped topic targets someone other than the connected user.
    pub fn resolve(request: &SubscribeRequest, connected_user: Uuid) -> Result<Self, FilterError> {
        if request.subscription_id.trim().is_empty() {
            return Err(FilterError::EmptySubscriptionId);
        }

        let key = match request.topic.scope() {
            TopicScope::Chat => FilterKey::Chat(
                request
                    .chat_id
                    .ok_or(FilterError::MissingChatId(request.topic))?,
            ),
            TopicScope::User => {
                let user_id = request.user_id.unwrap_or(connected_user);
                if user_id != connected_user {
                    return Err(FilterError::ForeignUser(request.topic));
                }
                FilterKey::User {
                    user_id,
                    chat_id: request.chat_id,
                }
            }
            TopicScope::Audience => {
                if request.user_id.is_some_and(|user_id| user_id != connected_user) {
                    return Err(FilterError::ForeignUser(request.topic));
                }
                FilterKey::Audience {
                    user_id: connected_user,
                }
            }
        };

        Ok(Self {
            topic: request.topic,
            key,
        })
    }

    #[must_use]
    pub fn matches(&self, payload: &EventPayload) -> bool {
        if payload.topic() != self.topic {
            return false;
        }

        match self.key {
            FilterKey::Chat(chat_id) => payload.chat_id() == chat_id,
            FilterKey::User { user_id, chat_id } => {
                payload.addresses(user_id) && chat_id.is_none_or(|id| id == payload.chat_id())
            }
            FilterKey::Audience { user_id } => {
                let self_originated = self.topic == Topic::ChatNotification
                    && payload.originator() == Some(user_id);
                payload.addresses(user_id) && !self_originated
            }
        }
    }
}
