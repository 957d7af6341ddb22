use std::fmt;

use metrics::counter;
use shared::models::{EventEnvelope, EventPayload};
use tracing::{debug, warn};

use crate::broker::{BrokerError, SharedPublisher};

/// Wraps payloads in envelopes and hands them to the broker.
///
/// Publishing happens after the store transaction committed, so a broker
/// failure never undoes a write: the event is logged, counted and dropped.
#[derive(Clone)]
pub struct EventPublisher {
    broker: SharedPublisher,
    origin: String,
}

impl fmt::Debug for EventPublisher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventPublisher")
            .field("origin", &self.origin)
            .finish()
    }
}

impl EventPublisher {
    pub fn new(broker: SharedPublisher, origin: impl Into<String>) -> Self {
        Self {
            broker,
            origin: origin.into(),
        }
    }

    /// Publishes one event. Returns whether the broker accepted it.
    pub async fn publish(&self, payload: EventPayload) -> bool {
        let envelope = EventEnvelope::new(self.origin.clone(), payload);
        let topic = envelope.topic;
        let event_id = envelope.event_id;

        let result = match serde_json::to_value(&envelope) {
            Ok(value) => self.broker.publish(topic, value).await,
            Err(err) => Err(BrokerError::from(err)),
        };

        match result {
            Ok(()) => {
                debug!(topic = %topic, %event_id, "event published");
                counter!("broker_publish_total", "topic" => topic.as_str(), "status" => "ok")
                    .increment(1);
                true
            }
            Err(err) => {
                warn!(topic = %topic, %event_id, error = %err, "event dropped after commit");
                counter!("broker_publish_total", "topic" => topic.as_str(), "status" => "error")
                    .increment(1);
                false
            }
        }
    }

    /// Publishes events in order. Returns how many the broker accepted.
    pub async fn publish_all(&self, payloads: Vec<EventPayload>) -> usize {
        let mut published = 0;
        for payload in payloads {
            if self.publish(payload).await {
                published += 1;
            }
        }
        published
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::MockBrokerPublisher;
    use shared::models::{Chat, Timestamp, Topic};
    use std::{collections::BTreeSet, sync::Arc};
    use uuid::Uuid;

    fn chat_created() -> EventPayload {
        EventPayload::ChatCreated(Chat {
            id: Uuid::new_v4(),
            name: "room".into(),
            participants: BTreeSet::from([Uuid::new_v4()]),
            active: true,
            created_at: Timestamp::now(),
        })
    }

    #[tokio::test]
    async fn envelopes_carry_origin_and_topic() {
        let mut broker = MockBrokerPublisher::new();
        broker
            .expect_publish()
            .withf(|topic, value| {
                *topic == Topic::ChatCreated
                    && value["origin"] == "writer-1"
                    && value["topic"] == "chat.created"
                    && value["payload"]["type"] == "chat.created"
            })
            .times(1)
            .returning(|_, _| Ok(()));

        let publisher = EventPublisher::new(Arc::new(broker), "writer-1");
        assert!(publisher.publish(chat_created()).await);
    }

    #[tokio::test]
    async fn broker_failures_are_swallowed() {
        let mut broker = MockBrokerPublisher::new();
        broker
            .expect_publish()
            .times(2)
            .returning(|_, _| Err(BrokerError::Unavailable("down".into())));

        let publisher = EventPublisher::new(Arc::new(broker), "writer-1");
        let published = publisher
            .publish_all(vec![chat_created(), chat_created()])
            .await;
        assert_eq!(published, 0);
    }
}
