//! Publish/subscribe transport between writer and reader processes.
//!
//! Publishing and subscribing are separate handles so a writer never opens a
//! listening connection and a reader never holds a publishing pool. Delivery
//! is at-least-once while a subscriber stays connected; the fan-out drops
//! redeliveries by event id. Nothing published during a disconnect is
//! replayed, and clients recover by re-querying.

use std::{fmt, sync::Arc};

use async_trait::async_trait;
use futures::stream::BoxStream;
use futures_util::StreamExt;
use serde_json::Value;
use shared::{
    config::server::{Backend, Config},
    models::Topic,
};
use thiserror::Error;
use tokio::sync::broadcast;
use tokio_stream::wrappers::{BroadcastStream, errors::BroadcastStreamRecvError};
use tracing::warn;

pub mod memory;
pub mod postgres;

#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("broker unavailable: {0}")]
    Unavailable(String),
    #[error("broker connection error: {0}")]
    Connection(#[from] sqlx::Error),
    #[error("failed to encode payload: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("payload for {topic} is {size} bytes, limit is {limit}")]
    PayloadTooLarge {
        topic: Topic,
        size: usize,
        limit: usize,
    },
    #[error("broker handle closed")]
    Closed,
}

pub type BrokerResult<T> = Result<T, BrokerError>;

/// Raw payloads delivered for one topic, in broker order.
pub type PayloadStream = BoxStream<'static, Value>;

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait BrokerPublisher: Send + Sync {
    async fn publish(&self, topic: Topic, payload: Value) -> BrokerResult<()>;
}

#[async_trait]
pub trait BrokerSubscriber: Send + Sync {
    /// Opens a stream of payloads for `topic`. The stream ends when the
    /// underlying connection is lost; callers resubscribe.
    async fn subscribe(&self, topic: Topic) -> BrokerResult<PayloadStream>;
}

pub type SharedPublisher = Arc<dyn BrokerPublisher>;
pub type SharedSubscriber = Arc<dyn BrokerSubscriber>;

/// The broker handles a process holds. Which ones exist depends on its role.
#[derive(Clone, Default)]
pub struct BrokerHandles {
    pub publisher: Option<SharedPublisher>,
    pub subscriber: Option<SharedSubscriber>,
}

impl fmt::Debug for BrokerHandles {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BrokerHandles")
            .field("publisher", &self.publisher.is_some())
            .field("subscriber", &self.subscriber.is_some())
            .finish()
    }
}

/// Opens the handles the configured role needs.
pub async fn connect(config: &Config) -> BrokerResult<BrokerHandles> {
    let role = config.server.role;
    match config.broker.backend {
        Backend::Memory => {
            let broker = Arc::new(memory::MemoryBroker::new(config.broker.channel_capacity));
            Ok(BrokerHandles {
                publisher: role
                    .serves_commands()
                    .then(|| Arc::clone(&broker) as SharedPublisher),
                subscriber: role
                    .serves_queries()
                    .then(|| Arc::clone(&broker) as SharedSubscriber),
            })
        }
        Backend::Postgres => {
            let url = config.broker_url();
            let publisher = if role.serves_commands() {
                let publisher = postgres::PgPublisher::connect(
                    url,
                    config.broker.publish_max_connections,
                    config.broker.max_payload_bytes,
                )
                .await?;
                Some(Arc::new(publisher) as SharedPublisher)
            } else {
                None
            };
            let subscriber = if role.serves_queries() {
                let subscriber = postgres::PgSubscriber::connect(
                    url,
                    config.broker.channel_capacity,
                    std::time::Duration::from_millis(config.broker.resubscribe_backoff_ms),
                )
                .await?;
                Some(Arc::new(subscriber) as SharedSubscriber)
            } else {
                None
            };
            Ok(BrokerHandles {
                publisher,
                subscriber,
            })
        }
    }
}

/// Adapts a local broadcast receiver into a payload stream. Lagged receivers
/// skip what they missed.
pub(crate) fn payload_stream(topic: Topic, receiver: broadcast::Receiver<Value>) -> PayloadStream {
    BroadcastStream::new(receiver)
        .filter_map(move |item| async move {
            match item {
                Ok(payload) => Some(payload),
                Err(BroadcastStreamRecvError::Lagged(skipped)) => {
                    warn!(topic = %topic, skipped, "broker subscriber lagged; events dropped");
                    metrics::counter!("broker_lagged_total", "topic" => topic.as_str())
                        .increment(skipped);
                    None
                }
            }
        })
        .boxed()
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared::config::server::{Profile, ServiceRole};

    #[tokio::test]
    async fn handles_follow_the_role() {
        let mut config = Config::default_for_profile(Profile::Test);

        config.server.role = ServiceRole::Writer;
        let handles = connect(&config).await.unwrap();
        assert!(handles.publisher.is_some());
        assert!(handles.subscriber.is_none());

        config.server.role = ServiceRole::Reader;
        let handles = connect(&config).await.unwrap();
        assert!(handles.publisher.is_none());
        assert!(handles.subscriber.is_some());

        config.server.role = ServiceRole::Combined;
        let handles = connect(&config).await.unwrap();
        assert!(handles.publisher.is_some());
        assert!(handles.subscriber.is_some());
    }
}
