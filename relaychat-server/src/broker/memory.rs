use std::{
    collections::HashMap,
    sync::atomic::{AtomicBool, Ordering},
};

use async_trait::async_trait;
use serde_json::Value;
use shared::models::Topic;
use tokio::sync::{Mutex, broadcast};
use tracing::debug;

use super::{
    BrokerError, BrokerPublisher, BrokerResult, BrokerSubscriber, PayloadStream, payload_stream,
};

/// In-process broker with one broadcast channel per topic. Only processes
/// sharing the same instance see each other's events.
#[derive(Debug)]
pub struct MemoryBroker {
    capacity: usize,
    channels: Mutex<HashMap<Topic, broadcast::Sender<Value>>>,
    unavailable: AtomicBool,
}

impl MemoryBroker {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            channels: Mutex::new(HashMap::new()),
            unavailable: AtomicBool::new(false),
        }
    }

    /// Makes every publish fail until cleared.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Drops every channel, ending all open subscription streams as a lost
    /// connection would. Events published before a resubscribe are lost.
    pub async fn reset(&self) {
        self.channels.lock().await.clear();
    }

    async fn sender(&self, topic: Topic) -> broadcast::Sender<Value> {
        self.channels
            .lock()
            .await
            .entry(topic)
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .clone()
    }
}

#[async_trait]
impl BrokerPublisher for MemoryBroker {
    async fn publish(&self, topic: Topic, payload: Value) -> BrokerResult<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(BrokerError::Unavailable("memory broker offline".into()));
        }
        let receivers = self.sender(topic).await.send(payload).unwrap_or(0);
        debug!(topic = %topic, receivers, "published to memory broker");
        Ok(())
    }
}

#[async_trait]
impl BrokerSubscriber for MemoryBroker {
    async fn subscribe(&self, topic: Topic) -> BrokerResult<PayloadStream> {
        let receiver = self.sender(topic).await.subscribe();
        Ok(payload_stream(topic, receiver))
    }
}
