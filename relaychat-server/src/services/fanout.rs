//! Per-process fan-out of broker events to connected clients.
//!
//! The hub holds exactly one broker subscription per topic no matter how many
//! clients are connected, and keeps a registry of client filters keyed by
//! subscription id. Each incoming event is decoded once, deduplicated by
//! event id, matched against every filter and forwarded to the matching
//! clients tagged with their subscription id.
//!
//! A client whose queue is full is disconnected rather than skipped, so a
//! connected client never misses an event; it reconnects and re-queries.

use std::{
    collections::HashMap,
    fmt,
    sync::{Arc, Weak},
    time::Duration,
};

use futures_util::StreamExt;
use metrics::{counter, gauge};
use serde_json::Value;
use shared::{
    config::server::StreamConfig,
    models::{
        EventEnvelope, FilterError, RecentEventIds, ServerFrame, SubscribeRequest,
        SubscriptionFilter, Topic,
    },
};
use thiserror::Error;
use tokio::sync::{Mutex, OnceCell, RwLock, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::broker::{BrokerError, PayloadStream, SharedSubscriber};

#[derive(Debug, Error)]
pub enum FanoutError {
    #[error(transparent)]
    Filter(#[from] FilterError),
    #[error("subscription limit of {0} reached")]
    TooManySubscriptions(usize),
    #[error("client {0} is not connected")]
    UnknownClient(Uuid),
    #[error(transparent)]
    Broker(#[from] BrokerError),
}

impl FanoutError {
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::Filter(err) => err.code(),
            Self::TooManySubscriptions(_) => "subscription_limit",
            Self::UnknownClient(_) => "unknown_client",
            Self::Broker(_) => "broker_unavailable",
        }
    }
}

/// What a connection gets back from [`FanoutHub::connect`].
#[derive(Debug)]
pub struct ClientHandle {
    pub client_id: Uuid,
    pub user_id: Uuid,
    pub frames: mpsc::Receiver<ServerFrame>,
}

#[derive(Debug)]
struct ClientEntry {
    user_id: Uuid,
    sender: mpsc::Sender<ServerFrame>,
    subscriptions: HashMap<String, SubscriptionFilter>,
}

pub struct FanoutHub {
    subscriber: SharedSubscriber,
    config: StreamConfig,
    resubscribe_backoff: Duration,
    clients: RwLock<HashMap<Uuid, ClientEntry>>,
    recent: Mutex<RecentEventIds>,
    started: OnceCell<()>,
    shutdown: CancellationToken,
}

impl fmt::Debug for FanoutHub {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FanoutHub")
            .field("config", &self.config)
            .field("started", &self.started.initialized())
            .finish()
    }
}

pub type SharedFanoutHub = Arc<FanoutHub>;

impl FanoutHub {
    pub fn new(
        subscriber: SharedSubscriber,
        config: StreamConfig,
        resubscribe_backoff: Duration,
    ) -> SharedFanoutHub {
        let dedup_window = config.dedup_window;
        Arc::new(Self {
            subscriber,
            config,
            resubscribe_backoff,
            clients: RwLock::new(HashMap::new()),
            recent: Mutex::new(RecentEventIds::new(dedup_window)),
            started: OnceCell::new(),
            shutdown: CancellationToken::new(),
        })
    }

    /// Opens the per-topic broker subscriptions. Only the first call does
    /// any work; later calls return immediately.
    pub async fn ensure_started(self: &Arc<Self>) -> Result<(), BrokerError> {
        self.started
            .get_or_try_init(|| async {
                for topic in Topic::ALL {
                    let stream = self.subscriber.subscribe(topic).await?;
                    tokio::spawn(pump_topic(
                        Arc::downgrade(self),
                        Arc::clone(&self.subscriber),
                        topic,
                        stream,
                        self.resubscribe_backoff,
                        self.shutdown.clone(),
                    ));
                }
                info!(topics = Topic::ALL.len(), "fan-out subscribed to broker");
                Ok::<(), BrokerError>(())
            })
            .await
            .map(|_| ())
    }

    /// Registers a client and queues its `ready` frame.
    pub async fn connect(self: &Arc<Self>, user_id: Uuid) -> Result<ClientHandle, FanoutError> {
        self.ensure_started().await?;

        let client_id = Uuid::new_v4();
        let (sender, frames) = mpsc::channel(self.config.client_channel_capacity.max(1));
        // The channel is empty, so the first frame always fits.
        let _ = sender.try_send(ServerFrame::Ready { client_id });

        let mut clients = self.clients.write().await;
        clients.insert(
            client_id,
            ClientEntry {
                user_id,
                sender,
                subscriptions: HashMap::new(),
            },
        );
        gauge!("fanout_connected_clients").set(clients.len() as f64);
        debug!(%client_id, %user_id, "client connected");

        Ok(ClientHandle {
            client_id,
            user_id,
            frames,
        })
    }

    pub async fn disconnect(&self, client_id: Uuid) {
        let mut clients = self.clients.write().await;
        if clients.remove(&client_id).is_some() {
            debug!(%client_id, "client disconnected");
        }
        gauge!("fanout_connected_clients").set(clients.len() as f64);
    }

    /// Adds or replaces a subscription for a connected client.
    pub async fn subscribe(
        &self,
        client_id: Uuid,
        request: &SubscribeRequest,
    ) -> Result<(), FanoutError> {
        let mut clients = self.clients.write().await;
        let client = clients
            .get_mut(&client_id)
            .ok_or(FanoutError::UnknownClient(client_id))?;

        let filter = SubscriptionFilter::resolve(request, client.user_id)?;
        let limit = self.config.max_subscriptions_per_client;
        if !client.subscriptions.contains_key(&request.subscription_id)
            && client.subscriptions.len() >= limit
        {
            return Err(FanoutError::TooManySubscriptions(limit));
        }

        client
            .subscriptions
            .insert(request.subscription_id.clone(), filter);
        debug!(
            %client_id,
            subscription_id = %request.subscription_id,
            topic = %request.topic,
            "subscribed"
        );
        Ok(())
    }

    /// Removes a subscription. Returns whether it existed.
    pub async fn unsubscribe(&self, client_id: Uuid, subscription_id: &str) -> bool {
        let mut clients = self.clients.write().await;
        clients
            .get_mut(&client_id)
            .is_some_and(|client| client.subscriptions.remove(subscription_id).is_some())
    }

    pub async fn client_count(&self) -> usize {
        self.clients.read().await.len()
    }

    /// Stops the broker pumps and drops every client channel.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let mut clients = self.clients.write().await;
        clients.clear();
        gauge!("fanout_connected_clients").set(0.0);
        info!("fan-out stopped");
    }

    async fn dispatch(&self, topic: Topic, value: Value) {
        let envelope: EventEnvelope = match serde_json::from_value(value) {
            Ok(envelope) => envelope,
            Err(err) => {
                warn!(topic = %topic, error = %err, "dropping undecodable event");
                counter!("fanout_dropped_total", "reason" => "decode").increment(1);
                return;
            }
        };
        if envelope.topic != topic || !envelope.is_consistent() {
            warn!(
                topic = %topic,
                event_id = %envelope.event_id,
                "dropping event with mismatched topic"
            );
            counter!("fanout_dropped_total", "reason" => "topic_mismatch").increment(1);
            return;
        }
        if !self.recent.lock().await.insert(envelope.event_id) {
            debug!(event_id = %envelope.event_id, "duplicate event ignored");
            counter!("fanout_duplicates_total").increment(1);
            return;
        }
        counter!("fanout_events_total", "topic" => topic.as_str()).increment(1);

        let deliveries: Vec<(Uuid, mpsc::Sender<ServerFrame>, ServerFrame)> = {
            let clients = self.clients.read().await;
            clients
                .iter()
                .flat_map(|(client_id, client)| {
                    client
                        .subscriptions
                        .iter()
                        .filter(|(_, filter)| filter.matches(&envelope.payload))
                        .map(|(subscription_id, _)| {
                            (
                                *client_id,
                                client.sender.clone(),
                                ServerFrame::event(subscription_id, &envelope),
                            )
                        })
                })
                .collect()
        };

        // try_send only; a stalled client never holds up the topic.
        let mut evicted = Vec::new();
        for (client_id, sender, frame) in deliveries {
            match sender.try_send(frame) {
                Ok(()) => {
                    counter!("fanout_forwarded_total", "topic" => topic.as_str()).increment(1);
                }
                Err(mpsc::error::TrySendError::Full(_)) => {
                    warn!(
                        %client_id,
                        event_id = %envelope.event_id,
                        "client queue full; disconnecting"
                    );
                    counter!("fanout_dropped_total", "reason" => "slow_consumer").increment(1);
                    evicted.push(client_id);
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    counter!("fanout_dropped_total", "reason" => "closed").increment(1);
                    evicted.push(client_id);
                }
            }
        }
        for client_id in evicted {
            self.disconnect(client_id).await;
        }
    }
}

impl Drop for FanoutHub {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// Drains one topic's broker stream into the hub, resubscribing whenever the
/// stream ends. Events published while resubscribing are lost.
async fn pump_topic(
    hub: Weak<FanoutHub>,
    subscriber: SharedSubscriber,
    topic: Topic,
    mut stream: PayloadStream,
    backoff: Duration,
    shutdown: CancellationToken,
) {
    loop {
        let next = tokio::select! {
            () = shutdown.cancelled() => return,
            next = stream.next() => next,
        };

        match next {
            Some(value) => {
                let Some(hub) = hub.upgrade() else { return };
                hub.dispatch(topic, value).await;
            }
            None => {
                warn!(topic = %topic, "broker subscription ended; resubscribing");
                counter!("fanout_resubscribes_total", "topic" => topic.as_str()).increment(1);
                loop {
                    tokio::select! {
                        () = shutdown.cancelled() => return,
                        () = tokio::time::sleep(backoff) => {}
                    }
                    match subscriber.subscribe(topic).await {
                        Ok(fresh) => {
                            stream = fresh;
                            info!(topic = %topic, "broker subscription restored");
                            break;
                        }
                        Err(err) => warn!(topic = %topic, error = %err, "resubscribe failed"),
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::{BrokerPublisher, memory::MemoryBroker};
    use shared::models::{EventPayload, Message, Timestamp, UnreadCounter};
    use tokio::time::timeout;

    const WAIT: Duration = Duration::from_millis(500);

    fn test_config() -> StreamConfig {
        StreamConfig {
            client_channel_capacity: 8,
            heartbeat_seconds: 1,
            send_timeout_ms: 50,
            dedup_window: 64,
            max_subscriptions_per_client: 2,
        }
    }

    async fn hub_with_broker() -> (SharedFanoutHub, Arc<MemoryBroker>) {
        let broker = Arc::new(MemoryBroker::new(64));
        let hub = FanoutHub::new(broker.clone(), test_config(), Duration::from_millis(10));
        hub.ensure_started().await.unwrap();
        (hub, broker)
    }

    fn message_in(chat_id: Uuid, sender_id: Uuid) -> EventEnvelope {
        EventEnvelope::new(
            "test",
            EventPayload::MessageCreated(Message {
                id: Uuid::new_v4(),
                chat_id,
                sender_id,
                content: "hi".into(),
                created_at: Timestamp::now(),
                edited: false,
                edited_at: None,
            }),
        )
    }

    async fn publish(broker: &MemoryBroker, envelope: &EventEnvelope) {
        broker
            .publish(envelope.topic, serde_json::to_value(envelope).unwrap())
            .await
            .unwrap();
    }

    async fn next_frame(handle: &mut ClientHandle) -> Option<ServerFrame> {
        timeout(WAIT, handle.frames.recv()).await.ok().flatten()
    }

    fn subscribe_request(id: &str, topic: Topic, chat_id: Option<Uuid>) -> SubscribeRequest {
        SubscribeRequest {
            subscription_id: id.into(),
            topic,
            chat_id,
            user_id: None,
        }
    }

    #[tokio::test]
    async fn forwards_matching_events_tagged_with_subscription_id() {
        let (hub, broker) = hub_with_broker().await;
        let chat_id = Uuid::new_v4();
        let mut client = hub.connect(Uuid::new_v4()).await.unwrap();
        assert!(matches!(
            next_frame(&mut client).await,
            Some(ServerFrame::Ready { .. })
        ));
        hub.subscribe(
            client.client_id,
            &subscribe_request("room", Topic::MessageCreated, Some(chat_id)),
        )
        .await
        .unwrap();

        publish(&broker, &message_in(Uuid::new_v4(), Uuid::new_v4())).await;
        let wanted = message_in(chat_id, Uuid::new_v4());
        publish(&broker, &wanted).await;

        match next_frame(&mut client).await {
            Some(ServerFrame::Event {
                subscription_id,
                event_id,
                ..
            }) => {
                assert_eq!(subscription_id, "room");
                assert_eq!(event_id, wanted.event_id);
            }
            other => panic!("unexpected frame: {other:?}"),
        }
    }

    #[tokio::test]
    async fn redelivered_events_are_forwarded_once() {
        let (hub, broker) = hub_with_broker().await;
        let chat_id = Uuid::new_v4();
        let mut client = hub.connect(Uuid::new_v4()).await.unwrap();
        next_frame(&mut client).await;
        hub.subscribe(
            client.client_id,
            &subscribe_request("room", Topic::MessageCreated, Some(chat_id)),
        )
        .await
        .unwrap();

        let envelope = message_in(chat_id, Uuid::new_v4());
        publish(&broker, &envelope).await;
        publish(&broker, &envelope).await;

        assert!(matches!(
            next_frame(&mut client).await,
            Some(ServerFrame::Event { .. })
        ));
        assert!(
            timeout(Duration::from_millis(100), client.frames.recv())
                .await
                .is_err()
        );
    }

    #[tokio::test]
    async fn user_scoped_topics_reject_other_users() {
        let (hub, _) = hub_with_broker().await;
        let client = hub.connect(Uuid::new_v4()).await.unwrap();

        let err = hub
            .subscribe(
                client.client_id,
                &SubscribeRequest {
                    subscription_id: "counts".into(),
                    topic: Topic::UnreadCounterChanged,
                    chat_id: None,
                    user_id: Some(Uuid::new_v4()),
                },
            )
            .await
            .unwrap_err();
        assert_eq!(err.code(), "forbidden");
    }

    #[tokio::test]
    async fn subscription_limit_is_enforced() {
        let (hub, _) = hub_with_broker().await;
        let client = hub.connect(Uuid::new_v4()).await.unwrap();
        let chat_id = Some(Uuid::new_v4());

        for id in ["a", "b"] {
            hub.subscribe(
                client.client_id,
                &subscribe_request(id, Topic::MessageCreated, chat_id),
            )
            .await
            .unwrap();
        }
        // Replacing an existing id does not count against the limit.
        hub.subscribe(
            client.client_id,
            &subscribe_request("a", Topic::MessageUpdated, chat_id),
        )
        .await
        .unwrap();

        let err = hub
            .subscribe(
                client.client_id,
                &subscribe_request("c", Topic::MessageDeleted, chat_id),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, FanoutError::TooManySubscriptions(2)));
        assert!(hub.unsubscribe(client.client_id, "b").await);
        assert!(!hub.unsubscribe(client.client_id, "b").await);
    }

    #[tokio::test]
    async fn resubscribes_after_broker_connection_loss() {
        let (hub, broker) = hub_with_broker().await;
        let user_id = Uuid::new_v4();
        let mut client = hub.connect(user_id).await.unwrap();
        next_frame(&mut client).await;
        hub.subscribe(
            client.client_id,
            &SubscribeRequest {
                subscription_id: "counts".into(),
                topic: Topic::UnreadCounterChanged,
                chat_id: None,
                user_id: None,
            },
        )
        .await
        .unwrap();

        broker.reset().await;

        let mut delivered = false;
        for attempt in 0..20 {
            let envelope = EventEnvelope::new(
                "test",
                EventPayload::UnreadCounterChanged(UnreadCounter {
                    chat_id: Uuid::new_v4(),
                    user_id,
                    count: attempt + 1,
                }),
            );
            publish(&broker, &envelope).await;
            if timeout(Duration::from_millis(50), client.frames.recv())
                .await
                .ok()
                .flatten()
                .is_some()
            {
                delivered = true;
                break;
            }
        }
        assert!(delivered, "hub never resubscribed");
    }

    #[tokio::test]
    async fn a_stalled_client_never_delays_the_others() {
        let (hub, broker) = hub_with_broker().await;
        let chat_id = Uuid::new_v4();
        let mut stalled = hub.connect(Uuid::new_v4()).await.unwrap();
        let mut healthy = hub.connect(Uuid::new_v4()).await.unwrap();
        next_frame(&mut healthy).await;
        for client_id in [stalled.client_id, healthy.client_id] {
            hub.subscribe(
                client_id,
                &subscribe_request("room", Topic::MessageCreated, Some(chat_id)),
            )
            .await
            .unwrap();
        }

        // The stalled client never reads; its queue holds 8 frames.
        let started = tokio::time::Instant::now();
        for _ in 0..20 {
            publish(&broker, &message_in(chat_id, Uuid::new_v4())).await;
            assert!(matches!(
                next_frame(&mut healthy).await,
                Some(ServerFrame::Event { .. })
            ));
        }
        assert!(started.elapsed() < Duration::from_millis(250));

        // Overflow disconnects the stalled client; what it had queued is still
        // readable before the channel closes.
        assert_eq!(hub.client_count().await, 1);
        let mut drained = 0;
        while stalled.frames.recv().await.is_some() {
            drained += 1;
        }
        assert_eq!(drained, 8);
    }

    #[tokio::test]
    async fn closed_clients_are_removed_on_delivery() {
        let (hub, broker) = hub_with_broker().await;
        let chat_id = Uuid::new_v4();
        let client = hub.connect(Uuid::new_v4()).await.unwrap();
        hub.subscribe(
            client.client_id,
            &subscribe_request("room", Topic::MessageCreated, Some(chat_id)),
        )
        .await
        .unwrap();
        drop(client);

        publish(&broker, &message_in(chat_id, Uuid::new_v4())).await;

        let mut remaining = usize::MAX;
        for _ in 0..20 {
            remaining = hub.client_count().await;
            if remaining == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(remaining, 0);
    }
}
