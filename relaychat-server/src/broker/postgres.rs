//! Broker over Postgres `LISTEN`/`NOTIFY`. Channel names are topic names.

use std::{collections::HashMap, fmt, sync::Arc, time::Duration};

use async_trait::async_trait;
use serde_json::Value;
use shared::models::Topic;
use sqlx::{
    PgPool,
    postgres::{PgListener, PgNotification, PgPoolOptions},
};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{
    BrokerError, BrokerPublisher, BrokerResult, BrokerSubscriber, PayloadStream, payload_stream,
};

/// Publishing handle. Holds a small pool of its own, separate from the store.
#[derive(Clone)]
pub struct PgPublisher {
    pool: PgPool,
    max_payload_bytes: usize,
}

impl fmt::Debug for PgPublisher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PgPublisher")
            .field("max_payload_bytes", &self.max_payload_bytes)
            .finish()
    }
}

impl PgPublisher {
    pub async fn connect(
        url: &str,
        max_connections: u32,
        max_payload_bytes: usize,
    ) -> BrokerResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections.max(1))
            .acquire_timeout(Duration::from_secs(5))
            .connect(url)
            .await?;
        info!(max_connections, "broker publisher connected");
        Ok(Self {
            pool,
            max_payload_bytes,
        })
    }
}

/// Rejects payloads Postgres would refuse to deliver.
fn encode_payload(topic: Topic, payload: &Value, limit: usize) -> BrokerResult<String> {
    let encoded = serde_json::to_string(payload)?;
    if encoded.len() > limit {
        return Err(BrokerError::PayloadTooLarge {
            topic,
            size: encoded.len(),
            limit,
        });
    }
    Ok(encoded)
}

#[async_trait]
impl BrokerPublisher for PgPublisher {
    async fn publish(&self, topic: Topic, payload: Value) -> BrokerResult<()> {
        let encoded = encode_payload(topic, &payload, self.max_payload_bytes)?;
        sqlx::query("SELECT pg_notify($1, $2)")
            .bind(topic.as_str())
            .bind(&encoded)
            .execute(&self.pool)
            .await?;
        debug!(topic = %topic, bytes = encoded.len(), "notified");
        Ok(())
    }
}

/// Subscription handle. One listening connection per process, fanned out to
/// local per-topic channels.
pub struct PgSubscriber {
    channels: Arc<HashMap<Topic, broadcast::Sender<Value>>>,
    shutdown: CancellationToken,
}

impl fmt::Debug for PgSubscriber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PgSubscriber")
            .field("topics", &self.channels.len())
            .finish()
    }
}

impl PgSubscriber {
    pub async fn connect(url: &str, capacity: usize, backoff: Duration) -> BrokerResult<Self> {
        let mut listener = PgListener::connect(url).await?;
        listener
            .listen_all(Topic::ALL.iter().map(|topic| topic.as_str()))
            .await?;
        info!(topics = Topic::ALL.len(), "broker subscriber listening");

        let channels: Arc<HashMap<Topic, broadcast::Sender<Value>>> = Arc::new(
            Topic::ALL
                .into_iter()
                .map(|topic| (topic, broadcast::channel(capacity.max(1)).0))
                .collect(),
        );
        let shutdown = CancellationToken::new();
        tokio::spawn(listen_loop(
            listener,
            Arc::clone(&channels),
            shutdown.clone(),
            backoff,
        ));

        Ok(Self { channels, shutdown })
    }
}

impl Drop for PgSubscriber {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

#[async_trait]
impl BrokerSubscriber for PgSubscriber {
    async fn subscribe(&self, topic: Topic) -> BrokerResult<PayloadStream> {
        let sender = self.channels.get(&topic).ok_or(BrokerError::Closed)?;
        Ok(payload_stream(topic, sender.subscribe()))
    }
}

async fn listen_loop(
    mut listener: PgListener,
    channels: Arc<HashMap<Topic, broadcast::Sender<Value>>>,
    shutdown: CancellationToken,
    backoff: Duration,
) {
    loop {
        tokio::select! {
            () = shutdown.cancelled() => {
                info!("broker subscriber stopped");
                return;
            }
            received = listener.try_recv() => {
                match received {
                    Ok(Some(notification)) => dispatch(&channels, &notification),
                    Ok(None) => {
                        // The listener reconnects and re-issues LISTEN on the next call.
                        warn!("broker connection lost; notifications sent meanwhile are gone");
                        metrics::counter!("broker_reconnects_total").increment(1);
                    }
                    Err(err) => {
                        warn!(error = %err, "broker listener failed; retrying");
                        metrics::counter!("broker_listen_errors_total").increment(1);
                        tokio::time::sleep(backoff).await;
                    }
                }
            }
        }
    }
}

fn dispatch(channels: &HashMap<Topic, broadcast::Sender<Value>>, notification: &PgNotification) {
    let Ok(topic) = Topic::try_from(notification.channel()) else {
        debug!(channel = notification.channel(), "ignoring unknown channel");
        return;
    };
    match serde_json::from_str::<Value>(notification.payload()) {
        Ok(payload) => {
            if let Some(sender) = channels.get(&topic) {
                // No local subscribers is not an error.
                let _ = sender.send(payload);
            }
        }
        Err(err) => {
            warn!(topic = %topic, error = %err, "dropping undecodable notification");
            metrics::counter!("broker_decode_errors_total", "topic" => topic.as_str())
                .increment(1);
        }
    }
}
