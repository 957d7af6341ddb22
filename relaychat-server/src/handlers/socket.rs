//! Duplex client channel. A client connects, then subscribes to topics with
//! filters; matching events arrive tagged with the subscription id.

use std::{sync::Arc, time::Duration};

use axum::{
    body::Bytes,
    extract::{
        Query, State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    response::Response,
};
use futures_util::{SinkExt, StreamExt, stream::SplitSink};
use serde::Deserialize;
use shared::models::{ClientFrame, ServerFrame};
use tokio::time::{interval, timeout};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{
    app_state::AppState,
    http::error::{ApiError, AppResult},
    middleware::request_context::RequestContext,
    services::{
        SharedFanoutHub,
        fanout::{ClientHandle, FanoutError},
    },
};

#[derive(Debug, Deserialize, Default)]
pub struct StreamQuery {
    user_id: Option<Uuid>,
}

/// Upgrades to a websocket. The user comes from the user header or, for
/// clients that cannot set headers, the `user_id` query parameter.
#[utoipa::path(
    get,
    path = "/api/ws",
    params(
        ("user_id" = Option<Uuid>, Query, description = "Connecting user when no header is sent")
    ),
    responses(
        (status = 101, description = "Switching to the websocket protocol"),
        (status = 401, description = "No user given")
    ),
    tag = "Streaming"
)]
pub async fn stream_handler(
    State(state): State<Arc<AppState>>,
    context: RequestContext,
    Query(query): Query<StreamQuery>,
    ws: WebSocketUpgrade,
) -> AppResult<Response> {
    let user_id = match context.user_id.or(query.user_id) {
        Some(user_id) => user_id,
        None => return Err(ApiError::unauthorized("a user id is required to stream")),
    };
    let hub = Arc::clone(state.hub()?);
    // Broker trouble is reported before upgrading; the client itself is only
    // registered once the socket exists.
    hub.ensure_started().await.map_err(FanoutError::from)?;
    let timing = SocketTiming {
        heartbeat: Duration::from_secs(state.config.stream.heartbeat_seconds.max(1)),
        send_timeout: Duration::from_millis(state.config.stream.send_timeout_ms.max(1)),
    };

    Ok(ws.on_upgrade(move |socket| async move {
        let client = match hub.connect(user_id).await {
            Ok(client) => client,
            Err(err) => {
                warn!(%user_id, error = %err, "could not register stream client");
                return;
            }
        };
        let client_id = client.client_id;
        run_socket(socket, Arc::clone(&hub), client, timing).await;
        hub.disconnect(client_id).await;
    }))
}

#[derive(Debug, Clone, Copy)]
struct SocketTiming {
    heartbeat: Duration,
    /// How long one write may wait on the peer before the stream is closed.
    send_timeout: Duration,
}

async fn run_socket(
    socket: WebSocket,
    hub: SharedFanoutHub,
    mut client: ClientHandle,
    timing: SocketTiming,
) {
    let (mut sender, mut incoming) = socket.split();
    let mut ticker = interval(timing.heartbeat);
    ticker.tick().await;
    info!(client_id = %client.client_id, user_id = %client.user_id, "stream opened");

    loop {
        tokio::select! {
            frame = client.frames.recv() => {
                let Some(frame) = frame else {
                    debug!(client_id = %client.client_id, "hub closed the client channel");
                    break;
                };
                if !send_within(&mut sender, &frame, timing.send_timeout).await {
                    break;
                }
            }
            message = incoming.next() => {
                match message {
                    Some(Ok(Message::Text(text))) => {
                        let reply = handle_client_frame(&hub, client.client_id, text.as_str()).await;
                        if !send_within(&mut sender, &reply, timing.send_timeout).await {
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                    Some(Ok(_)) => {}
                }
            }
            _ = ticker.tick() => {
                if !send_within(&mut sender, &ServerFrame::Heartbeat, timing.send_timeout).await
                    || !matches!(
                        timeout(timing.send_timeout, sender.send(Message::Ping(Bytes::new()))).await,
                        Ok(Ok(()))
                    )
                {
                    break;
                }
            }
        }
    }

    info!(client_id = %client.client_id, "stream closed");
}

async fn send_within(
    sender: &mut SplitSink<WebSocket, Message>,
    frame: &ServerFrame,
    limit: Duration,
) -> bool {
    match timeout(limit, send_frame(sender, frame)).await {
        Ok(result) => result.is_ok(),
        Err(_) => {
            warn!(?limit, "client stopped reading; closing stream");
            false
        }
    }
}

async fn send_frame(
    sender: &mut SplitSink<WebSocket, Message>,
    frame: &ServerFrame,
) -> Result<(), axum::Error> {
    let json = match serde_json::to_string(frame) {
        Ok(json) => json,
        Err(err) => {
            warn!(error = %err, "failed to encode frame");
            return Ok(());
        }
    };
    sender.send(Message::Text(json.into())).await
}

/// Applies one client frame to the hub and returns the reply frame.
pub(crate) async fn handle_client_frame(
    hub: &SharedFanoutHub,
    client_id: Uuid,
    text: &str,
) -> ServerFrame {
    let frame = match serde_json::from_str::<ClientFrame>(text) {
        Ok(frame) => frame,
        Err(err) => {
            return ServerFrame::Error {
                subscription_id: None,
                code: "invalid_frame".into(),
                message: err.to_string(),
            };
        }
    };

    match frame {
        ClientFrame::Subscribe(request) => match hub.subscribe(client_id, &request).await {
            Ok(()) => ServerFrame::Subscribed {
                subscription_id: request.subscription_id,
            },
            Err(err) => ServerFrame::Error {
                subscription_id: Some(request.subscription_id),
                code: err.code().into(),
                message: err.to_string(),
            },
        },
        ClientFrame::Unsubscribe { subscription_id } => {
            hub.unsubscribe(client_id, &subscription_id).await;
            ServerFrame::Unsubscribed { subscription_id }
        }
        ClientFrame::Ping => ServerFrame::Pong,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{broker::memory::MemoryBroker, services::FanoutHub};
    use shared::config::server::StreamConfig;

    async fn connected() -> (SharedFanoutHub, ClientHandle) {
        let hub = FanoutHub::new(
            Arc::new(MemoryBroker::new(16)),
            StreamConfig::default(),
            Duration::from_millis(10),
        );
        let client = hub.connect(Uuid::new_v4()).await.unwrap();
        (hub, client)
    }

    #[tokio::test]
    async fn subscribe_frames_are_acknowledged() {
        let (hub, client) = connected().await;
        let chat_id = Uuid::new_v4();
        let text = format!(
            r#"{{"type":"subscribe","subscription_id":"s1","topic":"message.created","chat_id":"{chat_id}"}}"#
        );

        let reply = handle_client_frame(&hub, client.client_id, &text).await;
        assert_eq!(
            reply,
            ServerFrame::Subscribed {
                subscription_id: "s1".into()
            }
        );

        let reply = handle_client_frame(
            &hub,
            client.client_id,
            r#"{"type":"unsubscribe","subscription_id":"s1"}"#,
        )
        .await;
        assert_eq!(
            reply,
            ServerFrame::Unsubscribed {
                subscription_id: "s1".into()
            }
        );
    }

    #[tokio::test]
    async fn invalid_subscriptions_report_errors() {
        let (hub, client) = connected().await;

        let reply = handle_client_frame(
            &hub,
            client.client_id,
            r#"{"type":"subscribe","subscription_id":"s1","topic":"message.created"}"#,
        )
        .await;
        assert!(matches!(
            reply,
            ServerFrame::Error { ref code, subscription_id: Some(ref id), .. }
                if code == "invalid_subscription" && id == "s1"
        ));

        let reply = handle_client_frame(&hub, client.client_id, "not json").await;
        assert!(matches!(reply, ServerFrame::Error { ref code, .. } if code == "invalid_frame"));
    }

    #[tokio::test]
    async fn ping_gets_pong() {
        let (hub, client) = connected().await;
        let reply = handle_client_frame(&hub, client.client_id, r#"{"type":"ping"}"#).await;
        assert_eq!(reply, ServerFrame::Pong);
    }
}
