//! WebSocket handler for realtime change feeds.

use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket};
use futures::{SinkExt, StreamExt};
use livesync_client::{FeedSignal, MemorySource, RemoteSource};
use livesync_engine::{
    error::validate_collection, protocol, ClientMessage, EventKind, ServerMessage, SubscriptionId,
};
use tokio::sync::{mpsc, oneshot};

use super::{ConnectionManager, Subscription};

/// Handle an established WebSocket connection.
///
/// This function:
/// 1. Registers the connection with the manager
/// 2. Spawns a task to forward outgoing messages
/// 3. Processes incoming messages in a loop
/// 4. Releases the connection's subscriptions on disconnect
pub async fn handle_websocket_connection(
    socket: WebSocket,
    store: Arc<MemorySource>,
    conn_manager: Arc<ConnectionManager>,
) {
    let (mut ws_sender, mut ws_receiver) = socket.split();

    let (tx, mut rx) = mpsc::unbounded_channel::<ServerMessage>();
    let conn_id = conn_manager.register(tx);

    tracing::info!(conn_id = %conn_id, "WebSocket client connected");

    // Forward messages from channel to WebSocket
    let send_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            match protocol::encode(&msg) {
                Ok(text) => {
                    if let Err(e) = ws_sender.send(Message::Text(text.into())).await {
                        tracing::warn!("Failed to send WebSocket message: {}", e);
                        break;
                    }
                }
                Err(e) => {
                    tracing::error!("Failed to serialize WebSocket message: {}", e);
                }
            }
        }
    });

    while let Some(result) = ws_receiver.next().await {
        match result {
            Ok(Message::Text(text)) => {
                if let Some(response) =
                    process_message(text.as_str(), &store, &conn_manager, &conn_id).await
                {
                    conn_manager.send_to(&conn_id, response);
                }
            }
            Ok(Message::Binary(_)) => {
                tracing::warn!("Binary messages not supported");
            }
            Ok(Message::Ping(data)) => {
                tracing::trace!("Received ping: {} bytes", data.len());
            }
            Ok(Message::Pong(_)) => {
                tracing::trace!("Received pong");
            }
            Ok(Message::Close(_)) => {
                tracing::info!(conn_id = %conn_id, "WebSocket close frame received");
                break;
            }
            Err(e) => {
                tracing::warn!(conn_id = %conn_id, "WebSocket error: {}", e);
                break;
            }
        }
    }

    conn_manager.unregister(&conn_id, store.as_ref());
    send_task.abort();

    tracing::info!(
        conn_id = %conn_id,
        active_connections = conn_manager.connection_count(),
        "WebSocket client disconnected"
    );
}

/// Process a client message, returning the reply to send (if any).
async fn process_message(
    text: &str,
    store: &Arc<MemorySource>,
    conn_manager: &Arc<ConnectionManager>,
    conn_id: &str,
) -> Option<ServerMessage> {
    let client_msg: ClientMessage = match protocol::decode(text) {
        Ok(msg) => msg,
        Err(e) => return Some(ServerMessage::error(e.to_string(), None)),
    };

    match client_msg {
        ClientMessage::Subscribe {
            request_id,
            collection,
            filter,
            kinds,
        } => {
            if let Err(e) = validate_collection(&collection) {
                return Some(ServerMessage::error(e.to_string(), Some(request_id)));
            }

            let feed = match store.subscribe(&collection, filter.as_ref()).await {
                Ok(feed) => feed,
                Err(e) => return Some(ServerMessage::error(e.to_string(), Some(request_id))),
            };

            let subscription_id = uuid::Uuid::new_v4().to_string();

            // Acknowledge before any change for this subscription is queued
            conn_manager.send_to(
                conn_id,
                ServerMessage::Subscribed {
                    request_id,
                    subscription_id: subscription_id.clone(),
                },
            );

            // The forwarder starts only once the subscription is registered,
            // so a feed that ends immediately is still forgotten.
            let (ready, registered) = oneshot::channel();
            let forward = tokio::spawn(forward_feed(
                conn_manager.clone(),
                conn_id.to_string(),
                subscription_id.clone(),
                kinds,
                registered,
                feed.signals,
            ));

            let added = conn_manager.add_subscription(
                conn_id,
                subscription_id.clone(),
                Subscription {
                    collection: collection.clone(),
                    feed_id: feed.id,
                    forward,
                },
                store.as_ref(),
            );
            if added {
                let _ = ready.send(());
                tracing::debug!(
                    conn_id = %conn_id,
                    subscription_id = %subscription_id,
                    collection = %collection,
                    "Subscription opened"
                );
            }
            None
        }

        ClientMessage::Unsubscribe { subscription_id } => {
            if conn_manager.remove_subscription(conn_id, &subscription_id, store.as_ref()) {
                Some(ServerMessage::Unsubscribed { subscription_id })
            } else {
                Some(ServerMessage::error(
                    format!("unknown subscription {}", subscription_id),
                    None,
                ))
            }
        }

        ClientMessage::Ping => Some(ServerMessage::Pong),
    }
}

/// Relay one store feed to a socket until the feed or the socket ends.
async fn forward_feed(
    conn_manager: Arc<ConnectionManager>,
    conn_id: String,
    subscription_id: SubscriptionId,
    kinds: Vec<EventKind>,
    registered: oneshot::Receiver<()>,
    mut signals: mpsc::UnboundedReceiver<FeedSignal>,
) {
    if registered.await.is_err() {
        return;
    }

    while let Some(signal) = signals.recv().await {
        match signal {
            FeedSignal::Change(event) => {
                if !kinds.is_empty() && !kinds.contains(&event.kind()) {
                    continue;
                }
                let message = ServerMessage::change(subscription_id.clone(), event);
                if !conn_manager.send_to(&conn_id, message) {
                    return;
                }
            }
            FeedSignal::Disconnected(reason) => {
                tracing::info!(
                    conn_id = %conn_id,
                    subscription_id = %subscription_id,
                    reason = %reason,
                    "Store feed ended"
                );
                break;
            }
        }
    }

    conn_manager.forget_subscription(&conn_id, &subscription_id);
    conn_manager.send_to(&conn_id, ServerMessage::Unsubscribed { subscription_id });
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    async fn recv(rx: &mut mpsc::UnboundedReceiver<ServerMessage>) -> ServerMessage {
        tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap()
    }

    #[tokio::test]
    async fn test_subscribe_acknowledges_then_forwards() {
        let store = Arc::new(MemorySource::new());
        let manager = ConnectionManager::new_shared();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let conn_id = manager.register(tx);

        let request = r#"{"type":"subscribe","request_id":"req-1","collection":"projects"}"#;
        assert!(process_message(request, &store, &manager, &conn_id)
            .await
            .is_none());
        assert_eq!(manager.subscription_count(), 1);

        let subscription_id = match recv(&mut rx).await {
            ServerMessage::Subscribed {
                request_id,
                subscription_id,
            } => {
                assert_eq!(request_id, "req-1");
                subscription_id
            }
            other => panic!("Expected subscribed, got {:?}", other),
        };

        store
            .insert(
                "projects",
                livesync_engine::Record::new("1", serde_json::json!({"title": "x"})).unwrap(),
            )
            .unwrap();
        match recv(&mut rx).await {
            ServerMessage::Change {
                subscription_id: id,
                ..
            } => assert_eq!(id, subscription_id),
            other => panic!("Expected change, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_feed_ending_at_once_is_forgotten() {
        let store = Arc::new(MemorySource::new());
        let manager = ConnectionManager::new_shared();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let conn_id = manager.register(tx);

        let request = r#"{"type":"subscribe","request_id":"req-1","collection":"projects"}"#;
        process_message(request, &store, &manager, &conn_id).await;
        store.disconnect_all("store restart");

        assert!(matches!(recv(&mut rx).await, ServerMessage::Subscribed { .. }));
        assert!(matches!(
            recv(&mut rx).await,
            ServerMessage::Unsubscribed { .. }
        ));
        assert_eq!(manager.subscription_count(), 0);
        assert_eq!(manager.connection_count(), 1);
    }
}
