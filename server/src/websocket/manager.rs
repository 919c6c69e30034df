//! WebSocket connection manager.
//!
//! Tracks active realtime connections and the change-feed subscriptions each
//! of them holds, so that everything a socket opened is released when it
//! goes away.

use std::sync::Arc;

use dashmap::DashMap;
use livesync_client::{FeedId, RemoteSource};
use livesync_engine::{ServerMessage, SubscriptionId};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Sender for WebSocket messages.
pub type MessageSender = mpsc::UnboundedSender<ServerMessage>;

/// A store feed forwarded to one socket.
#[derive(Debug)]
pub struct Subscription {
    pub collection: String,
    /// Feed id in the store
    pub feed_id: FeedId,
    /// Task forwarding feed signals to the socket
    pub forward: JoinHandle<()>,
}

impl Subscription {
    fn release(self, store: &dyn RemoteSource) {
        self.forward.abort();
        store.unsubscribe(&self.feed_id);
    }
}

/// A single WebSocket connection.
#[derive(Debug)]
pub struct Connection {
    /// Unique identifier for this connection
    pub id: String,
    /// Channel to send messages to this connection
    pub sender: MessageSender,
    /// Open subscriptions, keyed by subscription ID
    pub subscriptions: DashMap<SubscriptionId, Subscription>,
}

/// Manages active WebSocket connections.
///
/// Thread-safe and can be shared across handlers via `Arc`.
#[derive(Debug, Default)]
pub struct ConnectionManager {
    /// All active connections, keyed by connection ID.
    connections: DashMap<String, Connection>,
}

impl ConnectionManager {
    /// Create a new connection manager.
    pub fn new() -> Self {
        Self {
            connections: DashMap::new(),
        }
    }

    /// Create a new connection manager wrapped in Arc for sharing.
    pub fn new_shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Register a new connection.
    ///
    /// Returns the connection ID.
    pub fn register(&self, sender: MessageSender) -> String {
        let conn_id = uuid::Uuid::new_v4().to_string();

        self.connections.insert(
            conn_id.clone(),
            Connection {
                id: conn_id.clone(),
                sender,
                subscriptions: DashMap::new(),
            },
        );

        tracing::info!(conn_id = %conn_id, "WebSocket connection registered");

        conn_id
    }

    /// Unregister a connection and release its subscriptions.
    pub fn unregister(&self, conn_id: &str, store: &dyn RemoteSource) {
        if let Some((_, conn)) = self.connections.remove(conn_id) {
            let released = conn.subscriptions.len();
            for (_, subscription) in conn.subscriptions {
                subscription.release(store);
            }

            tracing::info!(
                conn_id = %conn_id,
                released,
                "WebSocket connection unregistered"
            );
        }
    }

    /// Attach a subscription to a connection.
    ///
    /// Returns false (and releases the subscription) if the connection is gone.
    pub fn add_subscription(
        &self,
        conn_id: &str,
        subscription_id: SubscriptionId,
        subscription: Subscription,
        store: &dyn RemoteSource,
    ) -> bool {
        match self.connections.get(conn_id) {
            Some(conn) => {
                conn.subscriptions.insert(subscription_id, subscription);
                true
            }
            None => {
                subscription.release(store);
                false
            }
        }
    }

    /// Close one subscription. Returns false if it was not open.
    pub fn remove_subscription(
        &self,
        conn_id: &str,
        subscription_id: &str,
        store: &dyn RemoteSource,
    ) -> bool {
        let removed = self
            .connections
            .get(conn_id)
            .and_then(|conn| conn.subscriptions.remove(subscription_id));
        match removed {
            Some((_, subscription)) => {
                tracing::debug!(
                    conn_id = %conn_id,
                    subscription_id = %subscription_id,
                    collection = %subscription.collection,
                    "Subscription closed"
                );
                subscription.release(store);
                true
            }
            None => false,
        }
    }

    /// Forget a subscription whose feed ended on its own.
    pub fn forget_subscription(&self, conn_id: &str, subscription_id: &str) {
        if let Some(conn) = self.connections.get(conn_id) {
            conn.subscriptions.remove(subscription_id);
        }
    }

    /// Send a message to a specific connection.
    pub fn send_to(&self, conn_id: &str, message: ServerMessage) -> bool {
        if let Some(conn) = self.connections.get(conn_id) {
            conn.sender.send(message).is_ok()
        } else {
            false
        }
    }

    /// Get the number of active connections.
    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Get the number of open subscriptions across all connections.
    pub fn subscription_count(&self) -> usize {
        self.connections
            .iter()
            .map(|conn| conn.subscriptions.len())
            .sum()
    }
}
