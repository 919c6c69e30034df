//! HTTP + WebSocket source for a livesync-compatible backend.
//!
//! Queries go over REST (`GET /rest/{collection}?{field}=eq.{value}`).
//! Change feeds share one realtime socket (`/realtime`) per source: each
//! subscribe request is correlated by a request id, and the server's
//! subscription id becomes the feed id. When the socket drops, every feed
//! receives [`FeedSignal::Disconnected`] and the next subscribe reconnects.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use futures::{SinkExt, StreamExt};
use livesync_engine::{
    protocol, ClientMessage, EventKind, Filter, LoadSnapshot, QueryResponse, ServerMessage,
    SubscriptionId,
};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{Instant, Interval};
use tokio_tungstenite::tungstenite::Message;
use url::Url;

use super::{Feed, FeedSignal, RemoteSource};
use crate::config::{ConfigError, SyncConfig};
use crate::error::{ClientError, Result};

/// How long to wait for the server to acknowledge a subscribe request.
const SUBSCRIBE_TIMEOUT: Duration = Duration::from_secs(10);

/// Heartbeat periods without any inbound frame before the socket is dropped.
const MISSED_HEARTBEATS: u32 = 2;

type Ack = std::result::Result<(SubscriptionId, mpsc::UnboundedReceiver<FeedSignal>), String>;

/// State shared between a socket's reader task and its users.
#[derive(Debug)]
struct Shared {
    alive: AtomicBool,
    /// When the last frame arrived from the server.
    last_heard: Mutex<Instant>,
    /// Subscribe requests awaiting `subscribed`, by request id.
    pending: DashMap<String, oneshot::Sender<Ack>>,
    /// Open feeds, by subscription id.
    feeds: DashMap<SubscriptionId, mpsc::UnboundedSender<FeedSignal>>,
}

impl Shared {
    fn new() -> Self {
        Self {
            alive: AtomicBool::new(false),
            last_heard: Mutex::new(Instant::now()),
            pending: DashMap::new(),
            feeds: DashMap::new(),
        }
    }

    fn heard(&self) {
        *self.last_heard.lock().unwrap_or_else(PoisonError::into_inner) = Instant::now();
    }

    fn silent_for(&self) -> Duration {
        self.last_heard
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .elapsed()
    }

    fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    /// Mark the socket dead and release everyone waiting on it.
    fn shutdown(&self, reason: &str) {
        self.alive.store(false, Ordering::SeqCst);

        let ids: Vec<SubscriptionId> = self.feeds.iter().map(|e| e.key().clone()).collect();
        for id in ids {
            if let Some((_, sender)) = self.feeds.remove(&id) {
                let _ = sender.send(FeedSignal::Disconnected(reason.to_string()));
            }
        }
        self.pending.clear();
    }
}

/// Cheap handle for talking to a live socket.
#[derive(Debug, Clone)]
struct Link {
    outgoing: mpsc::UnboundedSender<ClientMessage>,
    shared: Arc<Shared>,
}

/// A realtime socket and the tasks driving it.
#[derive(Debug)]
struct Connection {
    link: Link,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.reader.abort();
        self.writer.abort();
        self.link.shared.shutdown("connection replaced");
    }
}

impl Connection {
    async fn open(url: &Url, heartbeat: Option<Duration>) -> Result<Self> {
        let (socket, _) = tokio_tungstenite::connect_async(url.as_str()).await?;
        let (mut ws_sender, mut ws_receiver) = socket.split();
        let (outgoing, mut rx) = mpsc::unbounded_channel::<ClientMessage>();

        let shared = Arc::new(Shared::new());
        shared.alive.store(true, Ordering::SeqCst);

        tracing::info!(url = %url, "Realtime socket connected");

        // Forward outgoing messages and heartbeats to the socket
        let writer_shared = shared.clone();
        let writer = tokio::spawn(async move {
            let mut ticker = heartbeat.map(|period| {
                tokio::time::interval_at(tokio::time::Instant::now() + period, period)
            });
            loop {
                let message = tokio::select! {
                    msg = rx.recv() => match msg {
                        Some(msg) => msg,
                        None => break,
                    },
                    _ = tick(&mut ticker) => {
                        let deadline = heartbeat.map(|period| period * MISSED_HEARTBEATS);
                        if deadline.is_some_and(|deadline| writer_shared.silent_for() > deadline) {
                            tracing::warn!("Realtime heartbeat unanswered");
                            writer_shared.shutdown("heartbeat timeout");
                            break;
                        }
                        ClientMessage::Ping
                    }
                };

                let text = match protocol::encode(&message) {
                    Ok(text) => text,
                    Err(e) => {
                        tracing::error!("Failed to encode realtime message: {}", e);
                        continue;
                    }
                };
                if let Err(e) = ws_sender.send(Message::Text(text.into())).await {
                    tracing::warn!("Failed to send realtime message: {}", e);
                    writer_shared.shutdown("send failed");
                    break;
                }
            }
        });

        // Dispatch incoming messages to feeds
        let reader_shared = shared.clone();
        let reader_outgoing = outgoing.clone();
        let reader = tokio::spawn(async move {
            let reason = loop {
                let frame = ws_receiver.next().await;
                if let Some(Ok(_)) = frame {
                    reader_shared.heard();
                }
                match frame {
                    Some(Ok(Message::Text(text))) => {
                        dispatch(text.as_str(), &reader_shared, &reader_outgoing);
                    }
                    Some(Ok(Message::Binary(_))) => {
                        tracing::warn!("Binary realtime messages not supported");
                    }
                    Some(Ok(Message::Close(_))) => break "closed by server".to_string(),
                    Some(Ok(_)) => {}
                    Some(Err(e)) => break e.to_string(),
                    None => break "socket ended".to_string(),
                }
            };

            tracing::info!(reason = %reason, "Realtime socket disconnected");
            reader_shared.shutdown(&reason);
        });

        Ok(Self {
            link: Link { outgoing, shared },
            reader,
            writer,
        })
    }
}

async fn tick(ticker: &mut Option<Interval>) {
    match ticker {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}

/// Route one server message.
fn dispatch(text: &str, shared: &Shared, outgoing: &mpsc::UnboundedSender<ClientMessage>) {
    let message: ServerMessage = match protocol::decode(text) {
        Ok(message) => message,
        Err(e) => {
            tracing::warn!("Ignoring realtime message: {}", e);
            return;
        }
    };

    match message {
        ServerMessage::Subscribed {
            request_id,
            subscription_id,
        } => {
            let Some((_, ack)) = shared.pending.remove(&request_id) else {
                // Nobody is waiting any more; release the server side.
                let _ = outgoing.send(ClientMessage::Unsubscribe { subscription_id });
                return;
            };
            let (sender, signals) = mpsc::unbounded_channel();
            shared.feeds.insert(subscription_id.clone(), sender);
            if ack.send(Ok((subscription_id.clone(), signals))).is_err() {
                shared.feeds.remove(&subscription_id);
                let _ = outgoing.send(ClientMessage::Unsubscribe { subscription_id });
            }
        }
        ServerMessage::Change {
            subscription_id,
            event,
        } => {
            let delivered = shared
                .feeds
                .get(&subscription_id)
                .map(|sender| sender.send(FeedSignal::Change(event)).is_ok());
            if delivered == Some(false) {
                shared.feeds.remove(&subscription_id);
                let _ = outgoing.send(ClientMessage::Unsubscribe { subscription_id });
            }
        }
        ServerMessage::Unsubscribed { subscription_id } => {
            if let Some((_, sender)) = shared.feeds.remove(&subscription_id) {
                let _ = sender.send(FeedSignal::Disconnected("unsubscribed by server".into()));
            }
        }
        ServerMessage::Pong => tracing::trace!("Received pong"),
        ServerMessage::Error {
            message,
            request_id,
        } => match request_id.and_then(|id| shared.pending.remove(&id)) {
            Some((_, ack)) => {
                let _ = ack.send(Err(message));
            }
            None => tracing::warn!(message = %message, "Realtime server error"),
        },
    }
}

/// Source talking to a livesync server over HTTP and WebSocket.
#[derive(Debug)]
pub struct HttpSource {
    http: reqwest::Client,
    base: Url,
    realtime: Url,
    heartbeat: Option<Duration>,
    current: Mutex<Option<Connection>>,
    connecting: tokio::sync::Mutex<()>,
}

impl HttpSource {
    /// Create a source for the backend at `base`.
    pub fn new(base: Url) -> Result<Self> {
        let mut realtime = base.clone();
        let scheme = if base.scheme() == "https" { "wss" } else { "ws" };
        realtime
            .set_scheme(scheme)
            .map_err(|_| ClientError::Config(ConfigError::InvalidUrl(base.to_string())))?;
        realtime
            .path_segments_mut()
            .map_err(|_| ClientError::Config(ConfigError::InvalidUrl(base.to_string())))?
            .pop_if_empty()
            .push("realtime");

        Ok(Self {
            http: reqwest::Client::new(),
            base,
            realtime,
            heartbeat: None,
            current: Mutex::new(None),
            connecting: tokio::sync::Mutex::new(()),
        })
    }

    /// Create a source from configuration.
    pub fn from_config(config: &SyncConfig) -> Result<Self> {
        let base = config.url.clone().ok_or(ConfigError::MissingUrl)?;
        Ok(Self::new(base)?.with_heartbeat(config.heartbeat_interval))
    }

    /// Ping the realtime socket at this interval.
    pub fn with_heartbeat(mut self, interval: Option<Duration>) -> Self {
        self.heartbeat = interval;
        self
    }

    /// URL of the realtime endpoint.
    pub fn realtime_url(&self) -> &Url {
        &self.realtime
    }

    /// Whether a realtime socket is currently open.
    pub fn is_connected(&self) -> bool {
        self.live_link().is_some()
    }

    fn collection_url(&self, collection: &str, filter: Option<&Filter>) -> Result<Url> {
        let mut url = self.base.clone();
        url.path_segments_mut()
            .map_err(|_| ClientError::Config(ConfigError::InvalidUrl(self.base.to_string())))?
            .pop_if_empty()
            .push("rest")
            .push(collection);
        if let Some(filter) = filter {
            let (field, value) = filter.to_query_param();
            url.query_pairs_mut().append_pair(&field, &value);
        }
        Ok(url)
    }

    fn lock_current(&self) -> MutexGuard<'_, Option<Connection>> {
        self.current.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn live_link(&self) -> Option<Link> {
        self.lock_current()
            .as_ref()
            .filter(|conn| conn.link.shared.is_alive())
            .map(|conn| conn.link.clone())
    }

    /// Get a live socket, connecting if needed.
    async fn link(&self) -> Result<Link> {
        if let Some(link) = self.live_link() {
            return Ok(link);
        }

        let _guard = self.connecting.lock().await;
        if let Some(link) = self.live_link() {
            return Ok(link);
        }

        let conn = Connection::open(&self.realtime, self.heartbeat).await?;
        let link = conn.link.clone();
        *self.lock_current() = Some(conn);
        Ok(link)
    }
}

#[async_trait]
impl RemoteSource for HttpSource {
    async fn query(&self, collection: &str, filter: Option<&Filter>) -> Result<LoadSnapshot> {
        let url = self.collection_url(collection, filter)?;
        let response = self.http.get(url).send().await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ClientError::Rejected(format!("{}: {}", status, body)));
        }

        let body: QueryResponse = response.json().await?;
        Ok(LoadSnapshot {
            records: body.records,
            sequence: body.sequence,
        })
    }

    async fn subscribe(&self, collection: &str, filter: Option<&Filter>) -> Result<Feed> {
        let link = self.link().await?;

        let request_id = uuid::Uuid::new_v4().to_string();
        let (ack_tx, ack_rx) = oneshot::channel();
        link.shared.pending.insert(request_id.clone(), ack_tx);

        let request = ClientMessage::Subscribe {
            request_id: request_id.clone(),
            collection: collection.to_string(),
            filter: filter.cloned(),
            kinds: EventKind::ALL.to_vec(),
        };
        if link.outgoing.send(request).is_err() {
            link.shared.pending.remove(&request_id);
            return Err(ClientError::Disconnected("realtime socket closed".into()));
        }

        let ack = match tokio::time::timeout(SUBSCRIBE_TIMEOUT, ack_rx).await {
            Ok(Ok(ack)) => ack,
            Ok(Err(_)) => {
                return Err(ClientError::Disconnected(
                    "socket closed before subscribe was acknowledged".into(),
                ))
            }
            Err(_) => {
                link.shared.pending.remove(&request_id);
                return Err(ClientError::Timeout(SUBSCRIBE_TIMEOUT));
            }
        };

        let (id, signals) = ack.map_err(ClientError::Rejected)?;
        tracing::debug!(subscription_id = %id, collection, "Realtime feed opened");
        Ok(Feed { id, signals })
    }

    fn unsubscribe(&self, id: &str) {
        let Some(link) = self.live_link() else {
            return;
        };
        if link.shared.feeds.remove(id).is_some() {
            let _ = link.outgoing.send(ClientMessage::Unsubscribe {
                subscription_id: id.to_string(),
            });
            tracing::debug!(subscription_id = %id, "Realtime feed closed");
        }
    }
}
