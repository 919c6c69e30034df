//! Live collection sessions.
//!
//! A [`Session`] keeps a [`Mirror`] of one `(collection, filter)` pair in sync
//! with a remote source: it loads the matching records once, applies the
//! change feed on top, and reconnects with backoff when the feed drops.
//!
//! Each session runs a single driver task that owns the mirror. Consumers
//! read cloned [`MirrorSnapshot`]s through a `watch` channel.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use livesync_engine::{
    CollectionName, Failure, FeedState, Filter, LoadSnapshot, LoadState, Mirror, MirrorSnapshot,
    Record,
};
use tokio::sync::{mpsc, watch};
use tokio::task::{JoinError, JoinHandle};
use tokio::time::Instant;

use crate::config::SyncConfig;
use crate::error::{ClientError, Result};
use crate::manager::{ConnectionManager, FeedLease};
use crate::source::{FeedSignal, RemoteSource};

/// Opens sessions against a shared connection manager.
#[derive(Debug, Clone)]
pub struct Synchronizer {
    manager: Arc<ConnectionManager>,
    config: SyncConfig,
}

impl Synchronizer {
    /// Create a synchronizer with its own connection manager.
    pub fn new(source: Arc<dyn RemoteSource>, config: SyncConfig) -> Self {
        Self::with_manager(ConnectionManager::new_shared(source), config)
    }

    /// Create a synchronizer that shares an existing manager.
    pub fn with_manager(manager: Arc<ConnectionManager>, config: SyncConfig) -> Self {
        Self { manager, config }
    }

    pub fn manager(&self) -> &Arc<ConnectionManager> {
        &self.manager
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// Start mirroring `collection`, optionally restricted by `filter`.
    ///
    /// Must be called from within a tokio runtime.
    pub fn open(
        &self,
        collection: impl Into<CollectionName>,
        filter: Option<Filter>,
    ) -> Result<Session> {
        Session::start(
            self.manager.clone(),
            self.config.clone(),
            collection.into(),
            filter,
        )
    }
}

#[derive(Debug)]
enum Command {
    Retry,
    Close,
}

/// Publishes snapshots until the session closes.
#[derive(Debug, Clone)]
struct Publisher(Arc<Mutex<Option<watch::Sender<MirrorSnapshot>>>>);

impl Publisher {
    fn publish(&self, snapshot: MirrorSnapshot) {
        let guard = self.0.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(sender) = guard.as_ref() {
            sender.send_replace(snapshot);
        }
    }

    /// Stop publishing. The last snapshot is marked closed and frozen.
    /// Returns false when already closed.
    fn close(&self) -> bool {
        let sender = self
            .0
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        match sender {
            Some(sender) => {
                sender.send_modify(|snapshot| snapshot.feed = FeedState::Closed);
                true
            }
            None => false,
        }
    }
}

/// A live view of one filtered collection.
///
/// Dropping the session closes it.
#[derive(Debug)]
pub struct Session {
    manager: Arc<ConnectionManager>,
    config: SyncConfig,
    collection: CollectionName,
    filter: Option<Filter>,
    commands: mpsc::UnboundedSender<Command>,
    status: watch::Receiver<MirrorSnapshot>,
    publisher: Publisher,
    closed: Arc<AtomicBool>,
    driver: JoinHandle<()>,
}

impl Session {
    fn start(
        manager: Arc<ConnectionManager>,
        config: SyncConfig,
        collection: CollectionName,
        filter: Option<Filter>,
    ) -> Result<Self> {
        let mirror = Mirror::new(collection.clone(), filter.clone(), config.scope)?;
        let (sender, status) = watch::channel(mirror.snapshot());
        let publisher = Publisher(Arc::new(Mutex::new(Some(sender))));
        let (commands, command_rx) = mpsc::unbounded_channel();

        let driver = Driver {
            manager: manager.clone(),
            config: config.clone(),
            mirror,
            published: 0,
            publisher: publisher.clone(),
            commands: command_rx,
            load: None,
            subscribing: None,
            lease: None,
            reconnect_at: None,
            attempt: 0,
            reload_on_subscribe: false,
        };

        tracing::info!(
            collection = %collection,
            filter = ?filter.as_ref().map(Filter::to_query_param),
            "Session opened"
        );

        Ok(Self {
            manager,
            config,
            collection,
            filter,
            commands,
            status,
            publisher,
            closed: Arc::new(AtomicBool::new(false)),
            driver: tokio::spawn(driver.run()),
        })
    }

    pub fn collection(&self) -> &str {
        &self.collection
    }

    pub fn filter(&self) -> Option<&Filter> {
        self.filter.as_ref()
    }

    /// The latest published snapshot (frozen after close).
    pub fn snapshot(&self) -> MirrorSnapshot {
        self.status.borrow().clone()
    }

    /// Current records, in mirror order.
    pub fn records(&self) -> Vec<Record> {
        self.status.borrow().records.clone()
    }

    /// True while a load is pending.
    pub fn loading(&self) -> bool {
        self.status.borrow().loading()
    }

    /// The surfaced failure, if any.
    pub fn error(&self) -> Option<Failure> {
        self.status.borrow().failure.clone()
    }

    /// A receiver that observes every published snapshot.
    pub fn watch(&self) -> watch::Receiver<MirrorSnapshot> {
        self.status.clone()
    }

    /// Wait for the next published snapshot.
    pub async fn changed(&mut self) -> Result<MirrorSnapshot> {
        if self.is_closed() {
            return Err(ClientError::Closed);
        }
        self.status
            .changed()
            .await
            .map_err(|_| ClientError::Closed)?;
        Ok(self.status.borrow_and_update().clone())
    }

    /// Wait until the pending load has either succeeded or failed.
    pub async fn wait_loaded(&mut self) -> Result<MirrorSnapshot> {
        let snapshot = self
            .status
            .wait_for(|snapshot| !snapshot.loading())
            .await
            .map_err(|_| ClientError::Closed)?;
        Ok(snapshot.clone())
    }

    /// Re-issue a failed load, or resubscribe a disconnected feed now.
    pub fn retry(&self) -> Result<()> {
        if self.is_closed() {
            return Err(ClientError::Closed);
        }
        self.commands
            .send(Command::Retry)
            .map_err(|_| ClientError::Closed)
    }

    /// Switch to a different filter. An equal filter is a no-op; otherwise
    /// the current session is torn down and a fresh one starts empty.
    pub fn set_filter(&mut self, filter: Option<Filter>) -> Result<()> {
        if self.filter == filter {
            return Ok(());
        }
        if self.is_closed() {
            return Err(ClientError::Closed);
        }

        let next = Session::start(
            self.manager.clone(),
            self.config.clone(),
            self.collection.clone(),
            filter,
        )?;
        self.close();
        *self = next;
        Ok(())
    }

    /// Stop syncing. Idempotent.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.publisher.close();
        let _ = self.commands.send(Command::Close);
        self.driver.abort();
        tracing::info!(collection = %self.collection, "Session closed");
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.close();
    }
}

/// Owns the mirror and reacts to loads, feed signals and commands.
struct Driver {
    manager: Arc<ConnectionManager>,
    config: SyncConfig,
    mirror: Mirror,
    /// Revision of the last published snapshot.
    published: u64,
    publisher: Publisher,
    commands: mpsc::UnboundedReceiver<Command>,
    load: Option<JoinHandle<Result<LoadSnapshot>>>,
    subscribing: Option<JoinHandle<Result<FeedLease>>>,
    lease: Option<FeedLease>,
    reconnect_at: Option<Instant>,
    /// Failed resubscription attempts since the feed was last live.
    attempt: u32,
    reload_on_subscribe: bool,
}

impl Drop for Driver {
    fn drop(&mut self) {
        if let Some(load) = self.load.take() {
            load.abort();
        }
        if let Some(subscribing) = self.subscribing.take() {
            subscribing.abort();
        }
    }
}

impl Driver {
    async fn run(mut self) {
        self.start_load();
        self.start_subscribe();

        loop {
            tokio::select! {
                biased;

                command = self.commands.recv() => match command {
                    Some(Command::Retry) => self.retry(),
                    Some(Command::Close) | None => {
                        self.mirror.close();
                        break;
                    }
                },
                result = join(&mut self.load) => {
                    self.load = None;
                    self.on_load(result);
                }
                result = join(&mut self.subscribing) => {
                    self.subscribing = None;
                    self.on_subscribed(result);
                }
                signal = next_signal(&mut self.lease) => self.on_signal(signal),
                _ = until(self.reconnect_at) => {
                    self.reconnect_at = None;
                    self.start_subscribe();
                }
            }

            self.publish();
        }
    }

    fn publish(&mut self) {
        if self.mirror.revision() != self.published {
            self.published = self.mirror.revision();
            self.publisher.publish(self.mirror.snapshot());
        }
    }

    fn start_load(&mut self) {
        if let Some(previous) = self.load.take() {
            previous.abort();
        }

        let manager = self.manager.clone();
        let collection = self.mirror.collection().to_string();
        let filter = self.mirror.filter().cloned();
        let limit = self.config.load_timeout;

        self.load = Some(tokio::spawn(async move {
            let query = manager.query(&collection, filter.as_ref());
            match limit {
                Some(limit) => tokio::time::timeout(limit, query)
                    .await
                    .map_err(|_| ClientError::Timeout(limit))?,
                None => query.await,
            }
        }));
    }

    fn start_subscribe(&mut self) {
        if self.subscribing.is_some() || self.lease.is_some() {
            return;
        }

        let manager = self.manager.clone();
        let collection = self.mirror.collection().to_string();
        let filter = self.mirror.filter().cloned();

        self.subscribing = Some(tokio::spawn(async move {
            manager.acquire(&collection, filter.as_ref()).await
        }));
    }

    fn on_load(&mut self, result: std::result::Result<Result<LoadSnapshot>, JoinError>) {
        let collection = self.mirror.collection().to_string();
        let outcome = match result {
            Ok(outcome) => outcome,
            Err(e) if e.is_cancelled() => return,
            Err(e) => Err(ClientError::Rejected(format!("load task failed: {}", e))),
        };

        match outcome {
            Ok(snapshot) => {
                let report = self.mirror.finish_load(snapshot);
                tracing::debug!(
                    collection = %collection,
                    loaded = report.loaded,
                    dropped = report.dropped,
                    replayed = report.replayed,
                    ignored = report.ignored,
                    "Load complete"
                );
            }
            Err(e) => {
                tracing::warn!(collection = %collection, "Load failed: {}", e);
                let report = self.mirror.fail_load(e.to_string());
                tracing::debug!(
                    collection = %collection,
                    replayed = report.replayed,
                    ignored = report.ignored,
                    "Replayed buffered events onto failed load"
                );
            }
        }
    }

    fn on_subscribed(&mut self, result: std::result::Result<Result<FeedLease>, JoinError>) {
        let outcome = match result {
            Ok(outcome) => outcome,
            Err(e) if e.is_cancelled() => return,
            Err(e) => Err(ClientError::Rejected(format!("subscribe task failed: {}", e))),
        };

        match outcome {
            Ok(lease) => {
                tracing::debug!(
                    collection = %self.mirror.collection(),
                    feed_id = %lease.feed_id(),
                    "Feed live"
                );
                self.lease = Some(lease);
                self.attempt = 0;
                self.mirror.set_feed_state(FeedState::Live);
                self.mirror.clear_subscription_failure();

                if std::mem::take(&mut self.reload_on_subscribe) {
                    // Events may have been missed while disconnected.
                    self.mirror.begin_load();
                    self.start_load();
                }
            }
            Err(e) => self.on_feed_lost(e.to_string()),
        }
    }

    fn on_signal(&mut self, signal: Option<FeedSignal>) {
        match signal {
            Some(FeedSignal::Change(event)) => {
                let kind = event.kind();
                let applied = self.mirror.apply(event);
                tracing::trace!(
                    collection = %self.mirror.collection(),
                    kind = ?kind,
                    applied = ?applied,
                    "Applied event"
                );
            }
            Some(FeedSignal::Disconnected(reason)) => self.on_feed_lost(reason),
            None => self.on_feed_lost("feed closed".to_string()),
        }
    }

    fn on_feed_lost(&mut self, reason: String) {
        self.lease = None;
        self.reload_on_subscribe = true;
        self.mirror.set_feed_state(FeedState::Disconnected);

        match self.config.reconnect.delay(self.attempt) {
            Some(delay) => {
                tracing::warn!(
                    collection = %self.mirror.collection(),
                    attempt = self.attempt + 1,
                    delay_ms = delay.as_millis() as u64,
                    "Feed lost ({}), resubscribing",
                    reason
                );
                self.attempt += 1;
                self.reconnect_at = Some(Instant::now() + delay);
            }
            None => {
                tracing::warn!(
                    collection = %self.mirror.collection(),
                    attempts = self.attempt,
                    "Feed lost ({}), giving up",
                    reason
                );
                self.mirror.fail_subscription(format!(
                    "{} (gave up after {} attempts)",
                    reason, self.attempt
                ));
            }
        }
    }

    fn retry(&mut self) {
        if self.load.is_none() && self.mirror.load_state() == LoadState::Failed {
            tracing::info!(collection = %self.mirror.collection(), "Retrying load");
            self.mirror.begin_load();
            self.start_load();
        }
        if self.lease.is_none() && self.subscribing.is_none() {
            tracing::info!(collection = %self.mirror.collection(), "Retrying subscription");
            self.reconnect_at = None;
            self.attempt = 0;
            self.start_subscribe();
        }
    }
}

/// Await a task slot, or never resolve when it is empty.
async fn join<T>(handle: &mut Option<JoinHandle<T>>) -> std::result::Result<T, JoinError> {
    match handle {
        Some(handle) => handle.await,
        None => std::future::pending().await,
    }
}

async fn next_signal(lease: &mut Option<FeedLease>) -> Option<FeedSignal> {
    match lease {
        Some(lease) => lease.recv().await,
        None => std::future::pending().await,
    }
}

async fn until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
