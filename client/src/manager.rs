//! Shared change-feed connection manager.
//!
//! Sessions never subscribe to a source directly. They borrow a [`FeedLease`]
//! from the manager, which keeps one upstream feed per `(collection, filter)`
//! and fans its signals out to every lease holder. Dropping the last lease
//! for a key unsubscribes upstream.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use dashmap::DashMap;
use livesync_engine::{CollectionName, Filter, LoadSnapshot};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::error::Result;
use crate::source::{Feed, FeedId, FeedSignal, RemoteSource};

type LeaseId = u64;

/// Registry key: collection plus the filter's query-parameter form.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct FeedKey {
    collection: CollectionName,
    filter: Option<(String, String)>,
}

impl FeedKey {
    fn new(collection: &str, filter: Option<&Filter>) -> Self {
        Self {
            collection: collection.to_string(),
            filter: filter.map(Filter::to_query_param),
        }
    }
}

/// Lease holders of one upstream feed.
#[derive(Debug, Default)]
struct Fanout {
    leases: DashMap<LeaseId, mpsc::UnboundedSender<FeedSignal>>,
    /// Set once the upstream disconnected; no lease may attach afterwards.
    ended: AtomicBool,
}

impl Fanout {
    fn broadcast(&self, signal: &FeedSignal) {
        let mut gone = Vec::new();
        for entry in self.leases.iter() {
            if entry.value().send(signal.clone()).is_err() {
                gone.push(*entry.key());
            }
        }
        for id in gone {
            self.leases.remove(&id);
        }
    }

    fn end(&self, reason: &str) {
        self.ended.store(true, Ordering::SeqCst);
        let signal = FeedSignal::Disconnected(reason.to_string());
        let ids: Vec<LeaseId> = self.leases.iter().map(|e| *e.key()).collect();
        for id in ids {
            if let Some((_, sender)) = self.leases.remove(&id) {
                let _ = sender.send(signal.clone());
            }
        }
    }

    fn is_ended(&self) -> bool {
        self.ended.load(Ordering::SeqCst)
    }
}

#[derive(Debug)]
struct Upstream {
    feed_id: FeedId,
    generation: u64,
    fanout: Arc<Fanout>,
    pump: JoinHandle<()>,
}

/// Shares upstream change feeds between sessions.
pub struct ConnectionManager {
    source: Arc<dyn RemoteSource>,
    upstreams: DashMap<FeedKey, Upstream>,
    next_lease: AtomicU64,
    next_generation: AtomicU64,
    /// Serializes upstream creation so a key is never subscribed twice.
    opening: tokio::sync::Mutex<()>,
}

impl std::fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("upstreams", &self.upstreams.len())
            .field("leases", &self.lease_count())
            .finish()
    }
}

impl ConnectionManager {
    /// Create a manager over the given source.
    pub fn new(source: Arc<dyn RemoteSource>) -> Self {
        Self {
            source,
            upstreams: DashMap::new(),
            next_lease: AtomicU64::new(1),
            next_generation: AtomicU64::new(1),
            opening: tokio::sync::Mutex::new(()),
        }
    }

    /// Create a manager wrapped in Arc for sharing.
    pub fn new_shared(source: Arc<dyn RemoteSource>) -> Arc<Self> {
        Arc::new(Self::new(source))
    }

    /// The wrapped source.
    pub fn source(&self) -> &Arc<dyn RemoteSource> {
        &self.source
    }

    /// Query the source.
    pub async fn query(&self, collection: &str, filter: Option<&Filter>) -> Result<LoadSnapshot> {
        self.source.query(collection, filter).await
    }

    /// Borrow a change feed for `(collection, filter)`, subscribing upstream
    /// if no live feed exists for that key yet.
    pub async fn acquire(
        self: &Arc<Self>,
        collection: &str,
        filter: Option<&Filter>,
    ) -> Result<FeedLease> {
        let key = FeedKey::new(collection, filter);
        let lease_id = self.next_lease.fetch_add(1, Ordering::SeqCst);
        let (sender, signals) = mpsc::unbounded_channel();

        let _guard = self.opening.lock().await;

        if let Some((generation, feed_id)) = self.attach(&key, lease_id, &sender) {
            return Ok(FeedLease {
                manager: self.clone(),
                key,
                generation,
                id: lease_id,
                feed_id,
                signals,
            });
        }

        let Feed {
            id: feed_id,
            signals: upstream,
        } = self.source.subscribe(collection, filter).await?;

        let generation = self.next_generation.fetch_add(1, Ordering::SeqCst);
        let fanout = Arc::new(Fanout::default());
        fanout.leases.insert(lease_id, sender);

        let pump = tokio::spawn(pump(
            Arc::downgrade(self),
            key.clone(),
            generation,
            fanout.clone(),
            upstream,
        ));

        tracing::debug!(
            collection = %key.collection,
            feed_id = %feed_id,
            "Upstream feed opened"
        );

        if let Some(stale) = self.upstreams.insert(
            key.clone(),
            Upstream {
                feed_id: feed_id.clone(),
                generation,
                fanout,
                pump,
            },
        ) {
            stale.pump.abort();
        }

        Ok(FeedLease {
            manager: self.clone(),
            key,
            generation,
            id: lease_id,
            feed_id,
            signals,
        })
    }

    /// Join an existing live upstream, returning its generation and feed id.
    fn attach(
        &self,
        key: &FeedKey,
        lease_id: LeaseId,
        sender: &mpsc::UnboundedSender<FeedSignal>,
    ) -> Option<(u64, FeedId)> {
        let upstream = self.upstreams.get(key)?;
        if upstream.fanout.is_ended() {
            return None;
        }

        upstream.fanout.leases.insert(lease_id, sender.clone());
        if upstream.fanout.is_ended() {
            // Lost the race with a disconnect; open a new upstream instead.
            upstream.fanout.leases.remove(&lease_id);
            return None;
        }

        Some((upstream.generation, upstream.feed_id.clone()))
    }

    fn release(&self, key: &FeedKey, generation: u64, lease_id: LeaseId) {
        let last = match self.upstreams.get(key) {
            Some(upstream) if upstream.generation == generation => {
                upstream.fanout.leases.remove(&lease_id);
                upstream.fanout.leases.is_empty()
            }
            _ => false,
        };
        if !last {
            return;
        }

        if let Some((_, upstream)) = self.upstreams.remove_if(key, |_, upstream| {
            upstream.generation == generation && upstream.fanout.leases.is_empty()
        }) {
            upstream.pump.abort();
            self.source.unsubscribe(&upstream.feed_id);
            tracing::debug!(
                collection = %key.collection,
                feed_id = %upstream.feed_id,
                "Upstream feed released"
            );
        }
    }

    fn forget(&self, key: &FeedKey, generation: u64) {
        self.upstreams
            .remove_if(key, |_, upstream| upstream.generation == generation);
    }

    /// Number of live upstream feeds.
    pub fn upstream_count(&self) -> usize {
        self.upstreams
            .iter()
            .filter(|e| !e.value().fanout.is_ended())
            .count()
    }

    /// Number of outstanding leases across all upstreams.
    pub fn lease_count(&self) -> usize {
        self.upstreams
            .iter()
            .map(|e| e.value().fanout.leases.len())
            .sum()
    }
}

/// Forward upstream signals to every lease until the upstream ends.
async fn pump(
    manager: Weak<ConnectionManager>,
    key: FeedKey,
    generation: u64,
    fanout: Arc<Fanout>,
    mut upstream: mpsc::UnboundedReceiver<FeedSignal>,
) {
    let reason = loop {
        match upstream.recv().await {
            Some(FeedSignal::Disconnected(reason)) => break reason,
            Some(signal) => fanout.broadcast(&signal),
            None => break "feed ended".to_string(),
        }
    };

    tracing::info!(
        collection = %key.collection,
        reason = %reason,
        "Upstream feed disconnected"
    );
    fanout.end(&reason);
    if let Some(manager) = manager.upgrade() {
        manager.forget(&key, generation);
    }
}

/// A borrowed change feed. Dropping it returns the lease.
#[derive(Debug)]
pub struct FeedLease {
    manager: Arc<ConnectionManager>,
    key: FeedKey,
    generation: u64,
    id: LeaseId,
    feed_id: FeedId,
    signals: mpsc::UnboundedReceiver<FeedSignal>,
}

impl FeedLease {
    /// Next signal, or `None` once the lease has been cut off.
    pub async fn recv(&mut self) -> Option<FeedSignal> {
        self.signals.recv().await
    }

    /// Id of the upstream feed this lease shares.
    pub fn feed_id(&self) -> &str {
        &self.feed_id
    }
}

impl Drop for FeedLease {
    fn drop(&mut self) {
        self.manager.release(&self.key, self.generation, self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::MemorySource;
    use livesync_engine::Record;
    use serde_json::json;

    fn project(id: &str, client: &str) -> Record {
        Record::new(id, json!({"client_id": client})).unwrap()
    }

    #[tokio::test]
    async fn shares_one_upstream_per_key() {
        let source = Arc::new(MemorySource::new());
        let manager = ConnectionManager::new_shared(source.clone());
        let filter = Filter::eq("client_id", "X").unwrap();

        let mut a = manager.acquire("projects", Some(&filter)).await.unwrap();
        let mut b = manager.acquire("projects", Some(&filter)).await.unwrap();
        let _other = manager.acquire("projects", None).await.unwrap();

        assert_eq!(manager.upstream_count(), 2);
        assert_eq!(manager.lease_count(), 3);
        assert_eq!(source.feed_count(), 2);
        assert_eq!(a.feed_id(), b.feed_id());

        source.insert("projects", project("1", "X")).unwrap();
        assert!(matches!(a.recv().await, Some(FeedSignal::Change(_))));
        assert!(matches!(b.recv().await, Some(FeedSignal::Change(_))));
    }

    #[tokio::test]
    async fn last_release_unsubscribes() {
        let source = Arc::new(MemorySource::new());
        let manager = ConnectionManager::new_shared(source.clone());

        let a = manager.acquire("projects", None).await.unwrap();
        let b = manager.acquire("projects", None).await.unwrap();

        drop(a);
        assert_eq!(manager.upstream_count(), 1);
        assert_eq!(source.feed_count(), 1);

        drop(b);
        assert_eq!(manager.upstream_count(), 0);
        assert_eq!(manager.lease_count(), 0);
        assert_eq!(source.feed_count(), 0);
    }

    #[tokio::test]
    async fn disconnect_reaches_every_lease() {
        let source = Arc::new(MemorySource::new());
        let manager = ConnectionManager::new_shared(source.clone());

        let mut a = manager.acquire("projects", None).await.unwrap();
        let mut b = manager.acquire("projects", None).await.unwrap();

        source.disconnect_all("server restart");

        assert_eq!(
            a.recv().await,
            Some(FeedSignal::Disconnected("server restart".into()))
        );
        assert_eq!(
            b.recv().await,
            Some(FeedSignal::Disconnected("server restart".into()))
        );
        assert_eq!(manager.upstream_count(), 0);

        // The next acquire opens a fresh upstream
        let c = manager.acquire("projects", None).await.unwrap();
        assert_eq!(manager.upstream_count(), 1);
        assert_ne!(c.feed_id(), a.feed_id());
    }

    #[tokio::test]
    async fn failed_subscribe_leaves_no_upstream() {
        let source = Arc::new(MemorySource::new());
        let manager = ConnectionManager::new_shared(source.clone());
        source.fail_next_subscribe("denied");

        assert!(manager.acquire("projects", None).await.is_err());
        assert_eq!(manager.upstream_count(), 0);
        assert!(manager.acquire("projects", None).await.is_ok());
    }
}
