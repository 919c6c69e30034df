//! In-process source backed by plain collections.
//!
//! Used by the reference server as its store, and by tests to drive the
//! synchronizer deterministically: queries can be paused or failed, raw
//! events can be injected, and feeds can be dropped.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;
use dashmap::DashMap;
use livesync_engine::{
    filter, Change, ChangeEvent, CollectionName, Filter, LoadSnapshot, Record, Sequence,
};
use serde_json::{Map, Value};
use tokio::sync::{mpsc, watch};

use super::{Feed, FeedId, FeedSignal, RemoteSource};
use crate::error::{ClientError, Result};

/// A feed opened on this source.
#[derive(Debug)]
struct MemoryFeed {
    collection: CollectionName,
    filter: Option<Filter>,
    sender: mpsc::UnboundedSender<FeedSignal>,
}

/// In-memory collections with change feeds.
#[derive(Debug)]
pub struct MemorySource {
    collections: DashMap<CollectionName, Vec<Record>>,
    feeds: DashMap<FeedId, MemoryFeed>,
    /// Last assigned change sequence.
    sequence: AtomicU64,
    next_feed: AtomicU64,
    /// Whether feeds are filtered before delivery.
    scoped: bool,
    paused: watch::Sender<bool>,
    query_failure: Mutex<Option<String>>,
    subscribe_failure: Mutex<Option<String>>,
    queries: AtomicUsize,
}

impl Default for MemorySource {
    fn default() -> Self {
        Self::new()
    }
}

impl MemorySource {
    /// A source whose feeds are scoped by the subscriber's filter.
    pub fn new() -> Self {
        Self::with_scoping(true)
    }

    /// A source whose feeds deliver every event of the collection.
    pub fn unscoped() -> Self {
        Self::with_scoping(false)
    }

    fn with_scoping(scoped: bool) -> Self {
        let (paused, _) = watch::channel(false);
        Self {
            collections: DashMap::new(),
            feeds: DashMap::new(),
            sequence: AtomicU64::new(0),
            next_feed: AtomicU64::new(1),
            scoped,
            paused,
            query_failure: Mutex::new(None),
            subscribe_failure: Mutex::new(None),
            queries: AtomicUsize::new(0),
        }
    }

    // --- Data ---

    /// Replace a collection's contents without emitting events.
    pub fn seed(&self, collection: impl Into<CollectionName>, records: Vec<Record>) {
        self.collections.insert(collection.into(), records);
    }

    /// Insert a new record and notify feeds.
    pub fn insert(&self, collection: &str, record: Record) -> Result<Sequence> {
        let mut rows = self.collections.entry(collection.to_string()).or_default();
        if rows.iter().any(|r| r.id() == record.id()) {
            return Err(ClientError::RecordExists(record.id().to_string()));
        }
        rows.push(record.clone());

        Ok(self.publish(ChangeEvent::created(collection, record), None))
    }

    /// Replace an existing record and notify feeds.
    pub fn update(&self, collection: &str, record: Record) -> Result<Sequence> {
        let mut rows = self
            .collections
            .get_mut(collection)
            .ok_or_else(|| ClientError::RecordNotFound(record.id().to_string()))?;
        let slot = rows
            .iter_mut()
            .find(|r| r.id() == record.id())
            .ok_or_else(|| ClientError::RecordNotFound(record.id().to_string()))?;
        let previous = std::mem::replace(slot, record.clone());

        Ok(self.publish(ChangeEvent::updated(collection, record), Some(&previous)))
    }

    /// Merge fields into an existing record and notify feeds.
    pub fn merge(&self, collection: &str, id: &str, patch: &Map<String, Value>) -> Result<Record> {
        let mut rows = self
            .collections
            .get_mut(collection)
            .ok_or_else(|| ClientError::RecordNotFound(id.to_string()))?;
        let slot = rows
            .iter_mut()
            .find(|r| r.id() == id)
            .ok_or_else(|| ClientError::RecordNotFound(id.to_string()))?;
        let previous = slot.clone();
        slot.merge(patch);
        let merged = slot.clone();

        self.publish(ChangeEvent::updated(collection, merged.clone()), Some(&previous));
        Ok(merged)
    }

    /// Remove a record and notify feeds.
    pub fn delete(&self, collection: &str, id: &str) -> Result<Sequence> {
        let mut rows = self
            .collections
            .get_mut(collection)
            .ok_or_else(|| ClientError::RecordNotFound(id.to_string()))?;
        let pos = rows
            .iter()
            .position(|r| r.id() == id)
            .ok_or_else(|| ClientError::RecordNotFound(id.to_string()))?;
        let previous = rows.remove(pos);

        Ok(self.publish(ChangeEvent::deleted(collection, id), Some(&previous)))
    }

    /// Current contents of a collection.
    pub fn records(&self, collection: &str) -> Vec<Record> {
        self.collections
            .get(collection)
            .map(|rows| rows.clone())
            .unwrap_or_default()
    }

    /// Names of all known collections.
    pub fn collection_names(&self) -> Vec<CollectionName> {
        let mut names: Vec<_> = self.collections.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    /// Last assigned change sequence.
    pub fn sequence(&self) -> Sequence {
        self.sequence.load(Ordering::SeqCst)
    }

    // --- Fault injection ---

    /// Deliver an event to matching feeds without touching stored data.
    ///
    /// Returns the number of feeds that received it.
    pub fn emit(&self, event: ChangeEvent) -> usize {
        self.deliver(&event, None)
    }

    /// Hold queries until [`resume_queries`](Self::resume_queries).
    pub fn pause_queries(&self) {
        self.paused.send_replace(true);
    }

    pub fn resume_queries(&self) {
        self.paused.send_replace(false);
    }

    /// Make the next query fail with `message`.
    pub fn fail_next_query(&self, message: impl Into<String>) {
        *self
            .query_failure
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(message.into());
    }

    /// Make the next subscribe fail with `message`.
    pub fn fail_next_subscribe(&self, message: impl Into<String>) {
        *self
            .subscribe_failure
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(message.into());
    }

    /// Drop every open feed, telling subscribers why.
    pub fn disconnect_all(&self, reason: &str) -> usize {
        let ids: Vec<FeedId> = self.feeds.iter().map(|e| e.key().clone()).collect();
        let mut dropped = 0;
        for id in ids {
            if let Some((_, feed)) = self.feeds.remove(&id) {
                let _ = feed
                    .sender
                    .send(FeedSignal::Disconnected(reason.to_string()));
                dropped += 1;
            }
        }
        tracing::debug!(dropped, reason, "Disconnected memory feeds");
        dropped
    }

    /// Number of open feeds.
    pub fn feed_count(&self) -> usize {
        self.feeds.len()
    }

    /// Number of queries received so far, including paused ones.
    pub fn query_count(&self) -> usize {
        self.queries.load(Ordering::SeqCst)
    }

    fn publish(&self, event: ChangeEvent, previous: Option<&Record>) -> Sequence {
        let sequence = self.sequence.fetch_add(1, Ordering::SeqCst) + 1;
        let event = event.with_sequence(sequence);
        self.deliver(&event, previous);
        sequence
    }

    fn deliver(&self, event: &ChangeEvent, previous: Option<&Record>) -> usize {
        let mut closed = Vec::new();
        let mut sent = 0;

        for entry in self.feeds.iter() {
            let feed = entry.value();
            if feed.collection != event.collection || !self.feed_wants(feed, event, previous) {
                continue;
            }
            if feed.sender.send(FeedSignal::Change(event.clone())).is_ok() {
                sent += 1;
            } else {
                closed.push(entry.key().clone());
            }
        }

        for id in closed {
            self.feeds.remove(&id);
        }
        sent
    }

    /// Scoped feeds see a change when the old or new row matches their filter.
    fn feed_wants(&self, feed: &MemoryFeed, event: &ChangeEvent, previous: Option<&Record>) -> bool {
        if !self.scoped {
            return true;
        }
        let filter = feed.filter.as_ref();
        let old_matches = previous.is_some_and(|r| filter::matches(filter, r));
        match &event.change {
            Change::Created { record } | Change::Updated { record } => {
                old_matches || filter::matches(filter, record)
            }
            Change::Deleted { .. } => previous.is_none() || old_matches,
        }
    }
}

#[async_trait]
impl RemoteSource for MemorySource {
    async fn query(&self, collection: &str, filter: Option<&Filter>) -> Result<LoadSnapshot> {
        self.queries.fetch_add(1, Ordering::SeqCst);
        let mut paused = self.paused.subscribe();
        let _ = paused.wait_for(|p| !*p).await;

        let failure = self
            .query_failure
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(message) = failure {
            return Err(ClientError::Rejected(message));
        }

        // Read the sequence while holding the collection so the watermark
        // covers exactly the rows returned.
        let before = self.sequence.load(Ordering::SeqCst);
        let snapshot = match self.collections.get(collection) {
            Some(rows) => LoadSnapshot::new(
                rows.iter()
                    .filter(|r| filter::matches(filter, r))
                    .cloned()
                    .collect(),
            )
            .with_sequence(self.sequence.load(Ordering::SeqCst)),
            None => LoadSnapshot::default().with_sequence(before),
        };

        Ok(snapshot)
    }

    async fn subscribe(&self, collection: &str, filter: Option<&Filter>) -> Result<Feed> {
        let failure = self
            .subscribe_failure
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(message) = failure {
            return Err(ClientError::Rejected(message));
        }

        let id = format!("mem-{}", self.next_feed.fetch_add(1, Ordering::SeqCst));
        let (sender, signals) = mpsc::unbounded_channel();
        self.feeds.insert(
            id.clone(),
            MemoryFeed {
                collection: collection.to_string(),
                filter: filter.cloned(),
                sender,
            },
        );
        tracing::debug!(feed_id = %id, collection, "Memory feed opened");

        Ok(Feed { id, signals })
    }

    fn unsubscribe(&self, id: &str) {
        if self.feeds.remove(id).is_some() {
            tracing::debug!(feed_id = %id, "Memory feed closed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn project(id: &str, client: &str) -> Record {
        Record::new(id, json!({"client_id": client})).unwrap()
    }

    #[tokio::test]
    async fn query_applies_filter_and_watermark() {
        let source = MemorySource::new();
        source.insert("projects", project("1", "X")).unwrap();
        source.insert("projects", project("2", "Y")).unwrap();

        let filter = Filter::eq("client_id", "X").unwrap();
        let snapshot = source.query("projects", Some(&filter)).await.unwrap();

        assert_eq!(snapshot.records, vec![project("1", "X")]);
        assert_eq!(snapshot.sequence, Some(2));
    }

    #[tokio::test]
    async fn scoped_feed_sees_matching_changes() {
        let source = MemorySource::new();
        let filter = Filter::eq("client_id", "X").unwrap();
        let mut feed = source.subscribe("projects", Some(&filter)).await.unwrap();

        source.insert("projects", project("1", "Y")).unwrap();
        source.insert("projects", project("2", "X")).unwrap();

        match feed.signals.recv().await.unwrap() {
            FeedSignal::Change(event) => {
                assert_eq!(event.change.record_id(), "2");
                assert_eq!(event.sequence, Some(2));
            }
            other => panic!("Expected change, got {:?}", other),
        }
        assert!(feed.signals.try_recv().is_err());
    }

    #[tokio::test]
    async fn scoped_feed_sees_update_leaving_filter() {
        let source = MemorySource::new();
        source.insert("projects", project("1", "X")).unwrap();
        let filter = Filter::eq("client_id", "X").unwrap();
        let mut feed = source.subscribe("projects", Some(&filter)).await.unwrap();

        source.update("projects", project("1", "Y")).unwrap();

        assert!(matches!(
            feed.signals.recv().await,
            Some(FeedSignal::Change(_))
        ));
    }

    #[tokio::test]
    async fn unscoped_feed_sees_everything() {
        let source = MemorySource::unscoped();
        let filter = Filter::eq("client_id", "X").unwrap();
        let mut feed = source.subscribe("projects", Some(&filter)).await.unwrap();

        source.insert("projects", project("1", "Y")).unwrap();
        assert!(matches!(
            feed.signals.recv().await,
            Some(FeedSignal::Change(_))
        ));
    }

    #[tokio::test]
    async fn mutations_validate_ids() {
        let source = MemorySource::new();
        source.insert("projects", project("1", "X")).unwrap();

        assert!(matches!(
            source.insert("projects", project("1", "X")),
            Err(ClientError::RecordExists(_))
        ));
        assert!(matches!(
            source.delete("projects", "9"),
            Err(ClientError::RecordNotFound(_))
        ));
        assert!(matches!(
            source.update("budgets", project("1", "X")),
            Err(ClientError::RecordNotFound(_))
        ));

        let patch = json!({"title": "Education"});
        let merged = source
            .merge("projects", "1", patch.as_object().unwrap())
            .unwrap();
        assert_eq!(merged.get("title"), Some(&json!("Education")));
        assert_eq!(merged.get("client_id"), Some(&json!("X")));
    }

    #[tokio::test]
    async fn injected_failures_fire_once() {
        let source = MemorySource::new();
        source.fail_next_query("permission denied");

        assert!(source.query("projects", None).await.is_err());
        assert!(source.query("projects", None).await.is_ok());
        assert_eq!(source.query_count(), 2);

        source.fail_next_subscribe("realtime disabled");
        assert!(source.subscribe("projects", None).await.is_err());
        assert!(source.subscribe("projects", None).await.is_ok());
    }

    #[tokio::test]
    async fn unsubscribe_and_disconnect() {
        let source = MemorySource::new();
        let feed = source.subscribe("projects", None).await.unwrap();
        let mut other = source.subscribe("projects", None).await.unwrap();
        assert_eq!(source.feed_count(), 2);

        source.unsubscribe(&feed.id);
        assert_eq!(source.feed_count(), 1);

        assert_eq!(source.disconnect_all("network down"), 1);
        assert_eq!(
            other.signals.recv().await,
            Some(FeedSignal::Disconnected("network down".into()))
        );
        assert_eq!(source.feed_count(), 0);
    }
}
