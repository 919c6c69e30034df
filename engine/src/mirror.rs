//! Mirror - the local copy of a filtered remote collection.
//!
//! A [`Mirror`] holds the records a session currently knows about and applies
//! load snapshots and change events to them. It performs no IO: the runtime
//! feeds it results and events in delivery order and publishes its
//! [`MirrorSnapshot`]s.
//!
//! Event rules:
//! - `created` appends unless the id is already present
//! - `updated` replaces in place, and is ignored for unknown ids
//! - `deleted` removes, and is ignored for unknown ids
//!
//! Events that arrive while a load is pending are buffered and replayed, in
//! order, on top of the snapshot once it lands.

use crate::{
    error::{validate_collection, Result},
    filter, Change, ChangeEvent, CollectionName, FeedState, Failure, FailureKind, Filter,
    LoadState, MirrorSnapshot, Record, RecordId, Sequence,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Whether the mirror applies its filter to incoming events itself.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamScope {
    /// Events and snapshot rows are checked against the filter locally.
    #[default]
    Enforced,
    /// The source is trusted to deliver only matching events.
    Trusted,
}

impl StreamScope {
    /// Parse `enforced` or `trusted` (case-insensitive).
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "enforced" => Some(StreamScope::Enforced),
            "trusted" => Some(StreamScope::Trusted),
            _ => None,
        }
    }
}

/// Result of a collection query.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LoadSnapshot {
    pub records: Vec<Record>,
    /// Latest source sequence covered by `records`, if the source has one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sequence: Option<Sequence>,
}

impl LoadSnapshot {
    pub fn new(records: Vec<Record>) -> Self {
        Self {
            records,
            sequence: None,
        }
    }

    pub fn with_sequence(mut self, sequence: Sequence) -> Self {
        self.sequence = Some(sequence);
        self
    }
}

/// Why an event left the mirror untouched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IgnoreReason {
    /// `created` for an id already present.
    DuplicateCreate,
    /// `updated` for an id not in the mirror.
    OrphanUpdate,
    /// `deleted` for an id not in the mirror.
    OrphanDelete,
    /// `created` for a record the filter excludes.
    OutsideFilter,
    /// Sequence at or below the applied snapshot's watermark.
    Stale,
    /// Event tagged with a different collection.
    ForeignCollection,
    /// The mirror was closed.
    Closed,
}

/// Outcome of applying one event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Applied {
    Inserted,
    Replaced,
    Removed,
    /// An update moved the record outside the filter.
    Evicted,
    /// Held until the pending load completes.
    Buffered,
    Ignored(IgnoreReason),
}

impl Applied {
    /// True when the visible mirror changed.
    pub fn changed(&self) -> bool {
        matches!(
            self,
            Applied::Inserted | Applied::Replaced | Applied::Removed | Applied::Evicted
        )
    }
}

/// Summary of installing a snapshot or failing a load.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoadReport {
    /// Records installed from the snapshot.
    pub loaded: usize,
    /// Snapshot rows dropped as duplicates or outside the filter.
    pub dropped: usize,
    /// Buffered events that changed the mirror during replay.
    pub replayed: usize,
    /// Buffered events ignored during replay.
    pub ignored: usize,
    /// The result arrived after close and was discarded.
    pub discarded: bool,
}

/// Local copy of one `(collection, filter)` pair.
#[derive(Debug, Clone)]
pub struct Mirror {
    collection: CollectionName,
    filter: Option<Filter>,
    scope: StreamScope,
    records: Vec<Record>,
    /// Position of each record in `records`.
    index: HashMap<RecordId, usize>,
    /// `Some` while a load is pending.
    buffer: Option<Vec<ChangeEvent>>,
    watermark: Option<Sequence>,
    load: LoadState,
    feed: FeedState,
    failure: Option<Failure>,
    revision: u64,
    closed: bool,
}

impl Mirror {
    /// Create a mirror in the loading state.
    pub fn new(
        collection: impl Into<CollectionName>,
        filter: Option<Filter>,
        scope: StreamScope,
    ) -> Result<Self> {
        let collection = collection.into();
        validate_collection(&collection)?;

        Ok(Self {
            collection,
            filter,
            scope,
            records: Vec::new(),
            index: HashMap::new(),
            buffer: Some(Vec::new()),
            watermark: None,
            load: LoadState::Loading,
            feed: FeedState::Connecting,
            failure: None,
            revision: 0,
            closed: false,
        })
    }

    pub fn collection(&self) -> &str {
        &self.collection
    }

    pub fn filter(&self) -> Option<&Filter> {
        self.filter.as_ref()
    }

    pub fn scope(&self) -> StreamScope {
        self.scope
    }

    /// Records in local application order.
    pub fn records(&self) -> &[Record] {
        &self.records
    }

    pub fn get(&self, id: &str) -> Option<&Record> {
        self.index.get(id).map(|&pos| &self.records[pos])
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn load_state(&self) -> LoadState {
        self.load
    }

    pub fn is_loading(&self) -> bool {
        self.load == LoadState::Loading
    }

    pub fn feed_state(&self) -> FeedState {
        self.feed
    }

    pub fn failure(&self) -> Option<&Failure> {
        self.failure.as_ref()
    }

    pub fn revision(&self) -> u64 {
        self.revision
    }

    pub fn watermark(&self) -> Option<Sequence> {
        self.watermark
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Number of events waiting for the pending load.
    pub fn buffered(&self) -> usize {
        self.buffer.as_ref().map_or(0, Vec::len)
    }

    /// Start a (re)load. Current records stay visible until the snapshot
    /// replaces them; events are buffered in the meantime.
    pub fn begin_load(&mut self) {
        if self.closed {
            return;
        }
        if self.buffer.is_none() {
            self.buffer = Some(Vec::new());
        }
        self.load = LoadState::Loading;
        if matches!(&self.failure, Some(f) if f.kind == FailureKind::Load) {
            self.failure = None;
        }
        self.bump();
    }

    /// Replace the mirror with a snapshot, then replay buffered events.
    pub fn finish_load(&mut self, snapshot: LoadSnapshot) -> LoadReport {
        if self.closed {
            return LoadReport {
                discarded: true,
                ..LoadReport::default()
            };
        }

        let mut report = LoadReport::default();
        self.records.clear();
        self.index.clear();
        for record in snapshot.records {
            if self.index.contains_key(record.id()) || !self.admits(&record) {
                report.dropped += 1;
                continue;
            }
            self.index.insert(record.id().to_string(), self.records.len());
            self.records.push(record);
        }
        report.loaded = self.records.len();

        self.watermark = snapshot.sequence;
        self.load = LoadState::Loaded;
        if matches!(&self.failure, Some(f) if f.kind == FailureKind::Load) {
            self.failure = None;
        }
        self.replay(&mut report);
        self.bump();

        report
    }

    /// Record a failed load. The mirror keeps whatever it held before the
    /// load (nothing, for a fresh session) and buffered events are replayed.
    pub fn fail_load(&mut self, message: impl Into<String>) -> LoadReport {
        if self.closed {
            return LoadReport {
                discarded: true,
                ..LoadReport::default()
            };
        }

        let mut report = LoadReport::default();
        self.load = LoadState::Failed;
        self.failure = Some(Failure::load(message));
        self.replay(&mut report);
        self.bump();

        report
    }

    /// Apply one change event.
    pub fn apply(&mut self, event: ChangeEvent) -> Applied {
        if self.closed {
            return Applied::Ignored(IgnoreReason::Closed);
        }
        if event.collection != self.collection {
            return Applied::Ignored(IgnoreReason::ForeignCollection);
        }
        if let Some(buffer) = self.buffer.as_mut() {
            buffer.push(event);
            return Applied::Buffered;
        }

        let applied = self.apply_now(event);
        if applied.changed() {
            self.bump();
        }
        applied
    }

    /// Update the feed state, returning true when it changed.
    pub fn set_feed_state(&mut self, state: FeedState) -> bool {
        if self.closed || self.feed == state {
            return false;
        }
        self.feed = state;
        self.bump();
        true
    }

    /// Surface a subscription failure.
    pub fn fail_subscription(&mut self, message: impl Into<String>) {
        if self.closed {
            return;
        }
        self.failure = Some(Failure::subscription(message));
        self.bump();
    }

    /// Clear a previously surfaced subscription failure.
    pub fn clear_subscription_failure(&mut self) {
        if matches!(&self.failure, Some(f) if f.kind == FailureKind::Subscription) {
            self.failure = None;
            self.bump();
        }
    }

    /// Stop accepting results and events. Idempotent.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.buffer = None;
        self.feed = FeedState::Closed;
        self.bump();
    }

    /// Copy of the current state.
    pub fn snapshot(&self) -> MirrorSnapshot {
        MirrorSnapshot {
            collection: self.collection.clone(),
            filter: self.filter.clone(),
            records: self.records.clone(),
            load: self.load,
            feed: self.feed,
            failure: self.failure.clone(),
            revision: self.revision,
        }
    }

    fn replay(&mut self, report: &mut LoadReport) {
        let buffered = self.buffer.take().unwrap_or_default();
        for event in buffered {
            if self.apply_now(event).changed() {
                report.replayed += 1;
            } else {
                report.ignored += 1;
            }
        }
    }

    fn apply_now(&mut self, event: ChangeEvent) -> Applied {
        if let (Some(seq), Some(mark)) = (event.sequence, self.watermark) {
            if seq <= mark {
                return Applied::Ignored(IgnoreReason::Stale);
            }
        }

        match event.change {
            Change::Created { record } => {
                if self.index.contains_key(record.id()) {
                    return Applied::Ignored(IgnoreReason::DuplicateCreate);
                }
                if !self.admits(&record) {
                    return Applied::Ignored(IgnoreReason::OutsideFilter);
                }
                self.index.insert(record.id().to_string(), self.records.len());
                self.records.push(record);
                Applied::Inserted
            }
            Change::Updated { record } => {
                let Some(&pos) = self.index.get(record.id()) else {
                    return Applied::Ignored(IgnoreReason::OrphanUpdate);
                };
                if !self.admits(&record) {
                    self.remove_at(pos);
                    return Applied::Evicted;
                }
                self.records[pos] = record;
                Applied::Replaced
            }
            Change::Deleted { id } => match self.index.get(&id) {
                Some(&pos) => {
                    self.remove_at(pos);
                    Applied::Removed
                }
                None => Applied::Ignored(IgnoreReason::OrphanDelete),
            },
        }
    }

    fn admits(&self, record: &Record) -> bool {
        match self.scope {
            StreamScope::Enforced => filter::matches(self.filter.as_ref(), record),
            StreamScope::Trusted => true,
        }
    }

    fn remove_at(&mut self, pos: usize) {
        let removed = self.records.remove(pos);
        self.index.remove(removed.id());
        for (offset, record) in self.records[pos..].iter().enumerate() {
            if let Some(slot) = self.index.get_mut(record.id()) {
                *slot = pos + offset;
            }
        }
    }

    fn bump(&mut self) {
        self.revision += 1;
    }
}
