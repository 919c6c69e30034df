//! Status surface exposed to mirror consumers.

use crate::{CollectionName, Filter, Record};
use serde::{Deserialize, Serialize};

/// Progress of the initial (or a repeated) load.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoadState {
    /// A query is in flight.
    Loading,
    /// The snapshot was applied. The mirror may legitimately be empty.
    Loaded,
    /// The query failed; see [`MirrorSnapshot::failure`].
    Failed,
}

/// Health of the change feed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeedState {
    /// Subscription requested but not yet established.
    Connecting,
    /// Events are flowing.
    Live,
    /// The feed dropped; the mirror is stale but still served.
    Disconnected,
    /// The session was torn down.
    Closed,
}

/// Which operation failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Load,
    Subscription,
}

/// A non-fatal failure surfaced to consumers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Failure {
    pub kind: FailureKind,
    pub message: String,
}

impl Failure {
    pub fn load(message: impl Into<String>) -> Self {
        Self {
            kind: FailureKind::Load,
            message: message.into(),
        }
    }

    pub fn subscription(message: impl Into<String>) -> Self {
        Self {
            kind: FailureKind::Subscription,
            message: message.into(),
        }
    }
}

impl std::fmt::Display for Failure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let what = match self.kind {
            FailureKind::Load => "load failed",
            FailureKind::Subscription => "subscription failed",
        };
        write!(f, "{}: {}", what, self.message)
    }
}

/// A read-only view of a mirror at one point in time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MirrorSnapshot {
    pub collection: CollectionName,
    pub filter: Option<Filter>,
    pub records: Vec<Record>,
    pub load: LoadState,
    pub feed: FeedState,
    pub failure: Option<Failure>,
    /// Increases on every visible change.
    pub revision: u64,
}

impl MirrorSnapshot {
    /// True while a load is pending.
    pub fn loading(&self) -> bool {
        self.load == LoadState::Loading
    }

    /// True when the load failed, as opposed to an empty result.
    pub fn failed(&self) -> bool {
        self.load == LoadState::Failed
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Ids in mirror order.
    pub fn ids(&self) -> Vec<&str> {
        self.records.iter().map(Record::id).collect()
    }

    pub fn get(&self, id: &str) -> Option<&Record> {
        self.records.iter().find(|r| r.id() == id)
    }
}
