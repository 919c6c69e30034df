//! Remote data sources.
//!
//! A [`RemoteSource`] answers collection queries and opens change feeds. The
//! synchronizer only talks to sources through this trait, so tests and demos
//! use [`MemorySource`] while applications use [`HttpSource`].

mod http;
mod memory;

pub use http::HttpSource;
pub use memory::MemorySource;

use crate::error::Result;
use async_trait::async_trait;
use livesync_engine::{ChangeEvent, Filter, LoadSnapshot};
use tokio::sync::mpsc;

/// Identifier of an open feed, unique per source.
pub type FeedId = String;

/// A signal delivered on a change feed.
#[derive(Debug, Clone, PartialEq)]
pub enum FeedSignal {
    Change(ChangeEvent),
    /// The feed is gone; no further signals follow.
    Disconnected(String),
}

/// An open change feed.
#[derive(Debug)]
pub struct Feed {
    pub id: FeedId,
    pub signals: mpsc::UnboundedReceiver<FeedSignal>,
}

/// Query and subscription interface of a remote collection store.
#[async_trait]
pub trait RemoteSource: Send + Sync + 'static {
    /// All records of `collection` matching `filter`.
    async fn query(&self, collection: &str, filter: Option<&Filter>) -> Result<LoadSnapshot>;

    /// Open a change feed delivering created, updated, and deleted events.
    ///
    /// Sources may or may not scope the feed by `filter`.
    async fn subscribe(&self, collection: &str, filter: Option<&Filter>) -> Result<Feed>;

    /// Close a feed. Fire-and-forget; unknown ids are ignored.
    fn unsubscribe(&self, id: &str);
}
