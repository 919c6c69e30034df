//! # livesync engine
//!
//! The deterministic core of livesync: a local mirror of a filtered remote
//! collection, kept consistent by an initial snapshot and a stream of change
//! events.
//!
//! ## Design Principles
//!
//! - **No IO**: the engine never touches the network, timers, or threads
//! - **Deterministic**: the same snapshot and event sequence always produce
//!   the same mirror
//! - **Tolerant**: duplicate creates and orphan updates/deletes are no-ops,
//!   so events may race the initial load
//!
//! ## Core Concepts
//!
//! ### Records
//!
//! A [`Record`] is a schema-less JSON object with a mandatory `id`.
//!
//! ### Filters
//!
//! A [`Filter`] is a single `field == value` predicate scoping a mirror.
//!
//! ### Change events
//!
//! A [`ChangeEvent`] carries one [`Change`] (`created`, `updated`, or
//! `deleted`) for a collection, optionally stamped with a source sequence.
//!
//! ### Mirror
//!
//! The [`Mirror`] applies a [`LoadSnapshot`] and change events and exposes
//! [`MirrorSnapshot`]s with an explicit [`LoadState`], so that "failed" is
//! never confused with "empty".
//!
//! ## Quick Start
//!
//! ```rust
//! use livesync_engine::{ChangeEvent, LoadSnapshot, Mirror, Record, StreamScope};
//! use serde_json::json;
//!
//! let mut mirror = Mirror::new("projects", None, StreamScope::Enforced).unwrap();
//! assert!(mirror.is_loading());
//!
//! let education = Record::new("1", json!({"title": "Education"})).unwrap();
//! mirror.finish_load(LoadSnapshot::new(vec![education]));
//!
//! let health = Record::new("3", json!({"title": "Health"})).unwrap();
//! mirror.apply(ChangeEvent::created("projects", health));
//! mirror.apply(ChangeEvent::deleted("projects", "1"));
//!
//! let ids: Vec<_> = mirror.records().iter().map(|r| r.id()).collect();
//! assert_eq!(ids, vec!["3"]);
//! ```

pub mod error;
pub mod event;
pub mod filter;
pub mod mirror;
pub mod protocol;
pub mod record;
pub mod status;

// Re-export main types at crate root
pub use error::Error;
pub use event::{Change, ChangeEvent, EventKind};
pub use filter::Filter;
pub use mirror::{Applied, IgnoreReason, LoadReport, LoadSnapshot, Mirror, StreamScope};
pub use protocol::{ClientMessage, QueryResponse, ServerMessage, SubscriptionId};
pub use record::Record;
pub use status::{FailureKind, Failure, FeedState, LoadState, MirrorSnapshot};

/// Type aliases for clarity
pub type RecordId = String;
pub type CollectionName = String;
pub type Sequence = u64;
