//! # livesync client
//!
//! Async runtime around [`livesync_engine`]: remote sources, a shared
//! connection manager, and live collection sessions.
//!
//! ## Architecture
//!
//! - [`RemoteSource`] answers queries and opens change feeds
//!   ([`MemorySource`] for tests and demos, [`HttpSource`] for a livesync
//!   server)
//! - [`ConnectionManager`] shares one upstream feed per `(collection, filter)`
//!   between sessions
//! - [`Synchronizer`] opens [`Session`]s, each of which owns one mirror and
//!   publishes snapshots
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use livesync_client::{Filter, MemorySource, SyncConfig, Synchronizer};
//!
//! # async fn run() -> livesync_client::Result<()> {
//! let source = Arc::new(MemorySource::new());
//! let sync = Synchronizer::new(source, SyncConfig::default());
//!
//! let filter = Filter::eq("client_id", "X")?;
//! let mut session = sync.open("projects", Some(filter))?;
//!
//! let snapshot = session.wait_loaded().await?;
//! println!("{} projects", snapshot.len());
//!
//! while let Ok(snapshot) = session.changed().await {
//!     println!("revision {}: {:?}", snapshot.revision, snapshot.ids());
//! }
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod error;
pub mod manager;
pub mod session;
pub mod source;

pub use config::{BackoffPolicy, ConfigError, SyncConfig};
pub use error::{ClientError, Result};
pub use manager::{ConnectionManager, FeedLease};
pub use session::{Session, Synchronizer};
pub use source::{Feed, FeedId, FeedSignal, HttpSource, MemorySource, RemoteSource};

// Engine types consumers need alongside sessions
pub use livesync_engine::{
    ChangeEvent, Failure, FailureKind, FeedState, Filter, LoadState, MirrorSnapshot, Record,
    StreamScope,
};
