//! TimeRanger - embedded append-only time-ordered record store
//!
//! This crate provides a filesystem-backed store for JSON records that
//! arrive roughly in time order, partitioned by a primary key and bucketed
//! into per-day (configurable) append-only file pairs. One process holds
//! the master (writer) role through an exclusive file lock; any number of
//! read-only processes may open the same database concurrently.
//!
//! # Components
//!
//! - [`Database`]: top-level handle owning the master lock and topic registry
//! - [`Topic`]: one named record collection, partitioned by key
//! - [`MatchCond`]: compiled JSON filter over keys, times, and flags
//! - [`List`]: historical replay plus live subscription on a topic
//!
//! # Example
//!
//! ```rust,ignore
//! use timeranger::{Database, DbConfig, TopicConfig};
//! use serde_json::json;
//!
//! let mut db = Database::startup(DbConfig::new("/var/lib/tr", "metrics"))?;
//! db.create_topic(&TopicConfig::new("events", "sensor").with_tkey("when"))?;
//!
//! // Append; t = 0 means "now".
//! let (key, rowid, _meta) =
//!     db.append("events", 0, 0, &json!({"sensor": "s1", "when": "2026-08-28 12:00:00", "v": 1}))?;
//!
//! // Read back by position.
//! let (_meta, record) = db.read_record("events", &key, rowid)?;
//! ```

#![deny(missing_docs)]

pub mod codec;
pub mod cursor;
pub mod db;
pub mod error;
pub mod fdcache;
pub mod fsutil;
pub mod list;
pub mod matcher;
pub mod rangecache;
pub mod timeparse;
pub mod topic;

pub use codec::{MetaRecord, RecordState, SystemFlags, META_RECORD_SIZE};
pub use cursor::{Direction, KeyReader};
pub use db::{Database, DbConfig, DEFAULT_FILENAME_MASK, MARKER_FILE};
pub use error::{CriticalPolicy, Result, TrError};
pub use list::{List, ListAction, ListCallback, ListEntry, ListId, ListSpec, ReplayOrder};
pub use matcher::{MatchCond, RecordKey};
pub use topic::{Topic, TopicConfig, TopicDesc, TopicVar};
