//! File search index kept in sync with live file-system changes.
//!
//! This crate provides:
//! - Change watching with hidden/package filtering and a resumable cursor
//! - A persistent name or content index with a process-wide writer guard
//! - Query normalization (exact, leading and trailing fuzzy) and ranked search
//! - Reconciliation of change batches into index updates

pub mod config;
pub mod error;
pub mod index;
pub mod query;
pub mod sync;
pub mod watcher;

// Re-export main types
pub use config::{load_or_create_config, SearchIndexConfig};
pub use error::{Result, SearchIndexError};
pub use index::{DiskIndex, DiskIndexEngine, Index, IndexKind, IndexOptions, OpenMode};
pub use query::{MatchMode, QueryPlanner, SearchHit, SearchOptions, SearchRequest};
pub use sync::{Reconciler, SyncAction, SyncOutcome};
pub use watcher::{
    ChangeEvent, ChangeWatcher, CursorStore, EventKind, EventKinds, FileCursorStore, FilterPolicy,
    PlatformEventSource, SequenceId,
};
