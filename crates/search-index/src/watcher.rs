//! Filesystem change watching.
//!
//! This module turns a platform change-notification stream into filtered
//! batches of [`ChangeEvent`]s:
//! - FSEvents on macOS, notify elsewhere, behind the [`EventSource`] trait
//! - flag decoding and per-path coalescing
//! - hidden/package path suppression
//! - a durable cursor so a restarted watcher resumes where it stopped

mod cursor;
mod detector;
mod events;
mod filter;
mod source;

#[cfg(target_os = "macos")]
mod fsevent;

#[cfg(not(target_os = "macos"))]
mod notify_source;

pub use cursor::{CursorStore, FileCursorStore, MemoryCursorStore, SequenceId, CURSOR_FILE_VERSION};
pub use detector::{process_batch, BatchOutcome, ChangeConsumer, ChangeWatcher, WatcherState};
pub use events::{coalesce_batch, decode, ChangeEvent, EventKind, EventKinds, ScanType, StreamFlags};
pub use filter::{is_hidden_leaf, is_package, should_keep, FilterPolicy};
pub use source::{BatchSink, EventSource, ManualEventSource, ManualSubscription, RawBatch, Subscription};

#[cfg(target_os = "macos")]
pub use fsevent::{FsEventSource, FsEventSubscription};

#[cfg(not(target_os = "macos"))]
pub use notify_source::{NotifyEventSource, NotifySubscription};

/// The event source used on this platform.
#[cfg(target_os = "macos")]
pub type PlatformEventSource = FsEventSource;

/// The event source used on this platform.
#[cfg(not(target_os = "macos"))]
pub type PlatformEventSource = NotifyEventSource;
