//! Change watcher lifecycle and per-batch processing.
//!
//! Batches arrive on the event source's own thread. Each subscription owns a
//! fresh [`Session`] shared with the source through an `Arc`; the batch
//! handler holds the session gate while it works and `stop()` takes the same
//! gate to deactivate the session, so stopping waits for an in-flight batch
//! and anything delivered afterwards is ignored. The delivering thread is
//! recorded so a `stop()` issued from inside the consumer is refused instead
//! of waiting on its own gate.

use std::panic::{self, AssertUnwindSafe};
use std::path::PathBuf;
use std::sync::Arc;
use std::thread::{self, ThreadId};

use parking_lot::Mutex;

use super::cursor::{CursorStore, SequenceId};
use super::events::{coalesce_batch, ChangeEvent};
use super::filter::{should_keep, FilterPolicy};
use super::source::{BatchSink, EventSource, RawBatch, Subscription};
use crate::error::{canonicalize_existing_path, Result};

/// Receives filtered change batches.
pub type ChangeConsumer = Arc<dyn Fn(Vec<ChangeEvent>) + Send + Sync>;

/// Watcher lifecycle state.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum WatcherState {
    /// Constructed or stopped; no subscription.
    Idle,
    /// Resolving the cursor and subscribing.
    Armed,
    /// Subscribed and delivering batches.
    Running,
    /// Torn down.
    Stopped,
}

impl WatcherState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Armed => "armed",
            Self::Running => "running",
            Self::Stopped => "stopped",
        }
    }
}

/// What happened to one raw batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchOutcome {
    /// The batch was malformed and dropped; the cursor did not move.
    Dropped,
    /// Every event was filtered out; only the cursor moved.
    Filtered { cursor: SequenceId },
    /// `count` events went to the consumer.
    Delivered { cursor: SequenceId, count: usize },
}

/// Decodes, filters, checkpoints and delivers one batch.
///
/// The cursor is saved before the consumer runs. A crash between the two
/// loses that batch instead of delivering it again after restart.
pub fn process_batch(
    batch: RawBatch,
    policy: FilterPolicy,
    cursor: &dyn CursorStore,
    consumer: &(dyn Fn(Vec<ChangeEvent>) + Send + Sync),
) -> BatchOutcome {
    let last_id = match batch.validate() {
        Ok(id) => id,
        Err(error) => {
            log::warn!("dropping change batch: {error}");
            return BatchOutcome::Dropped;
        }
    };

    let mut events = coalesce_batch(batch.paths.iter().zip(batch.flags.iter().copied()));
    events.retain(|event| should_keep(&event.path, policy));

    if let Err(error) = cursor.save(last_id) {
        log::warn!("failed to persist change cursor {last_id}: {error}");
    }

    if events.is_empty() {
        log::debug!("change batch up to {last_id} fully filtered");
        return BatchOutcome::Filtered { cursor: last_id };
    }

    let count = events.len();
    log::debug!("delivering {count} change events up to {last_id}");
    consumer(events);
    BatchOutcome::Delivered {
        cursor: last_id,
        count,
    }
}

/// State shared with the event source for the lifetime of one subscription.
struct Session {
    active: Mutex<bool>,
    /// Thread currently running the consumer.
    delivering: Mutex<Option<ThreadId>>,
    policy: FilterPolicy,
    cursor: Arc<dyn CursorStore>,
    consumer: ChangeConsumer,
}

impl Session {
    fn handle(&self, batch: RawBatch) {
        let active = self.active.lock();
        if !*active {
            return;
        }
        *self.delivering.lock() = Some(thread::current().id());
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
            process_batch(
                batch,
                self.policy,
                self.cursor.as_ref(),
                self.consumer.as_ref(),
            )
        }));
        if outcome.is_err() {
            log::error!("change consumer panicked; watcher keeps running");
        }
        self.delivering.lock().take();
        drop(active);
    }
}

/// Watches a set of roots and hands filtered change batches to a consumer.
pub struct ChangeWatcher<S: EventSource> {
    source: S,
    roots: Vec<PathBuf>,
    policy: FilterPolicy,
    cursor: Arc<dyn CursorStore>,
    consumer: ChangeConsumer,
    state: WatcherState,
    running: Option<(Arc<Session>, S::Subscription)>,
}

impl<S: EventSource> std::fmt::Debug for ChangeWatcher<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChangeWatcher")
            .field("roots", &self.roots)
            .field("policy", &self.policy)
            .field("state", &self.state)
            .finish()
    }
}

impl<S: EventSource> ChangeWatcher<S> {
    /// Creates an idle watcher. Nothing is subscribed until [`start`](Self::start).
    pub fn new<F>(
        source: S,
        roots: Vec<PathBuf>,
        policy: FilterPolicy,
        cursor: Arc<dyn CursorStore>,
        on_change: F,
    ) -> Self
    where
        F: Fn(Vec<ChangeEvent>) + Send + Sync + 'static,
    {
        let roots = roots.into_iter().map(canonicalize_existing_path).collect();
        Self {
            source,
            roots,
            policy,
            cursor,
            consumer: Arc::new(on_change),
            state: WatcherState::Idle,
            running: None,
        }
    }

    pub fn state(&self) -> WatcherState {
        self.state
    }

    pub fn is_running(&self) -> bool {
        self.state == WatcherState::Running
    }

    pub fn roots(&self) -> &[PathBuf] {
        &self.roots
    }

    pub fn policy(&self) -> FilterPolicy {
        self.policy
    }

    pub fn source(&self) -> &S {
        &self.source
    }

    /// Subscribes to the source, resuming after the persisted cursor.
    ///
    /// Does nothing if the watcher is already running.
    pub fn start(&mut self) -> Result<()> {
        if self.running.is_some() {
            return Ok(());
        }
        self.state = WatcherState::Armed;

        let since = self.cursor.load();
        let session = Arc::new(Session {
            active: Mutex::new(true),
            delivering: Mutex::new(None),
            policy: self.policy,
            cursor: self.cursor.clone(),
            consumer: self.consumer.clone(),
        });
        let handler = session.clone();
        let sink: BatchSink = Arc::new(move |batch| handler.handle(batch));

        match self.source.subscribe(&self.roots, since, sink) {
            Ok(subscription) => {
                self.running = Some((session, subscription));
                self.state = WatcherState::Running;
                log::info!(
                    "change watcher started roots={} since={}",
                    self.roots.len(),
                    since
                );
                Ok(())
            }
            Err(error) => {
                self.state = WatcherState::Idle;
                log::warn!("change watcher failed to start: {error}");
                Err(error)
            }
        }
    }

    /// Unsubscribes and releases the source stream.
    ///
    /// Blocks until a batch that is currently being processed has finished.
    /// Called from inside the consumer it logs an error and leaves the
    /// watcher running. Does nothing if the watcher is not running.
    pub fn stop(&mut self) {
        if let Some((session, _)) = &self.running {
            if *session.delivering.lock() == Some(thread::current().id()) {
                log::error!("change watcher stop() called from inside the consumer; ignored");
                return;
            }
        }
        let Some((session, mut subscription)) = self.running.take() else {
            return;
        };
        *session.active.lock() = false;
        subscription.unsubscribe();
        self.state = WatcherState::Idle;
        log::info!("change watcher stopped roots={}", self.roots.len());
    }
}

impl<S: EventSource> Drop for ChangeWatcher<S> {
    fn drop(&mut self) {
        self.stop();
        self.state = WatcherState::Stopped;
    }
}
