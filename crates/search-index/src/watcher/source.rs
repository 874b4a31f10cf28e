//! Event source abstraction.
//!
//! A source delivers raw notification batches on its own thread. The watcher
//! only consumes batches; it never reimplements delivery.

use std::path::PathBuf;
use std::sync::Arc;

use parking_lot::Mutex;

use super::cursor::SequenceId;
use crate::error::{Result, SearchIndexError};

/// One notification batch exactly as the source reported it.
///
/// The three vectors are parallel: entry `i` describes one event.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RawBatch {
    pub paths: Vec<PathBuf>,
    pub flags: Vec<u32>,
    pub ids: Vec<u64>,
}

impl RawBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, path: impl Into<PathBuf>, flags: u32, id: u64) {
        self.paths.push(path.into());
        self.flags.push(flags);
        self.ids.push(id);
    }

    /// Builder form of [`RawBatch::push`].
    pub fn with(mut self, path: impl Into<PathBuf>, flags: u32, id: u64) -> Self {
        self.push(path, flags, id);
        self
    }

    pub fn len(&self) -> usize {
        self.paths.len()
    }

    pub fn is_empty(&self) -> bool {
        self.paths.is_empty()
    }

    /// Checks the batch shape and returns the id to persist for it.
    pub fn validate(&self) -> Result<SequenceId> {
        if self.paths.len() != self.flags.len() || self.paths.len() != self.ids.len() {
            return Err(SearchIndexError::MalformedNotification(format!(
                "mismatched batch arrays: {} paths, {} flags, {} ids",
                self.paths.len(),
                self.flags.len(),
                self.ids.len()
            )));
        }
        self.ids
            .iter()
            .copied()
            .max()
            .map(SequenceId)
            .ok_or_else(|| SearchIndexError::MalformedNotification("empty batch".into()))
    }
}

/// Receives batches from a source. Called on the source's delivery thread.
pub type BatchSink = Arc<dyn Fn(RawBatch) + Send + Sync>;

/// A live subscription. Dropping it must also unsubscribe.
pub trait Subscription: Send {
    /// Stops delivery and releases the underlying stream. Once this returns,
    /// the sink is not called again. Calling it twice is a no-op.
    fn unsubscribe(&mut self);
}

/// Something that can stream change notifications for a set of roots.
pub trait EventSource: Send {
    type Subscription: Subscription;

    /// Starts delivering batches for `roots`, beginning after `since`.
    fn subscribe(
        &mut self,
        roots: &[PathBuf],
        since: SequenceId,
        sink: BatchSink,
    ) -> Result<Self::Subscription>;
}

// ---------------------------------------------------------------------------
// In-process source
// ---------------------------------------------------------------------------

#[derive(Default)]
struct ManualState {
    sink: Option<BatchSink>,
    /// Every batch ever emitted, so later subscribers can resume from an id.
    history: Vec<RawBatch>,
    subscriptions: Vec<(Vec<PathBuf>, SequenceId)>,
}

/// A source driven by the caller.
///
/// Emitted batches are kept in a shared history and replayed to new
/// subscribers whose `since` id is older than the batch, the way FSEvents
/// replays its journal. Clones share the same history, which lets tests
/// simulate a process restart against the same event log.
#[derive(Clone, Default)]
pub struct ManualEventSource {
    state: Arc<Mutex<ManualState>>,
}

impl std::fmt::Debug for ManualEventSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("ManualEventSource")
            .field("subscribed", &state.sink.is_some())
            .field("history", &state.history.len())
            .finish()
    }
}

impl ManualEventSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records `batch` and delivers it to the current subscriber, if any.
    ///
    /// Returns true if a subscriber received it.
    pub fn emit(&self, batch: RawBatch) -> bool {
        let sink = {
            let mut state = self.state.lock();
            state.history.push(batch.clone());
            state.sink.clone()
        };
        match sink {
            Some(sink) => {
                sink(batch);
                true
            }
            None => false,
        }
    }

    pub fn is_subscribed(&self) -> bool {
        self.state.lock().sink.is_some()
    }

    /// The `since` id passed to the most recent subscribe call.
    pub fn last_since(&self) -> Option<SequenceId> {
        self.state.lock().subscriptions.last().map(|(_, since)| *since)
    }

    /// Roots passed to the most recent subscribe call.
    pub fn last_roots(&self) -> Option<Vec<PathBuf>> {
        self.state
            .lock()
            .subscriptions
            .last()
            .map(|(roots, _)| roots.clone())
    }
}

impl EventSource for ManualEventSource {
    type Subscription = ManualSubscription;

    fn subscribe(
        &mut self,
        roots: &[PathBuf],
        since: SequenceId,
        sink: BatchSink,
    ) -> Result<ManualSubscription> {
        let replay: Vec<RawBatch> = {
            let mut state = self.state.lock();
            if state.sink.is_some() {
                return Err(SearchIndexError::Watch(
                    "manual event source already has a subscriber".into(),
                ));
            }
            state.subscriptions.push((roots.to_vec(), since));
            state.sink = Some(sink.clone());
            if since.is_since_now() {
                Vec::new()
            } else {
                state
                    .history
                    .iter()
                    .filter(|batch| batch.ids.iter().any(|id| *id > since.get()))
                    .cloned()
                    .collect()
            }
        };

        for batch in replay {
            sink(batch);
        }

        Ok(ManualSubscription {
            state: Some(self.state.clone()),
        })
    }
}

pub struct ManualSubscription {
    state: Option<Arc<Mutex<ManualState>>>,
}

impl Subscription for ManualSubscription {
    fn unsubscribe(&mut self) {
        if let Some(state) = self.state.take() {
            state.lock().sink = None;
        }
    }
}

impl Drop for ManualSubscription {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn validate_rejects_mismatched_arrays() {
        let batch = RawBatch {
            paths: vec![PathBuf::from("/a")],
            flags: vec![],
            ids: vec![1],
        };
        assert!(matches!(
            batch.validate(),
            Err(SearchIndexError::MalformedNotification(_))
        ));
        assert!(RawBatch::new().validate().is_err());
    }

    #[test]
    fn validate_returns_highest_id() {
        let batch = RawBatch::new()
            .with("/a", 0x100, 7)
            .with("/b", 0x100, 12)
            .with("/c", 0x100, 9);
        assert_eq!(batch.validate().expect("valid"), SequenceId(12));
    }

    #[test]
    fn manual_source_replays_only_newer_batches() {
        let mut source = ManualEventSource::new();
        source.emit(RawBatch::new().with("/a", 0x100, 1));
        source.emit(RawBatch::new().with("/b", 0x100, 2));
        source.emit(RawBatch::new().with("/c", 0x100, 3));

        let seen = Arc::new(AtomicUsize::new(0));
        let counter = seen.clone();
        let sink: BatchSink = Arc::new(move |_batch| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        let mut subscription = source
            .subscribe(&[PathBuf::from("/")], SequenceId(1), sink)
            .expect("subscribe");
        assert_eq!(seen.load(Ordering::SeqCst), 2);
        assert_eq!(source.last_since(), Some(SequenceId(1)));

        subscription.unsubscribe();
        assert!(!source.is_subscribed());
        assert!(!source.emit(RawBatch::new().with("/d", 0x100, 4)));
        assert_eq!(seen.load(Ordering::SeqCst), 2);
    }
}
