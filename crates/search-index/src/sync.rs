//! Applies watcher batches to an index.
//!
//! The file system is the source of truth: a path that still exists after
//! an event is (re)indexed, a path that is gone is removed together with
//! anything indexed below it. Directories that appear, and rescan requests,
//! drop vanished descendants and index the whole subtree.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::error::SearchIndexError;
use crate::index::{Index, IndexStore};
use crate::watcher::{is_hidden_leaf, ChangeEvent, EventKinds, ScanType};

/// What the reconciler did with one path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncAction {
    Added,
    Removed,
    /// Nothing to do: hidden item, metadata-only directory change, or a
    /// removal of something that was never indexed.
    Skipped,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncOutcome {
    pub path: PathBuf,
    pub action: SyncAction,
}

impl SyncOutcome {
    fn new(path: impl Into<PathBuf>, action: SyncAction) -> Self {
        Self {
            path: path.into(),
            action,
        }
    }
}

/// Kinds after which a directory's contents may be unknown to the index.
const DIRECTORY_APPEARED: EventKinds = EventKinds::CREATED.union(EventKinds::RENAMED);

/// Keeps an index in step with change events.
pub struct Reconciler<S: IndexStore> {
    index: Arc<Index<S>>,
    note: Option<String>,
}

impl<S: IndexStore> std::fmt::Debug for Reconciler<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reconciler")
            .field("index", &self.index.path())
            .field("note", &self.note)
            .finish()
    }
}

impl<S: IndexStore + 'static> Reconciler<S> {
    pub fn new(index: Arc<Index<S>>) -> Self {
        Self { index, note: None }
    }

    /// Attaches `note` to every document this reconciler adds.
    pub fn with_note(mut self, note: impl Into<String>) -> Self {
        self.note = Some(note.into());
        self
    }

    pub fn index(&self) -> &Arc<Index<S>> {
        &self.index
    }

    /// Applies one batch, returning an outcome per touched path.
    pub fn apply(&self, events: &[ChangeEvent]) -> Vec<SyncOutcome> {
        let mut outcomes = Vec::with_capacity(events.len());
        for event in events {
            self.apply_one(event, &mut outcomes);
        }
        outcomes
    }

    /// Turns the reconciler into a watcher consumer that logs a summary of
    /// each batch.
    pub fn into_consumer(self) -> impl Fn(Vec<ChangeEvent>) + Send + Sync + 'static {
        move |events| {
            let outcomes = self.apply(&events);
            let count = |action| outcomes.iter().filter(|o| o.action == action).count();
            log::debug!(
                "synced batch: {} added, {} removed, {} skipped, {} failed",
                count(SyncAction::Added),
                count(SyncAction::Removed),
                count(SyncAction::Skipped),
                count(SyncAction::Failed)
            );
        }
    }

    fn apply_one(&self, event: &ChangeEvent, outcomes: &mut Vec<SyncOutcome>) {
        let path = event.path.as_path();
        let Ok(metadata) = path.symlink_metadata() else {
            self.remove(path, outcomes);
            return;
        };

        if metadata.is_dir() {
            let rescan = event.scan == ScanType::ReScan || event.kinds.intersects(DIRECTORY_APPEARED);
            if rescan {
                self.prune(path, outcomes);
                self.add_tree(path, outcomes);
            } else {
                outcomes.push(SyncOutcome::new(path, SyncAction::Skipped));
            }
            return;
        }

        if is_hidden_leaf(path) {
            outcomes.push(SyncOutcome::new(path, SyncAction::Skipped));
            return;
        }
        self.add(path, outcomes);
    }

    fn add(&self, path: &Path, outcomes: &mut Vec<SyncOutcome>) {
        let action = match self.index.add_document(path, self.note.as_deref()) {
            Ok(true) => SyncAction::Added,
            Ok(false) => SyncAction::Skipped,
            // Deleted between the event and now.
            Err(SearchIndexError::NotFound(_)) => return self.remove(path, outcomes),
            Err(error) => {
                log::warn!("failed to index {}: {error}", path.display());
                SyncAction::Failed
            }
        };
        outcomes.push(SyncOutcome::new(path, action));
    }

    /// Removes `path` and, when it was a directory, everything indexed below it.
    fn remove(&self, path: &Path, outcomes: &mut Vec<SyncOutcome>) {
        let removed = self.index.remove_documents_under(path);
        if removed.is_empty() {
            outcomes.push(SyncOutcome::new(path, SyncAction::Skipped));
            return;
        }
        outcomes.extend(
            removed
                .into_iter()
                .map(|document| SyncOutcome::new(document, SyncAction::Removed)),
        );
    }

    fn prune(&self, dir: &Path, outcomes: &mut Vec<SyncOutcome>) {
        outcomes.extend(
            self.index
                .prune_missing_under(dir)
                .into_iter()
                .map(|document| SyncOutcome::new(document, SyncAction::Removed)),
        );
    }

    fn add_tree(&self, dir: &Path, outcomes: &mut Vec<SyncOutcome>) {
        match self.index.add_documents_in(dir, self.note.as_deref()) {
            Ok(added) => outcomes.extend(added.into_iter().map(|(path, ok)| {
                let action = match ok {
                    true if is_hidden_leaf(&path) => SyncAction::Skipped,
                    true => SyncAction::Added,
                    false => SyncAction::Failed,
                };
                SyncOutcome::new(path, action)
            })),
            Err(error) => {
                log::warn!("failed to index directory {}: {error}", dir.display());
                outcomes.push(SyncOutcome::new(dir, SyncAction::Failed));
            }
        }
    }
}
