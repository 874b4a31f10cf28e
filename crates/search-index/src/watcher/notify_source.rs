//! `notify`-backed event source for platforms without FSEvents.
//!
//! notify has neither event ids nor a journal, so ids are synthesized from a
//! counter that continues after the resume position, and `since` never
//! replays history.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use notify::event::{CreateKind, MetadataKind, ModifyKind, RemoveKind};
use notify::{recommended_watcher, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};

use super::cursor::SequenceId;
use super::events::{EventKinds, StreamFlags};
use super::source::{BatchSink, EventSource, RawBatch, Subscription};
use crate::error::{Result, SearchIndexError};

/// Event source backed by the platform's recommended `notify` watcher.
#[derive(Debug, Default, Clone, Copy)]
pub struct NotifyEventSource;

impl NotifyEventSource {
    pub fn new() -> Self {
        Self
    }
}

impl EventSource for NotifyEventSource {
    type Subscription = NotifySubscription;

    fn subscribe(
        &mut self,
        roots: &[PathBuf],
        since: SequenceId,
        sink: BatchSink,
    ) -> Result<NotifySubscription> {
        if roots.is_empty() {
            return Err(SearchIndexError::Watch("no roots to watch".into()));
        }
        if !since.is_since_now() {
            log::debug!("notify cannot replay history after {since}; watching from now");
        }

        let first_id = if since.is_since_now() { 1 } else { since.get().saturating_add(1) };
        let next_id = Arc::new(AtomicU64::new(first_id));
        let callback_roots = roots.to_vec();

        let mut watcher = recommended_watcher(move |event_result: notify::Result<Event>| {
            match event_result {
                Ok(event) => {
                    if let Some(batch) = batch_from_event(event, &callback_roots, &next_id) {
                        sink(batch);
                    }
                }
                Err(error) => log::warn!("notify watcher error: {error}"),
            }
        })
        .map_err(|error| {
            SearchIndexError::Watch(format!("failed to create filesystem watcher: {error}"))
        })?;

        for root in roots {
            watcher
                .watch(root, RecursiveMode::Recursive)
                .map_err(|error| {
                    SearchIndexError::Watch(format!("failed to watch {}: {error}", root.display()))
                })?;
        }

        Ok(NotifySubscription {
            watcher: Some(watcher),
        })
    }
}

pub struct NotifySubscription {
    watcher: Option<RecommendedWatcher>,
}

impl Subscription for NotifySubscription {
    fn unsubscribe(&mut self) {
        // Dropping the watcher joins its event thread.
        self.watcher.take();
    }
}

impl Drop for NotifySubscription {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}

/// Translates a notify event into the flag vocabulary the watcher decodes.
pub(crate) fn mask_for(kind: &EventKind) -> Option<u32> {
    let kinds = match kind {
        EventKind::Access(_) => return None,
        EventKind::Create(CreateKind::File) => EventKinds::CREATED | EventKinds::IS_FILE,
        EventKind::Create(CreateKind::Folder) => EventKinds::CREATED | EventKinds::IS_DIRECTORY,
        EventKind::Create(_) => EventKinds::CREATED,
        EventKind::Remove(RemoveKind::File) => EventKinds::REMOVED | EventKinds::IS_FILE,
        EventKind::Remove(RemoveKind::Folder) => EventKinds::REMOVED | EventKinds::IS_DIRECTORY,
        EventKind::Remove(_) => EventKinds::REMOVED,
        EventKind::Modify(ModifyKind::Data(_)) => EventKinds::CONTENT_MODIFIED,
        EventKind::Modify(ModifyKind::Name(_)) => EventKinds::RENAMED,
        EventKind::Modify(ModifyKind::Metadata(MetadataKind::Ownership)) => {
            EventKinds::OWNER_CHANGED
        }
        EventKind::Modify(ModifyKind::Metadata(MetadataKind::Extended)) => {
            EventKinds::EXTENDED_ATTR_MODIFIED
        }
        EventKind::Modify(ModifyKind::Metadata(_)) => EventKinds::INODE_METADATA_CHANGED,
        EventKind::Modify(_) | EventKind::Any | EventKind::Other => {
            EventKinds::CONTENT_MODIFIED
        }
    };
    Some(kinds.bits())
}

fn batch_from_event(event: Event, roots: &[PathBuf], next_id: &AtomicU64) -> Option<RawBatch> {
    let mut batch = RawBatch::new();

    if event.need_rescan() || event.paths.is_empty() {
        // The backend lost track; ask the consumer to rescan every root.
        for root in roots {
            let id = next_id.fetch_add(1, Ordering::SeqCst);
            batch.push(root.clone(), StreamFlags::MUST_SCAN_SUBDIRS.bits(), id);
        }
        return Some(batch);
    }

    let mask = mask_for(&event.kind)?;
    for path in event.paths {
        let id = next_id.fetch_add(1, Ordering::SeqCst);
        batch.push(path, mask, id);
    }
    Some(batch)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::watcher::events::{decode, ScanType};
    use notify::event::{DataChange, Flag, RenameMode};
    use parking_lot::Mutex;
    use std::time::{Duration, Instant};
    use tempfile::TempDir;

    #[test]
    fn access_events_are_ignored() {
        let event = Event::new(EventKind::Access(notify::event::AccessKind::Any))
            .add_path(PathBuf::from("/w/a"));
        let next = AtomicU64::new(1);
        assert!(batch_from_event(event, &[PathBuf::from("/w")], &next).is_none());
    }

    #[test]
    fn create_and_rename_map_to_item_kinds() {
        let created = mask_for(&EventKind::Create(CreateKind::Folder)).expect("mask");
        assert_eq!(decode(created), EventKinds::CREATED | EventKinds::IS_DIRECTORY);

        let renamed = mask_for(&EventKind::Modify(ModifyKind::Name(RenameMode::Both)))
            .expect("mask");
        assert_eq!(decode(renamed), EventKinds::RENAMED);

        let written = mask_for(&EventKind::Modify(ModifyKind::Data(DataChange::Content)))
            .expect("mask");
        assert_eq!(decode(written), EventKinds::CONTENT_MODIFIED);
    }

    #[test]
    fn ids_continue_after_resume_position() {
        let event = Event::new(EventKind::Modify(ModifyKind::Name(RenameMode::Both)))
            .add_path(PathBuf::from("/w/old"))
            .add_path(PathBuf::from("/w/new"));
        let next = AtomicU64::new(8);
        let batch = batch_from_event(event, &[PathBuf::from("/w")], &next).expect("batch");
        assert_eq!(batch.ids, vec![8, 9]);
        assert_eq!(batch.validate().expect("valid"), SequenceId(9));
    }

    #[test]
    fn rescan_flag_targets_roots() {
        let event = Event::new(EventKind::Other).set_flag(Flag::Rescan);
        let next = AtomicU64::new(1);
        let roots = [PathBuf::from("/w"), PathBuf::from("/v")];
        let batch = batch_from_event(event, &roots, &next).expect("batch");
        assert_eq!(batch.paths, roots.to_vec());
        assert_eq!(ScanType::classify(batch.flags[0]), ScanType::ReScan);
    }

    #[test]
    fn live_subscription_delivers_created_file() {
        let temp = TempDir::new().expect("tempdir");
        let root = temp.path().canonicalize().expect("canonical root");
        let received: Arc<Mutex<Vec<RawBatch>>> = Arc::default();
        let sink_received = received.clone();
        let sink: BatchSink = Arc::new(move |batch| sink_received.lock().push(batch));

        let mut source = NotifyEventSource::new();
        let mut subscription = source
            .subscribe(&[root.clone()], SequenceId::SINCE_NOW, sink)
            .expect("subscribe");

        let file = root.join("fresh.txt");
        std::fs::write(&file, b"hello").expect("write");

        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if received
                .lock()
                .iter()
                .any(|batch| batch.paths.iter().any(|path| path == &file))
            {
                break;
            }
            std::thread::sleep(Duration::from_millis(20));
        }
        subscription.unsubscribe();

        assert!(received
            .lock()
            .iter()
            .any(|batch| batch.paths.iter().any(|path| path == &file)));
    }
}
