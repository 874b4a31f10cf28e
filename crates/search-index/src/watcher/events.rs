//! Change flag decoding.
//!
//! Event sources report one 32-bit mask per path. The low byte carries
//! stream-level markers (history done, dropped events, ...) and the bits from
//! `0x100` upwards describe what happened to the item itself. The layout is
//! the FSEvents one; the `notify` source synthesizes masks in the same layout.

use std::path::PathBuf;

use bitflags::bitflags;
use fnv::FnvHashMap;

// ---------------------------------------------------------------------------
// Item kinds
// ---------------------------------------------------------------------------

bitflags! {
    /// Set of item-level event kinds reported for a single path.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct EventKinds: u32 {
        const CREATED                 = 0x0000_0100;
        const REMOVED                 = 0x0000_0200;
        const INODE_METADATA_CHANGED  = 0x0000_0400;
        const RENAMED                 = 0x0000_0800;
        const CONTENT_MODIFIED        = 0x0000_1000;
        const FINDER_METADATA_CHANGED = 0x0000_2000;
        const OWNER_CHANGED           = 0x0000_4000;
        const EXTENDED_ATTR_MODIFIED  = 0x0000_8000;
        const IS_FILE                 = 0x0001_0000;
        const IS_DIRECTORY            = 0x0002_0000;
        const IS_SYMLINK              = 0x0004_0000;
        // 0x0008_0000 is the "own event" marker, not an item kind.
        const IS_HARDLINK             = 0x0010_0000;
        const IS_LAST_HARDLINK        = 0x0020_0000;
        const CLONED                  = 0x0040_0000;
    }
}

/// A single semantic event kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum EventKind {
    Created,
    Removed,
    InodeMetadataChanged,
    Renamed,
    ContentModified,
    FinderMetadataChanged,
    OwnerChanged,
    ExtendedAttrModified,
    IsFile,
    IsDirectory,
    IsSymlink,
    IsHardlink,
    IsLastHardlink,
    Cloned,
}

impl EventKind {
    /// Every known kind, in bit order.
    pub const ALL: [EventKind; 14] = [
        Self::Created,
        Self::Removed,
        Self::InodeMetadataChanged,
        Self::Renamed,
        Self::ContentModified,
        Self::FinderMetadataChanged,
        Self::OwnerChanged,
        Self::ExtendedAttrModified,
        Self::IsFile,
        Self::IsDirectory,
        Self::IsSymlink,
        Self::IsHardlink,
        Self::IsLastHardlink,
        Self::Cloned,
    ];

    /// The flag bit this kind is decoded from.
    pub fn flag(self) -> EventKinds {
        match self {
            Self::Created => EventKinds::CREATED,
            Self::Removed => EventKinds::REMOVED,
            Self::InodeMetadataChanged => EventKinds::INODE_METADATA_CHANGED,
            Self::Renamed => EventKinds::RENAMED,
            Self::ContentModified => EventKinds::CONTENT_MODIFIED,
            Self::FinderMetadataChanged => EventKinds::FINDER_METADATA_CHANGED,
            Self::OwnerChanged => EventKinds::OWNER_CHANGED,
            Self::ExtendedAttrModified => EventKinds::EXTENDED_ATTR_MODIFIED,
            Self::IsFile => EventKinds::IS_FILE,
            Self::IsDirectory => EventKinds::IS_DIRECTORY,
            Self::IsSymlink => EventKinds::IS_SYMLINK,
            Self::IsHardlink => EventKinds::IS_HARDLINK,
            Self::IsLastHardlink => EventKinds::IS_LAST_HARDLINK,
            Self::Cloned => EventKinds::CLONED,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Removed => "removed",
            Self::InodeMetadataChanged => "inode-metadata-changed",
            Self::Renamed => "renamed",
            Self::ContentModified => "content-modified",
            Self::FinderMetadataChanged => "finder-metadata-changed",
            Self::OwnerChanged => "owner-changed",
            Self::ExtendedAttrModified => "xattr-modified",
            Self::IsFile => "is-file",
            Self::IsDirectory => "is-directory",
            Self::IsSymlink => "is-symlink",
            Self::IsHardlink => "is-hardlink",
            Self::IsLastHardlink => "is-last-hardlink",
            Self::Cloned => "cloned",
        }
    }
}

impl EventKinds {
    /// Returns true if `kind` is part of this set.
    pub fn has(self, kind: EventKind) -> bool {
        self.contains(kind.flag())
    }

    /// Iterates the contained kinds in bit order.
    pub fn kinds(self) -> impl Iterator<Item = EventKind> {
        EventKind::ALL
            .into_iter()
            .filter(move |kind| self.contains(kind.flag()))
    }
}

impl FromIterator<EventKind> for EventKinds {
    fn from_iter<I: IntoIterator<Item = EventKind>>(iter: I) -> Self {
        iter.into_iter()
            .fold(EventKinds::empty(), |acc, kind| acc | kind.flag())
    }
}

/// Decodes a raw change mask into its item-level kinds.
///
/// Unknown and stream-level bits are ignored, so decoding never fails.
#[inline]
pub fn decode(mask: u32) -> EventKinds {
    EventKinds::from_bits_truncate(mask)
}

// ---------------------------------------------------------------------------
// Stream-level flags and scan classification
// ---------------------------------------------------------------------------

bitflags! {
    /// Stream-level markers carried in the low byte of a change mask.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct StreamFlags: u32 {
        const MUST_SCAN_SUBDIRS = 0x0000_0001;
        const USER_DROPPED      = 0x0000_0002;
        const KERNEL_DROPPED    = 0x0000_0004;
        const EVENT_IDS_WRAPPED = 0x0000_0008;
        const HISTORY_DONE      = 0x0000_0010;
        const ROOT_CHANGED      = 0x0000_0020;
        const MOUNT             = 0x0000_0040;
        const UNMOUNT           = 0x0000_0080;
    }
}

/// How a consumer should treat the path of an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanType {
    /// Marker only, nothing changed on disk.
    Nop,
    /// Per-item information is unreliable; rescan the subtree.
    ReScan,
    /// A directory changed.
    Folder,
    /// A single non-directory item changed.
    SingleNode,
}

impl ScanType {
    pub fn classify(mask: u32) -> Self {
        let stream = StreamFlags::from_bits_truncate(mask);
        if stream.intersects(StreamFlags::HISTORY_DONE | StreamFlags::EVENT_IDS_WRAPPED) {
            return Self::Nop;
        }
        if stream.intersects(
            StreamFlags::MUST_SCAN_SUBDIRS
                | StreamFlags::ROOT_CHANGED
                | StreamFlags::USER_DROPPED
                | StreamFlags::KERNEL_DROPPED
                | StreamFlags::MOUNT
                | StreamFlags::UNMOUNT,
        ) {
            return Self::ReScan;
        }
        if decode(mask).contains(EventKinds::IS_DIRECTORY) {
            return Self::Folder;
        }
        Self::SingleNode
    }

    /// Orders scan types by how much work they imply.
    fn weight(self) -> u8 {
        match self {
            Self::Nop => 0,
            Self::SingleNode => 1,
            Self::Folder => 2,
            Self::ReScan => 3,
        }
    }

    /// Keeps the heavier of two classifications.
    pub fn merge(self, other: Self) -> Self {
        if other.weight() > self.weight() {
            other
        } else {
            self
        }
    }
}

// ---------------------------------------------------------------------------
// Change events
// ---------------------------------------------------------------------------

/// Everything reported for one path within one notification batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeEvent {
    pub path: PathBuf,
    pub kinds: EventKinds,
    pub scan: ScanType,
}

impl ChangeEvent {
    pub fn new(path: PathBuf, mask: u32) -> Self {
        Self {
            path,
            kinds: decode(mask),
            scan: ScanType::classify(mask),
        }
    }

    /// Returns true if the event carries nothing a consumer could act on.
    pub fn is_noise(&self) -> bool {
        self.kinds.is_empty() && self.scan != ScanType::ReScan
    }
}

/// Decodes path/flag pairs and merges repeated paths.
///
/// Kinds for the same path are OR'd; the first occurrence decides the
/// position in the output. Events without kinds are dropped unless they ask
/// for a rescan.
pub fn coalesce_batch<'a, I>(pairs: I) -> Vec<ChangeEvent>
where
    I: IntoIterator<Item = (&'a PathBuf, u32)>,
{
    let mut events: Vec<ChangeEvent> = Vec::new();
    let mut positions: FnvHashMap<&'a PathBuf, usize> = FnvHashMap::default();

    for (path, mask) in pairs {
        let incoming = ChangeEvent::new(path.clone(), mask);
        match positions.get(path) {
            Some(&position) => {
                let existing = &mut events[position];
                existing.kinds |= incoming.kinds;
                existing.scan = existing.scan.merge(incoming.scan);
            }
            None => {
                positions.insert(path, events.len());
                events.push(incoming);
            }
        }
    }

    events.retain(|event| !event.is_noise());
    events
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_zero_is_empty() {
        assert!(decode(0).is_empty());
    }

    #[test]
    fn decode_maps_each_known_bit() {
        for kind in EventKind::ALL {
            let decoded = decode(kind.flag().bits());
            assert_eq!(decoded.kinds().collect::<Vec<_>>(), vec![kind]);
        }
    }

    #[test]
    fn decode_ignores_unknown_and_stream_bits() {
        let mask = 0x0000_0001 | 0x0000_0010 | 0x0008_0000 | 0x8000_0000 | 0x100;
        assert_eq!(decode(mask), EventKinds::CREATED);
    }

    #[test]
    fn decode_is_a_subset_of_known_kinds() {
        let all = EventKind::ALL.into_iter().collect::<EventKinds>();
        for shift in 0..32 {
            let mask = 1u32 << shift;
            assert!(all.contains(decode(mask)));
            assert!(all.contains(decode(!mask)));
        }
        assert_eq!(decode(u32::MAX), all);
    }

    #[test]
    fn decode_union_matches_disjoint_or() {
        let masks = [0x0001_0100u32, 0x0000_0a00, 0x0060_4000, 0x8000_0011, 0x0002_1000];
        for a in masks {
            for b in masks {
                if a & b != 0 {
                    continue;
                }
                assert_eq!(decode(a) | decode(b), decode(a | b));
            }
        }
    }

    #[test]
    fn classify_scan_types() {
        assert_eq!(ScanType::classify(0x10), ScanType::Nop);
        assert_eq!(ScanType::classify(0x01), ScanType::ReScan);
        assert_eq!(ScanType::classify(0x20), ScanType::ReScan);
        assert_eq!(ScanType::classify(0x0002_0100), ScanType::Folder);
        assert_eq!(ScanType::classify(0x0001_0100), ScanType::SingleNode);
    }

    #[test]
    fn coalesce_merges_kinds_per_path_in_first_seen_order() {
        let a = PathBuf::from("/w/a.txt");
        let b = PathBuf::from("/w/b.txt");
        let pairs = vec![
            (&a, EventKinds::CREATED.bits()),
            (&b, EventKinds::REMOVED.bits()),
            (&a, (EventKinds::CONTENT_MODIFIED | EventKinds::IS_FILE).bits()),
        ];

        let events = coalesce_batch(pairs);
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].path, a);
        assert_eq!(
            events[0].kinds,
            EventKinds::CREATED | EventKinds::CONTENT_MODIFIED | EventKinds::IS_FILE
        );
        assert_eq!(events[1].path, b);
    }

    #[test]
    fn coalesce_drops_markers_but_keeps_rescans() {
        let done = PathBuf::from("");
        let root = PathBuf::from("/w");
        let pairs = vec![(&done, 0x10), (&root, 0x01)];

        let events = coalesce_batch(pairs);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].path, root);
        assert_eq!(events[0].scan, ScanType::ReScan);
        assert!(events[0].kinds.is_empty());
    }

    #[test]
    fn volume_mount_changes_request_a_rescan() {
        assert_eq!(ScanType::classify(0x40), ScanType::ReScan);
        assert_eq!(ScanType::classify(0x80), ScanType::ReScan);

        let volume = PathBuf::from("/w/Volumes/backup");
        let events = coalesce_batch(vec![(&volume, StreamFlags::UNMOUNT.bits())]);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].scan, ScanType::ReScan);
        assert!(!events[0].is_noise());
    }
}
