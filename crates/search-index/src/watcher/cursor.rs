//! Durable position in the change stream.
//!
//! The watcher records the id of the last batch it processed so that a
//! restarted process resumes right after it. Reading a cursor never fails:
//! a missing or damaged entry degrades to [`SequenceId::SINCE_NOW`].

use std::fmt;
use std::fs;
use std::hash::Hasher;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use fnv::FnvHasher;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::error::{Result, SearchIndexError};

/// Identifier the event source assigns to each event, increasing over time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SequenceId(pub u64);

impl SequenceId {
    /// "Only report events from now on." Same value as FSEvents' own sentinel.
    pub const SINCE_NOW: SequenceId = SequenceId(u64::MAX);

    pub fn get(self) -> u64 {
        self.0
    }

    pub fn is_since_now(self) -> bool {
        self == Self::SINCE_NOW
    }
}

impl fmt::Display for SequenceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_since_now() {
            f.write_str("since-now")
        } else {
            write!(f, "{}", self.0)
        }
    }
}

/// Persists the last processed sequence id.
///
/// Implementations are called from the watcher's delivery thread only; they
/// never see concurrent writers.
pub trait CursorStore: Send + Sync {
    /// Returns the stored id, or `SINCE_NOW` when nothing usable is stored.
    fn load(&self) -> SequenceId;
    /// Durably records `id`. Saving the same id twice is harmless.
    fn save(&self, id: SequenceId) -> Result<()>;
}

// ---------------------------------------------------------------------------
// In-memory store
// ---------------------------------------------------------------------------

/// Cursor kept in memory, for tests and watchers that never resume.
#[derive(Debug, Default)]
pub struct MemoryCursorStore {
    value: Mutex<Option<SequenceId>>,
}

impl MemoryCursorStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_value(id: SequenceId) -> Self {
        Self {
            value: Mutex::new(Some(id)),
        }
    }
}

impl CursorStore for MemoryCursorStore {
    fn load(&self) -> SequenceId {
        let stored = *self.value.lock();
        stored.unwrap_or(SequenceId::SINCE_NOW)
    }

    fn save(&self, id: SequenceId) -> Result<()> {
        *self.value.lock() = Some(id);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// File-backed store
// ---------------------------------------------------------------------------

/// Cursor file format version - increment when changing the format.
pub const CURSOR_FILE_VERSION: u32 = 1;

#[derive(Debug, Serialize, Deserialize)]
struct PersistedCursor {
    version: u32,
    roots: Vec<PathBuf>,
    last_event_id: u64,
}

/// Cursor stored as a small JSON file, one file per set of watched roots.
#[derive(Debug, Clone)]
pub struct FileCursorStore {
    path: PathBuf,
    roots: Vec<PathBuf>,
}

impl FileCursorStore {
    /// Creates a store for `roots` inside `dir`.
    ///
    /// Roots are sorted and deduplicated, so the same set in any order maps to
    /// the same cursor file.
    pub fn new(dir: &Path, roots: &[PathBuf]) -> Self {
        let mut roots = roots.to_vec();
        roots.sort();
        roots.dedup();
        let path = dir.join(format!("cursor-{}.json", roots_fingerprint(&roots)));
        Self { path, roots }
    }

    /// Location of the cursor file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read(&self) -> Result<Option<SequenceId>> {
        let data = match fs::read_to_string(&self.path) {
            Ok(data) => data,
            Err(error) if error.kind() == ErrorKind::NotFound => return Ok(None),
            Err(error) => return Err(error.into()),
        };
        let stored: PersistedCursor = serde_json::from_str(&data).map_err(|error| {
            SearchIndexError::CursorUnavailable(format!(
                "failed to parse cursor {}: {error}",
                self.path.display()
            ))
        })?;
        if stored.version != CURSOR_FILE_VERSION {
            return Err(SearchIndexError::CursorUnavailable(format!(
                "cursor version mismatch: {} != {}",
                stored.version, CURSOR_FILE_VERSION
            )));
        }
        if stored.roots != self.roots {
            return Err(SearchIndexError::CursorUnavailable(format!(
                "cursor roots mismatch in {}",
                self.path.display()
            )));
        }
        Ok(Some(SequenceId(stored.last_event_id)))
    }
}

impl CursorStore for FileCursorStore {
    fn load(&self) -> SequenceId {
        match self.read() {
            Ok(Some(id)) => {
                log::debug!("resuming from cursor {} ({})", id, self.path.display());
                id
            }
            Ok(None) => SequenceId::SINCE_NOW,
            Err(error) => {
                log::warn!("cursor ignored, watching from now: {error}");
                SequenceId::SINCE_NOW
            }
        }
    }

    fn save(&self, id: SequenceId) -> Result<()> {
        let dir = self
            .path
            .parent()
            .ok_or_else(|| SearchIndexError::Internal("cursor path has no parent".into()))?;
        fs::create_dir_all(dir).map_err(|error| {
            SearchIndexError::Internal(format!(
                "failed to create cursor directory {}: {error}",
                dir.display()
            ))
        })?;

        let stored = PersistedCursor {
            version: CURSOR_FILE_VERSION,
            roots: self.roots.clone(),
            last_event_id: id.get(),
        };
        let encoded = serde_json::to_vec(&stored)
            .map_err(|error| SearchIndexError::Serialization(error.to_string()))?;

        // Write to a sibling temp file, then rename over the old cursor.
        let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
        tmp.write_all(&encoded)?;
        tmp.as_file().sync_all()?;
        tmp.persist(&self.path).map_err(|error| {
            SearchIndexError::Internal(format!(
                "failed to finalize cursor {}: {}",
                self.path.display(),
                error.error
            ))
        })?;
        Ok(())
    }
}

/// FNV-1a over the root list, with separators so `["/a", "/b"]` and
/// `["/a/b"]` differ.
fn roots_fingerprint(roots: &[PathBuf]) -> String {
    let mut hasher = FnvHasher::default();
    for root in roots {
        hasher.write(root.to_string_lossy().as_bytes());
        hasher.write(&[0xfe]);
    }
    format!("{:016x}", hasher.finish())
}
