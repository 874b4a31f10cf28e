//! Index file read/write operations.
//!
//! One index is one file: a postcard-encoded snapshot of every document and
//! its term frequencies, zstd-compressed. Postings are rebuilt on load.
//! Writes go to a sibling temp file that is renamed over the old snapshot.

use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::thread::available_parallelism;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use super::engine::{DocumentId, IndexKind};
use crate::error::{Result, SearchIndexError};

/// Index file format version - increment when changing the format.
pub const INDEX_FILE_VERSION: u32 = 1;

/// Stored form of one document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentEntry {
    pub path: PathBuf,
    /// Term and its frequency in the document, sorted by term.
    pub terms: Vec<(Box<str>, u32)>,
}

/// Snapshot as read back from disk.
#[derive(Deserialize)]
pub struct IndexSnapshot {
    pub version: u32,
    pub kind: IndexKind,
    pub next_id: DocumentId,
    pub documents: BTreeMap<DocumentId, DocumentEntry>,
    pub saved_at: u64,
}

/// Borrowed view written to disk; field order matches [`IndexSnapshot`].
#[derive(Serialize)]
pub struct SnapshotRef<'a> {
    pub version: u32,
    pub kind: IndexKind,
    pub next_id: DocumentId,
    pub documents: &'a BTreeMap<DocumentId, DocumentEntry>,
    pub saved_at: u64,
}

pub fn unix_now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|value| value.as_secs())
        .unwrap_or(0)
}

/// Writes a snapshot atomically.
///
/// - Postcard encoding
/// - Zstd compression (level 6, multi-threaded)
/// - Temp file + rename
pub fn write_snapshot(path: &Path, snapshot: &SnapshotRef<'_>) -> Result<()> {
    if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
        fs::create_dir_all(parent).map_err(|error| {
            SearchIndexError::Internal(format!(
                "failed to create index directory {}: {error}",
                parent.display()
            ))
        })?;
    }

    let tmp_path = temp_path_for(path);
    {
        let output = File::create(&tmp_path).map_err(|error| {
            SearchIndexError::Internal(format!(
                "failed to create index file {}: {error}",
                tmp_path.display()
            ))
        })?;

        let mut encoder = zstd::Encoder::new(output, 6).map_err(|error| {
            SearchIndexError::Internal(format!("failed to create zstd encoder: {error}"))
        })?;
        let threads = available_parallelism().map(|x| x.get() as u32).unwrap_or(4);
        encoder.multithread(threads).map_err(|error| {
            SearchIndexError::Internal(format!("failed to enable multi-threaded zstd: {error}"))
        })?;

        let mut output = BufWriter::new(encoder);
        postcard::to_io(snapshot, &mut output).map_err(|error| {
            SearchIndexError::Serialization(format!("failed to encode index: {error}"))
        })?;
        output.flush()?;
        let encoder = output.into_inner().map_err(|error| {
            SearchIndexError::Internal(format!("failed to flush index writer: {}", error.error()))
        })?;
        let file = encoder.finish()?;
        file.sync_all()?;
    }

    fs::rename(&tmp_path, path).map_err(|error| {
        SearchIndexError::Internal(format!(
            "failed to finalize index file {}: {error}",
            path.display()
        ))
    })?;

    log::debug!(
        "wrote index {} ({} documents)",
        path.display(),
        snapshot.documents.len()
    );
    Ok(())
}

/// Reads a snapshot.
///
/// Fails with `NotFound` when nothing is at `path` and with `Serialization`
/// when the file is not an index this version understands.
pub fn read_snapshot(path: &Path) -> Result<IndexSnapshot> {
    let input = match File::open(path) {
        Ok(file) => file,
        Err(error) if error.kind() == ErrorKind::NotFound => {
            return Err(SearchIndexError::NotFound(path.to_path_buf()));
        }
        Err(error) => return Err(error.into()),
    };

    let decoder = zstd::Decoder::new(input).map_err(|error| {
        SearchIndexError::Serialization(format!(
            "failed to open index {}: {error}",
            path.display()
        ))
    })?;
    let mut input = BufReader::new(decoder);
    let mut scratch = vec![0u8; 4 * 1024];

    let (snapshot, _): (IndexSnapshot, _) = postcard::from_io((&mut input, scratch.as_mut_slice()))
        .map_err(|error| {
            SearchIndexError::Serialization(format!(
                "failed to decode index {}: {error}",
                path.display()
            ))
        })?;

    if snapshot.version != INDEX_FILE_VERSION {
        return Err(SearchIndexError::Serialization(format!(
            "index version mismatch: {} != {}",
            snapshot.version, INDEX_FILE_VERSION
        )));
    }

    log::debug!(
        "loaded index {} ({} documents, saved_at={})",
        path.display(),
        snapshot.documents.len(),
        snapshot.saved_at
    );
    Ok(snapshot)
}

fn temp_path_for(path: &Path) -> PathBuf {
    let mut name = path.file_name().map(|name| name.to_os_string()).unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}
