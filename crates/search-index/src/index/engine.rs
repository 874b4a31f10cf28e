//! Contract between the index handle and a full-text engine.
//!
//! The handle decides what to index and when; the engine owns storage,
//! tokenization, matching and scoring.

use std::path::{Path, PathBuf};
use std::time::Instant;

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::query::SearchOptions;

/// Engine-assigned document identifier, stable for the lifetime of a document.
pub type DocumentId = u64;

/// What text an index holds for each document. Fixed when the index is created.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IndexKind {
    /// Filename-derived text plus an optional caller note.
    NameIndexed,
    /// Text extracted from the file body.
    ContentIndexed,
}

impl IndexKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::NameIndexed => "name_indexed",
            Self::ContentIndexed => "content_indexed",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OpenMode {
    /// Writes are ignored.
    ReadOnly,
    /// At most one such handle per index path per process.
    WriteAndRead,
}

impl OpenMode {
    pub fn is_writable(self) -> bool {
        matches!(self, Self::WriteAndRead)
    }
}

/// A ranked-search request as the engine sees it. The text is already
/// normalized for the caller's match mode.
#[derive(Debug, Clone, Copy)]
pub struct EngineQuery<'a> {
    pub text: &'a str,
    pub options: SearchOptions,
    pub limit: usize,
    pub deadline: Option<Instant>,
}

/// Parallel id/score arrays returned by an engine search.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EngineMatches {
    pub ids: Vec<DocumentId>,
    pub scores: Vec<f32>,
}

impl EngineMatches {
    pub fn push(&mut self, id: DocumentId, score: f32) {
        self.ids.push(id);
        self.scores.push(score);
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }
}

/// Creates and opens stores.
pub trait IndexEngine {
    type Store: IndexStore;

    /// Creates a new, empty store at `path`. Fails with `CreateConflict` if
    /// anything already exists there.
    fn create(&self, path: &Path, kind: IndexKind) -> Result<Self::Store>;

    /// Opens an existing store.
    fn open(&self, path: &Path, mode: OpenMode) -> Result<Self::Store>;
}

/// One open physical index.
pub trait IndexStore: Send + Sync {
    fn kind(&self) -> IndexKind;

    /// Indexes `document` with caller-supplied text, replacing any previous
    /// entry for the same path.
    fn add_with_text(&mut self, document: &Path, text: &str) -> Result<bool>;

    /// Produces the text the engine would index for `document`.
    fn extract_text(&self, document: &Path) -> Result<String>;

    /// Indexes `document` with engine-extracted text.
    fn add(&mut self, document: &Path) -> Result<bool> {
        let text = self.extract_text(document)?;
        self.add_with_text(document, &text)
    }

    /// Returns false if `document` was not indexed.
    fn remove(&mut self, document: &Path) -> Result<bool>;

    /// Reclaims space left behind by removals.
    fn compact(&mut self) -> Result<()>;

    /// Makes all previous writes durable.
    fn flush(&mut self) -> Result<()>;

    fn search(&self, query: &EngineQuery<'_>) -> Result<EngineMatches>;

    /// Maps ids back to document paths; ids that no longer exist map to `None`.
    fn resolve_paths(&self, ids: &[DocumentId]) -> Vec<Option<PathBuf>>;

    fn document_count(&self) -> usize;

    /// Indexed paths equal to `dir` or below it.
    fn paths_under(&self, dir: &Path) -> Vec<PathBuf>;

    /// Flushes pending writes and releases the store. Later calls are no-ops.
    fn close(&mut self) -> Result<()>;
}
