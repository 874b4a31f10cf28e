//! Index handle: document identity, name/content text and write policy on
//! top of an engine store.

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use ignore::WalkBuilder;
use parking_lot::{Mutex, RwLock};
use rayon::prelude::*;

use super::engine::{IndexEngine, IndexKind, IndexStore, OpenMode};
use super::text::name_text;
use crate::error::{
    canonicalize_existing_path, canonicalize_maybe_missing, Result, SearchIndexError,
};
use crate::watcher::is_hidden_leaf;

/// Canonical paths of every index currently open for writing in this process.
static WRITERS: LazyLock<Mutex<HashSet<PathBuf>>> = LazyLock::new(Default::default);

/// Registration in [`WRITERS`], released on drop.
#[derive(Debug)]
struct WriterLease {
    path: PathBuf,
}

impl WriterLease {
    fn acquire(path: &Path) -> Result<Self> {
        if !WRITERS.lock().insert(path.to_path_buf()) {
            return Err(SearchIndexError::OpenConflict(path.to_path_buf()));
        }
        Ok(Self {
            path: path.to_path_buf(),
        })
    }
}

impl Drop for WriterLease {
    fn drop(&mut self) {
        WRITERS.lock().remove(&self.path);
    }
}

/// How name-indexed text is derived.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IndexOptions {
    /// Index `report` instead of `report.txt`.
    pub strip_extension: bool,
}

/// One open index.
///
/// Searches share a read lock; writes take it exclusively.
pub struct Index<S: IndexStore> {
    path: PathBuf,
    kind: IndexKind,
    mode: OpenMode,
    options: IndexOptions,
    store: RwLock<Option<S>>,
    lease: Mutex<Option<WriterLease>>,
}

impl<S: IndexStore> std::fmt::Debug for Index<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Index")
            .field("path", &self.path)
            .field("kind", &self.kind)
            .field("mode", &self.mode)
            .field("open", &self.is_open())
            .finish()
    }
}

impl<S: IndexStore> Index<S> {
    /// Opens the index at `path` for writing, creating it if nothing is there.
    ///
    /// Fails with `CreateConflict` when the path holds something that is not
    /// an index of `kind`, and with `OpenConflict` when another handle in this
    /// process already writes to it.
    pub fn open_or_create<E>(
        engine: &E,
        path: impl AsRef<Path>,
        kind: IndexKind,
        options: IndexOptions,
    ) -> Result<Self>
    where
        E: IndexEngine<Store = S>,
    {
        let path = canonicalize_maybe_missing(path.as_ref().to_path_buf());
        let lease = WriterLease::acquire(&path)?;

        let store = if path.symlink_metadata().is_ok() {
            match engine.open(&path, OpenMode::WriteAndRead) {
                Ok(store) if store.kind() == kind => store,
                Ok(mut store) => {
                    let existing = store.kind();
                    let _ = store.close();
                    log::warn!(
                        "index {} is {} but {} was requested",
                        path.display(),
                        existing.as_str(),
                        kind.as_str()
                    );
                    return Err(SearchIndexError::CreateConflict(path));
                }
                Err(error @ SearchIndexError::OpenConflict(_)) => return Err(error),
                Err(error) => {
                    log::warn!("cannot use {} as an index: {error}", path.display());
                    return Err(SearchIndexError::CreateConflict(path));
                }
            }
        } else {
            engine.create(&path, kind)?
        };

        log::info!("opened index {} ({})", path.display(), kind.as_str());
        Ok(Self::from_parts(path, OpenMode::WriteAndRead, options, store, Some(lease)))
    }

    /// Creates a new index. Fails with `CreateConflict` if anything exists at `path`.
    pub fn create<E>(
        engine: &E,
        path: impl AsRef<Path>,
        kind: IndexKind,
        options: IndexOptions,
    ) -> Result<Self>
    where
        E: IndexEngine<Store = S>,
    {
        let path = canonicalize_maybe_missing(path.as_ref().to_path_buf());
        let lease = WriterLease::acquire(&path)?;
        let store = engine.create(&path, kind)?;
        log::info!("created index {} ({})", path.display(), kind.as_str());
        Ok(Self::from_parts(path, OpenMode::WriteAndRead, options, store, Some(lease)))
    }

    /// Opens an existing index.
    pub fn open<E>(
        engine: &E,
        path: impl AsRef<Path>,
        mode: OpenMode,
        options: IndexOptions,
    ) -> Result<Self>
    where
        E: IndexEngine<Store = S>,
    {
        let path = canonicalize_maybe_missing(path.as_ref().to_path_buf());
        let lease = if mode.is_writable() {
            Some(WriterLease::acquire(&path)?)
        } else {
            None
        };
        let store = engine.open(&path, mode)?;
        log::info!("opened index {} ({:?})", path.display(), mode);
        Ok(Self::from_parts(path, mode, options, store, lease))
    }

    fn from_parts(
        path: PathBuf,
        mode: OpenMode,
        options: IndexOptions,
        store: S,
        lease: Option<WriterLease>,
    ) -> Self {
        Self {
            path,
            kind: store.kind(),
            mode,
            options,
            store: RwLock::new(Some(store)),
            lease: Mutex::new(lease),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn kind(&self) -> IndexKind {
        self.kind
    }

    pub fn mode(&self) -> OpenMode {
        self.mode
    }

    pub fn options(&self) -> IndexOptions {
        self.options
    }

    pub fn is_open(&self) -> bool {
        self.store.read().is_some()
    }

    /// Number of indexed documents; zero once closed.
    pub fn len(&self) -> usize {
        self.store
            .read()
            .as_ref()
            .map_or(0, |store| store.document_count())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Runs `f` against the store under the shared lock.
    pub(crate) fn read_store<R>(&self, f: impl FnOnce(&S) -> R) -> Option<R> {
        self.store.read().as_ref().map(f)
    }

    fn closed_error(&self) -> SearchIndexError {
        SearchIndexError::Internal(format!("index {} is closed", self.path.display()))
    }

    /// Indexes one file.
    ///
    /// Returns `Ok(true)` without indexing for hidden files and `Ok(false)`
    /// for read-only handles. Re-adding a path replaces its entry. The
    /// index is flushed before this returns.
    pub fn add_document(&self, path: impl AsRef<Path>, note: Option<&str>) -> Result<bool> {
        let path = path.as_ref();
        if fs::symlink_metadata(path).is_err() {
            return Err(SearchIndexError::NotFound(path.to_path_buf()));
        }
        let document = canonicalize_existing_path(path.to_path_buf());
        if is_hidden_leaf(&document) {
            log::debug!("not indexing hidden {}", document.display());
            return Ok(true);
        }
        if !self.mode.is_writable() {
            return Ok(false);
        }

        let mut guard = self.store.write();
        let store = guard.as_mut().ok_or_else(|| self.closed_error())?;
        let added = match self.kind {
            IndexKind::NameIndexed => {
                let text = name_text(&document, self.options.strip_extension, note);
                store.add_with_text(&document, &text)?
            }
            IndexKind::ContentIndexed => store.add(&document)?,
        };
        if added {
            store.flush()?;
            log::debug!("indexed {}", document.display());
        }
        Ok(added)
    }

    /// Indexes every file below `dir`, continuing past failures.
    ///
    /// Returns one `(path, added)` pair per file found. Text is prepared in
    /// parallel and the index is flushed once at the end.
    pub fn add_documents_in(
        &self,
        dir: impl AsRef<Path>,
        note: Option<&str>,
    ) -> Result<Vec<(PathBuf, bool)>> {
        let dir = dir.as_ref();
        if fs::symlink_metadata(dir).is_err() {
            return Err(SearchIndexError::NotFound(dir.to_path_buf()));
        }

        let files = collect_files(dir);
        if !self.mode.is_writable() {
            return Ok(files.into_iter().map(|file| (file, false)).collect());
        }

        let prepared: Vec<(PathBuf, Result<Option<String>>)> = {
            let guard = self.store.read();
            let store = guard.as_ref().ok_or_else(|| self.closed_error())?;
            let kind = self.kind;
            let options = self.options;
            files
                .into_par_iter()
                .map(|file| {
                    let text = prepare_text(store, kind, options, &file, note);
                    (file, text)
                })
                .collect()
        };

        let mut guard = self.store.write();
        let store = guard.as_mut().ok_or_else(|| self.closed_error())?;
        let mut outcomes = Vec::with_capacity(prepared.len());
        let mut changed = false;
        for (file, text) in prepared {
            let added = match text {
                Ok(None) => true,
                Ok(Some(text)) => match store.add_with_text(&file, &text) {
                    Ok(added) => {
                        changed |= added;
                        added
                    }
                    Err(error) => {
                        log::warn!("failed to index {}: {error}", file.display());
                        false
                    }
                },
                Err(error) => {
                    log::warn!("failed to read {}: {error}", file.display());
                    false
                }
            };
            outcomes.push((file, added));
        }
        if changed {
            store.flush()?;
        }
        log::debug!(
            "indexed directory {} ({} files)",
            dir.display(),
            outcomes.len()
        );
        Ok(outcomes)
    }

    /// Removes a document by path and compacts the store.
    ///
    /// Returns false when the document was not indexed or the handle cannot
    /// write.
    pub fn remove_document(&self, path: impl AsRef<Path>) -> bool {
        if !self.mode.is_writable() {
            return false;
        }
        let document = canonicalize_maybe_missing(path.as_ref().to_path_buf());

        let mut guard = self.store.write();
        let Some(store) = guard.as_mut() else {
            return false;
        };
        match store.remove(&document) {
            Ok(true) => {
                if let Err(error) = store.compact() {
                    log::warn!("failed to compact {}: {error}", self.path.display());
                }
                log::debug!("removed {}", document.display());
                true
            }
            Ok(false) => false,
            Err(error) => {
                log::warn!("failed to remove {}: {error}", document.display());
                false
            }
        }
    }

    /// Removes every document at or below `dir` and compacts once.
    ///
    /// Used when a directory leaves the watched tree; returns the removed
    /// paths, which is empty for read-only handles.
    pub fn remove_documents_under(&self, dir: impl AsRef<Path>) -> Vec<PathBuf> {
        self.remove_under(dir.as_ref(), |_| true)
    }

    /// Removes documents at or below `dir` whose files no longer exist.
    pub fn prune_missing_under(&self, dir: impl AsRef<Path>) -> Vec<PathBuf> {
        self.remove_under(dir.as_ref(), |document| {
            fs::symlink_metadata(document).is_err()
        })
    }

    fn remove_under(&self, dir: &Path, stale: impl Fn(&Path) -> bool) -> Vec<PathBuf> {
        if !self.mode.is_writable() {
            return Vec::new();
        }
        let dir = canonicalize_maybe_missing(dir.to_path_buf());

        let mut guard = self.store.write();
        let Some(store) = guard.as_mut() else {
            return Vec::new();
        };
        let mut removed = Vec::new();
        for document in store.paths_under(&dir) {
            if !stale(&document) {
                continue;
            }
            match store.remove(&document) {
                Ok(true) => removed.push(document),
                Ok(false) => {}
                Err(error) => log::warn!("failed to remove {}: {error}", document.display()),
            }
        }
        if !removed.is_empty() {
            if let Err(error) = store.compact() {
                log::warn!("failed to compact {}: {error}", self.path.display());
            }
            log::debug!("removed {} documents under {}", removed.len(), dir.display());
        }
        removed
    }

    /// Flushes and releases the store and the writer registration.
    ///
    /// Calling it again is a no-op.
    pub fn close(&self) -> Result<()> {
        let Some(mut store) = self.store.write().take() else {
            return Ok(());
        };
        let result = store.close();
        drop(store);
        self.lease.lock().take();
        log::info!("closed index {}", self.path.display());
        result
    }
}

impl<S: IndexStore> Drop for Index<S> {
    fn drop(&mut self) {
        if let Err(error) = self.close() {
            log::warn!("failed to close index {}: {error}", self.path.display());
        }
    }
}

/// Text to index for `file`, or `None` when the file is hidden.
fn prepare_text<S: IndexStore>(
    store: &S,
    kind: IndexKind,
    options: IndexOptions,
    file: &Path,
    note: Option<&str>,
) -> Result<Option<String>> {
    if is_hidden_leaf(file) {
        return Ok(None);
    }
    let text = match kind {
        IndexKind::NameIndexed => name_text(file, options.strip_extension, note),
        IndexKind::ContentIndexed => store.extract_text(file)?,
    };
    Ok(Some(text))
}

/// Every regular file below `dir`, canonicalized, in walk order.
fn collect_files(dir: &Path) -> Vec<PathBuf> {
    let root = canonicalize_existing_path(dir.to_path_buf());
    let mut files = Vec::new();
    for entry in WalkBuilder::new(&root).standard_filters(false).build() {
        match entry {
            Ok(entry) => {
                if entry.file_type().is_some_and(|kind| kind.is_file()) {
                    files.push(entry.into_path());
                }
            }
            Err(error) => log::warn!("walk error under {}: {error}", root.display()),
        }
    }
    files
}
