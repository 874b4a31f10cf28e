//! Bundled inverted-index engine.
//!
//! Documents live in memory as per-document term frequencies plus a postings
//! map from term to documents. `flush` writes the whole document table to
//! the index file; opening rebuilds the postings from it.

use std::collections::{BTreeMap, BTreeSet};
use std::fs::File;
use std::io::Read;
use std::ops::Bound;
use std::path::{Path, PathBuf};
use std::time::Instant;

use fnv::FnvHashMap;

use super::engine::{
    DocumentId, EngineMatches, EngineQuery, IndexEngine, IndexKind, IndexStore, OpenMode,
};
use super::persistence::{
    read_snapshot, unix_now_secs, write_snapshot, DocumentEntry, SnapshotRef, INDEX_FILE_VERSION,
};
use super::terms::{parse_query, tokenize, TermMatch, TermPattern};
use crate::error::{Result, SearchIndexError};
use crate::query::SearchOptions;

/// Content beyond this many bytes is not indexed.
pub const MAX_CONTENT_BYTES: u64 = 4 * 1024 * 1024;

/// A NUL byte in this many leading bytes marks a file as binary.
const BINARY_PROBE_BYTES: usize = 8 * 1024;

/// How many candidates are scored between deadline checks.
const DEADLINE_CHECK_INTERVAL: usize = 256;

/// Engine storing each index as one compressed snapshot file.
#[derive(Debug, Default, Clone, Copy)]
pub struct DiskIndexEngine;

impl DiskIndexEngine {
    pub fn new() -> Self {
        Self
    }
}

impl IndexEngine for DiskIndexEngine {
    type Store = DiskIndexStore;

    fn create(&self, path: &Path, kind: IndexKind) -> Result<DiskIndexStore> {
        if path.symlink_metadata().is_ok() {
            return Err(SearchIndexError::CreateConflict(path.to_path_buf()));
        }
        let mut store = DiskIndexStore::empty(path.to_path_buf(), kind, OpenMode::WriteAndRead);
        store.dirty = true;
        store.flush()?;
        Ok(store)
    }

    fn open(&self, path: &Path, mode: OpenMode) -> Result<DiskIndexStore> {
        let snapshot = read_snapshot(path)?;
        let mut store = DiskIndexStore::empty(path.to_path_buf(), snapshot.kind, mode);
        store.next_id = snapshot.next_id;
        for (id, entry) in snapshot.documents {
            store.insert_entry(id, entry);
        }
        Ok(store)
    }
}

/// An open index file.
pub struct DiskIndexStore {
    path: PathBuf,
    kind: IndexKind,
    mode: OpenMode,
    next_id: DocumentId,
    documents: BTreeMap<DocumentId, DocumentEntry>,
    by_path: FnvHashMap<PathBuf, DocumentId>,
    postings: BTreeMap<Box<str>, BTreeMap<DocumentId, u32>>,
    dirty: bool,
    closed: bool,
}

impl std::fmt::Debug for DiskIndexStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DiskIndexStore")
            .field("path", &self.path)
            .field("kind", &self.kind)
            .field("mode", &self.mode)
            .field("documents", &self.documents.len())
            .field("terms", &self.postings.len())
            .finish()
    }
}

impl DiskIndexStore {
    fn empty(path: PathBuf, kind: IndexKind, mode: OpenMode) -> Self {
        Self {
            path,
            kind,
            mode,
            next_id: 1,
            documents: BTreeMap::new(),
            by_path: FnvHashMap::default(),
            postings: BTreeMap::new(),
            dirty: false,
            closed: false,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn mode(&self) -> OpenMode {
        self.mode
    }

    fn ensure_writable(&self) -> Result<bool> {
        if self.closed {
            return Err(SearchIndexError::Internal(format!(
                "index {} is closed",
                self.path.display()
            )));
        }
        Ok(self.mode.is_writable())
    }

    fn insert_entry(&mut self, id: DocumentId, entry: DocumentEntry) {
        for (term, frequency) in &entry.terms {
            self.postings
                .entry(term.clone())
                .or_default()
                .insert(id, *frequency);
        }
        self.by_path.insert(entry.path.clone(), id);
        self.documents.insert(id, entry);
    }

    fn remove_entry(&mut self, id: DocumentId) -> Option<DocumentEntry> {
        let entry = self.documents.remove(&id)?;
        for (term, _) in &entry.terms {
            if let Some(documents) = self.postings.get_mut(term) {
                documents.remove(&id);
            }
        }
        self.by_path.remove(&entry.path);
        Some(entry)
    }

    /// Collects term frequencies for every document matching `pattern`,
    /// weighted by each term's idf.
    fn score_pattern(
        &self,
        pattern: &TermPattern,
        total: f32,
        deadline: Option<Instant>,
    ) -> Option<BTreeMap<DocumentId, f32>> {
        let mut scores: BTreeMap<DocumentId, f32> = BTreeMap::new();
        let mut add_term = |documents: &BTreeMap<DocumentId, u32>| {
            if documents.is_empty() {
                return;
            }
            let idf = (1.0 + total / documents.len() as f32).ln();
            for (id, frequency) in documents {
                *scores.entry(*id).or_default() += *frequency as f32 * idf;
            }
        };

        match pattern.matching {
            TermMatch::Exact => {
                if let Some(documents) = self.postings.get(pattern.text.as_str()) {
                    add_term(documents);
                }
            }
            TermMatch::Prefix => {
                let start: &str = &pattern.text;
                let range = (Bound::Included(start), Bound::Unbounded);
                for (term, documents) in self.postings.range::<str, _>(range) {
                    if !term.starts_with(start) {
                        break;
                    }
                    add_term(documents);
                }
            }
            TermMatch::Suffix | TermMatch::Substring => {
                for (visited, (term, documents)) in self.postings.iter().enumerate() {
                    if visited % DEADLINE_CHECK_INTERVAL == 0 && past(deadline) {
                        return None;
                    }
                    if pattern.matches(term) {
                        add_term(documents);
                    }
                }
            }
        }
        Some(scores)
    }
}

fn past(deadline: Option<Instant>) -> bool {
    deadline.is_some_and(|deadline| Instant::now() >= deadline)
}

/// Counts terms in `text`, sorted by term.
fn term_frequencies(text: &str) -> Vec<(Box<str>, u32)> {
    let mut counts: BTreeMap<String, u32> = BTreeMap::new();
    for term in tokenize(text) {
        *counts.entry(term).or_default() += 1;
    }
    counts
        .into_iter()
        .map(|(term, count)| (term.into_boxed_str(), count))
        .collect()
}

/// Reads indexable text from a file. Binary files and directories yield no
/// text; oversized files are truncated.
pub fn extract_content(path: &Path) -> Result<String> {
    let metadata = path
        .metadata()
        .map_err(|_| SearchIndexError::NotFound(path.to_path_buf()))?;
    if !metadata.is_file() {
        return Ok(String::new());
    }

    let mut bytes = Vec::new();
    File::open(path)?
        .take(MAX_CONTENT_BYTES)
        .read_to_end(&mut bytes)?;

    let probe = &bytes[..bytes.len().min(BINARY_PROBE_BYTES)];
    if memchr::memchr(0, probe).is_some() {
        log::debug!("skipping binary content of {}", path.display());
        return Ok(String::new());
    }
    Ok(String::from_utf8_lossy(&bytes).into_owned())
}

impl IndexStore for DiskIndexStore {
    fn kind(&self) -> IndexKind {
        self.kind
    }

    fn add_with_text(&mut self, document: &Path, text: &str) -> Result<bool> {
        if !self.ensure_writable()? {
            return Ok(false);
        }
        let id = match self.by_path.get(document).copied() {
            Some(existing) => {
                self.remove_entry(existing);
                existing
            }
            None => {
                let id = self.next_id;
                self.next_id += 1;
                id
            }
        };
        self.insert_entry(
            id,
            DocumentEntry {
                path: document.to_path_buf(),
                terms: term_frequencies(text),
            },
        );
        self.dirty = true;
        Ok(true)
    }

    fn extract_text(&self, document: &Path) -> Result<String> {
        extract_content(document)
    }

    fn remove(&mut self, document: &Path) -> Result<bool> {
        if !self.ensure_writable()? {
            return Ok(false);
        }
        let Some(id) = self.by_path.get(document).copied() else {
            return Ok(false);
        };
        self.remove_entry(id);
        self.dirty = true;
        Ok(true)
    }

    fn compact(&mut self) -> Result<()> {
        if !self.ensure_writable()? {
            return Ok(());
        }
        let before = self.postings.len();
        self.postings.retain(|_, documents| !documents.is_empty());
        self.by_path.shrink_to_fit();
        log::debug!(
            "compacted index {} ({} empty terms dropped)",
            self.path.display(),
            before - self.postings.len()
        );
        self.flush()
    }

    fn flush(&mut self) -> Result<()> {
        if !self.ensure_writable()? || !self.dirty {
            return Ok(());
        }
        write_snapshot(
            &self.path,
            &SnapshotRef {
                version: INDEX_FILE_VERSION,
                kind: self.kind,
                next_id: self.next_id,
                documents: &self.documents,
                saved_at: unix_now_secs(),
            },
        )?;
        self.dirty = false;
        Ok(())
    }

    fn search(&self, query: &EngineQuery<'_>) -> Result<EngineMatches> {
        let mut matches = EngineMatches::default();
        if self.closed || query.limit == 0 {
            return Ok(matches);
        }
        let patterns = parse_query(query.text);
        if patterns.is_empty() {
            return Ok(matches);
        }

        let total = self.documents.len() as f32;
        let mut per_pattern = Vec::with_capacity(patterns.len());
        for pattern in &patterns {
            match self.score_pattern(pattern, total, query.deadline) {
                Some(scores) => per_pattern.push(scores),
                None => return Ok(matches),
            }
        }

        let any_term = query
            .options
            .intersects(SearchOptions::SPACE_MEANS_OR | SearchOptions::FIND_SIMILAR);
        let candidates: BTreeSet<DocumentId> = if any_term {
            per_pattern.iter().flat_map(|scores| scores.keys().copied()).collect()
        } else {
            let Some((first, rest)) = per_pattern.split_first() else {
                return Ok(matches);
            };
            first
                .keys()
                .copied()
                .filter(|id| rest.iter().all(|scores| scores.contains_key(id)))
                .collect()
        };

        let mut scored: Vec<(DocumentId, f32)> = Vec::with_capacity(candidates.len());
        for (visited, id) in candidates.into_iter().enumerate() {
            if visited % DEADLINE_CHECK_INTERVAL == 0 && past(query.deadline) {
                log::debug!("search deadline reached after {} candidates", scored.len());
                break;
            }
            let mut score = 0.0f32;
            let mut matched = 0usize;
            for scores in &per_pattern {
                if let Some(value) = scores.get(&id) {
                    score += value;
                    matched += 1;
                }
            }
            if query.options.contains(SearchOptions::FIND_SIMILAR) {
                score *= matched as f32 / per_pattern.len() as f32;
            }
            if query.options.contains(SearchOptions::NO_RELEVANCE_SCORE) {
                score = 0.0;
            }
            scored.push((id, score));
        }

        // Best `limit` by score; equal scores keep id order.
        let by_rank = |a: &(DocumentId, f32), b: &(DocumentId, f32)| {
            b.1.total_cmp(&a.1).then(a.0.cmp(&b.0))
        };
        if scored.len() > query.limit {
            scored.select_nth_unstable_by(query.limit - 1, by_rank);
            scored.truncate(query.limit);
        }
        scored.sort_unstable_by(by_rank);

        for (id, score) in scored {
            matches.push(id, score);
        }
        Ok(matches)
    }

    fn resolve_paths(&self, ids: &[DocumentId]) -> Vec<Option<PathBuf>> {
        ids.iter()
            .map(|id| self.documents.get(id).map(|entry| entry.path.clone()))
            .collect()
    }

    fn document_count(&self) -> usize {
        self.documents.len()
    }

    fn paths_under(&self, dir: &Path) -> Vec<PathBuf> {
        self.by_path
            .keys()
            .filter(|path| path.starts_with(dir))
            .cloned()
            .collect()
    }

    fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        let flushed = self.flush();
        self.closed = true;
        flushed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn query(text: &str, options: SearchOptions) -> EngineQuery<'_> {
        EngineQuery {
            text,
            options,
            limit: 100,
            deadline: None,
        }
    }

    fn paths(store: &DiskIndexStore, matches: &EngineMatches) -> Vec<PathBuf> {
        store
            .resolve_paths(&matches.ids)
            .into_iter()
            .flatten()
            .collect()
    }

    fn name_store(temp: &TempDir) -> DiskIndexStore {
        DiskIndexEngine
            .create(&temp.path().join("names.idx"), IndexKind::NameIndexed)
            .expect("create")
    }

    #[test]
    fn create_refuses_existing_path() {
        let temp = TempDir::new().expect("tempdir");
        let path = temp.path().join("names.idx");
        fs::write(&path, b"x").expect("write");
        assert!(matches!(
            DiskIndexEngine.create(&path, IndexKind::NameIndexed),
            Err(SearchIndexError::CreateConflict(_))
        ));
    }

    #[test]
    fn exact_and_prefix_terms() {
        let temp = TempDir::new().expect("tempdir");
        let mut store = name_store(&temp);
        store
            .add_with_text(Path::new("/w/report.txt"), "report.txt")
            .expect("add");

        let exact = store.search(&query("report", SearchOptions::empty())).expect("search");
        assert!(exact.is_empty());
        let prefix = store.search(&query("report*", SearchOptions::empty())).expect("search");
        assert_eq!(paths(&store, &prefix), vec![PathBuf::from("/w/report.txt")]);
        let suffix = store.search(&query("*.txt", SearchOptions::empty())).expect("search");
        assert_eq!(suffix.len(), 1);
    }

    #[test]
    fn terms_are_anded_unless_or_requested() {
        let temp = TempDir::new().expect("tempdir");
        let mut store = name_store(&temp);
        store.add_with_text(Path::new("/w/a"), "alpha beta").expect("add");
        store.add_with_text(Path::new("/w/b"), "alpha").expect("add");

        let both = store.search(&query("alpha beta", SearchOptions::empty())).expect("search");
        assert_eq!(paths(&store, &both), vec![PathBuf::from("/w/a")]);

        let either = store
            .search(&query("alpha beta", SearchOptions::SPACE_MEANS_OR))
            .expect("search");
        assert_eq!(either.len(), 2);
    }

    #[test]
    fn find_similar_favours_fuller_matches() {
        let temp = TempDir::new().expect("tempdir");
        let mut store = name_store(&temp);
        store.add_with_text(Path::new("/w/a"), "alpha beta").expect("add");
        store.add_with_text(Path::new("/w/b"), "alpha").expect("add");
        store.add_with_text(Path::new("/w/c"), "gamma").expect("add");

        let similar = store
            .search(&query("alpha beta", SearchOptions::FIND_SIMILAR))
            .expect("search");
        assert_eq!(similar.len(), 2);
        assert!(similar.scores[0] > similar.scores[1]);
    }

    #[test]
    fn no_relevance_score_zeroes_scores() {
        let temp = TempDir::new().expect("tempdir");
        let mut store = name_store(&temp);
        store.add_with_text(Path::new("/w/a"), "alpha").expect("add");
        let matches = store
            .search(&query("alpha", SearchOptions::NO_RELEVANCE_SCORE))
            .expect("search");
        assert_eq!(matches.scores, vec![0.0]);
    }

    #[test]
    fn re_adding_replaces_terms() {
        let temp = TempDir::new().expect("tempdir");
        let mut store = name_store(&temp);
        store.add_with_text(Path::new("/w/a"), "old").expect("add");
        store.add_with_text(Path::new("/w/a"), "new").expect("add");

        assert_eq!(store.document_count(), 1);
        assert!(store.search(&query("old", SearchOptions::empty())).expect("search").is_empty());
        assert_eq!(store.search(&query("new", SearchOptions::empty())).expect("search").len(), 1);
    }

    #[test]
    fn limit_keeps_the_best_scores() {
        let temp = TempDir::new().expect("tempdir");
        let mut store = name_store(&temp);
        store
            .add_with_text(Path::new("/w/alpha one.txt"), "alpha one.txt")
            .expect("add");
        store
            .add_with_text(Path::new("/w/alpha alpha two.txt"), "alpha alpha two.txt")
            .expect("add");

        let mut best = query("alpha", SearchOptions::empty());
        best.limit = 1;
        let matches = store.search(&best).expect("search");
        assert_eq!(
            paths(&store, &matches),
            vec![PathBuf::from("/w/alpha alpha two.txt")]
        );

        let all = store.search(&query("alpha", SearchOptions::empty())).expect("search");
        assert_eq!(all.len(), 2);
        assert!(all.scores[0] > all.scores[1]);
    }

    #[test]
    fn limit_breaks_score_ties_by_id() {
        let temp = TempDir::new().expect("tempdir");
        let mut store = name_store(&temp);
        for name in ["one", "two", "three"] {
            store
                .add_with_text(&Path::new("/w").join(name), "shared")
                .expect("add");
        }
        let mut limited = query("shared", SearchOptions::empty());
        limited.limit = 2;
        let matches = store.search(&limited).expect("search");
        assert_eq!(
            paths(&store, &matches),
            vec![PathBuf::from("/w/one"), PathBuf::from("/w/two")]
        );
    }

    #[test]
    fn expired_deadline_returns_empty() {
        let temp = TempDir::new().expect("tempdir");
        let mut store = name_store(&temp);
        store.add_with_text(Path::new("/w/a"), "alpha").expect("add");
        let mut late = query("alpha", SearchOptions::empty());
        late.deadline = Some(Instant::now());
        assert!(store.search(&late).expect("search").is_empty());
    }

    #[test]
    fn flush_and_reopen_preserves_documents() {
        let temp = TempDir::new().expect("tempdir");
        let path = temp.path().join("names.idx");
        {
            let mut store = DiskIndexEngine
                .create(&path, IndexKind::NameIndexed)
                .expect("create");
            store.add_with_text(Path::new("/w/a"), "alpha").expect("add");
            store.add_with_text(Path::new("/w/b"), "beta").expect("add");
            store.remove(Path::new("/w/a")).expect("remove");
            store.compact().expect("compact");
            store.close().expect("close");
        }

        let reopened = DiskIndexEngine.open(&path, OpenMode::ReadOnly).expect("open");
        assert_eq!(reopened.document_count(), 1);
        let matches = reopened.search(&query("beta", SearchOptions::empty())).expect("search");
        assert_eq!(paths(&reopened, &matches), vec![PathBuf::from("/w/b")]);
        assert!(reopened
            .search(&query("alpha", SearchOptions::empty()))
            .expect("search")
            .is_empty());
    }

    #[test]
    fn read_only_store_ignores_writes() {
        let temp = TempDir::new().expect("tempdir");
        let path = temp.path().join("names.idx");
        DiskIndexEngine
            .create(&path, IndexKind::NameIndexed)
            .expect("create")
            .close()
            .expect("close");

        let mut store = DiskIndexEngine.open(&path, OpenMode::ReadOnly).expect("open");
        assert!(!store.add_with_text(Path::new("/w/a"), "alpha").expect("add"));
        assert!(!store.remove(Path::new("/w/a")).expect("remove"));
        assert_eq!(store.document_count(), 0);
    }

    #[test]
    fn resolve_reports_removed_ids_as_none() {
        let temp = TempDir::new().expect("tempdir");
        let mut store = name_store(&temp);
        store.add_with_text(Path::new("/w/a"), "alpha").expect("add");
        let matches = store.search(&query("alpha", SearchOptions::empty())).expect("search");
        store.remove(Path::new("/w/a")).expect("remove");
        assert_eq!(store.resolve_paths(&matches.ids), vec![None]);
    }

    #[test]
    fn content_extraction_skips_binary_files() {
        let temp = TempDir::new().expect("tempdir");
        let text = temp.path().join("notes.md");
        let binary = temp.path().join("blob.bin");
        fs::write(&text, "Quarterly numbers look good").expect("write");
        fs::write(&binary, [0x7f, b'E', b'L', b'F', 0, 1, 2]).expect("write");

        assert_eq!(extract_content(&text).expect("text"), "Quarterly numbers look good");
        assert_eq!(extract_content(&binary).expect("binary"), "");
        assert!(matches!(
            extract_content(&temp.path().join("missing")),
            Err(SearchIndexError::NotFound(_))
        ));
    }
}
