//! Ranked search over an [`Index`].

use std::path::PathBuf;
use std::time::{Duration, Instant};

use super::options::{normalize_query, MatchMode, SearchOptions};
use crate::error::Result;
use crate::index::{EngineQuery, Index, IndexStore};

/// Default number of hits returned by a search.
pub const DEFAULT_SEARCH_LIMIT: usize = 100;

/// Default time budget for one search.
pub const DEFAULT_TIME_LIMIT: Duration = Duration::from_secs(1);

/// One search call.
#[derive(Debug, Clone, PartialEq)]
pub struct SearchRequest {
    pub query: String,
    pub limit: usize,
    pub mode: MatchMode,
    pub options: SearchOptions,
    pub time_limit: Duration,
}

impl SearchRequest {
    pub fn new(query: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            limit: DEFAULT_SEARCH_LIMIT,
            mode: MatchMode::default(),
            options: SearchOptions::empty(),
            time_limit: DEFAULT_TIME_LIMIT,
        }
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = limit;
        self
    }

    pub fn with_mode(mut self, mode: MatchMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_options(mut self, options: SearchOptions) -> Self {
        self.options = options;
        self
    }

    pub fn with_time_limit(mut self, time_limit: Duration) -> Self {
        self.time_limit = time_limit;
        self
    }
}

/// A ranked result.
#[derive(Debug, Clone, PartialEq)]
pub struct SearchHit {
    pub path: PathBuf,
    pub score: f32,
}

/// Normalizes queries, runs the engine search and ranks the results.
#[derive(Debug, Default, Clone, Copy)]
pub struct QueryPlanner;

impl QueryPlanner {
    /// Returns matching document paths, best first.
    pub fn search<S: IndexStore>(index: &Index<S>, request: &SearchRequest) -> Vec<PathBuf> {
        Self::search_scored(index, request)
            .into_iter()
            .map(|hit| hit.path)
            .collect()
    }

    /// Like [`search`](Self::search), keeping each hit's score.
    ///
    /// Hits are sorted by descending score; equal scores keep the engine's
    /// order. Ids the engine can no longer resolve are dropped. Failures and
    /// an exhausted time budget both yield whatever was found, possibly
    /// nothing.
    pub fn search_scored<S: IndexStore>(index: &Index<S>, request: &SearchRequest) -> Vec<SearchHit> {
        let text = normalize_query(&request.query, request.mode);
        if text.is_empty() || request.limit == 0 {
            return Vec::new();
        }
        let query = EngineQuery {
            text: &text,
            options: request.options,
            limit: request.limit,
            deadline: Instant::now().checked_add(request.time_limit),
        };

        let outcome = index.read_store(|store| -> Result<_> {
            let matches = store.search(&query)?;
            let paths = store.resolve_paths(&matches.ids);
            Ok((matches, paths))
        });
        let (matches, paths) = match outcome {
            Some(Ok(found)) => found,
            Some(Err(error)) => {
                log::warn!("search for {:?} failed: {error}", request.query);
                return Vec::new();
            }
            None => {
                log::debug!("search on closed index {}", index.path().display());
                return Vec::new();
            }
        };

        let mut hits: Vec<SearchHit> = paths
            .into_iter()
            .zip(matches.scores)
            .filter_map(|(path, score)| path.map(|path| SearchHit { path, score }))
            .collect();
        hits.sort_by(|a, b| b.score.total_cmp(&a.score));
        log::debug!(
            "search {:?} ({}) returned {} hits",
            text,
            request.mode.as_str(),
            hits.len()
        );
        hits
    }
}

impl<S: IndexStore> Index<S> {
    /// Shorthand for [`QueryPlanner::search`].
    pub fn search(&self, request: &SearchRequest) -> Vec<PathBuf> {
        QueryPlanner::search(self, request)
    }

    /// Shorthand for [`QueryPlanner::search_scored`].
    pub fn search_scored(&self, request: &SearchRequest) -> Vec<SearchHit> {
        QueryPlanner::search_scored(self, request)
    }
}
