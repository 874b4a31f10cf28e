use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{Result, SearchIndexError};
use crate::index::{IndexKind, IndexOptions};
use crate::query::{MatchMode, SearchRequest, DEFAULT_SEARCH_LIMIT, DEFAULT_TIME_LIMIT};
use crate::watcher::{FileCursorStore, FilterPolicy};

pub const SEARCH_INDEX_CONFIG_FILENAME: &str = "search-index.json";
pub const SEARCH_INDEX_CONFIG_VERSION: &str = "1.0.0";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchIndexConfig {
    pub version: String,
    pub watcher: WatcherConfig,
    pub index: IndexConfig,
    pub search: SearchDefaults,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WatcherConfig {
    pub roots: Vec<PathBuf>,
    pub latency_ms: u64,
    /// Relative paths are resolved against the config directory.
    pub cursor_dir: PathBuf,
    pub filter: FilterConfig,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilterConfig {
    pub skip_hidden_leaf: bool,
    pub skip_package_descendants: bool,
    pub skip_hidden_descendants: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexConfig {
    /// Relative paths are resolved against the config directory.
    pub path: PathBuf,
    pub kind: IndexKind,
    pub strip_extension: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchDefaults {
    pub limit: usize,
    pub time_limit_ms: u64,
    pub mode: MatchMode,
}

impl SearchIndexConfig {
    pub fn default_new() -> Self {
        Self {
            version: SEARCH_INDEX_CONFIG_VERSION.to_string(),
            watcher: WatcherConfig {
                roots: Vec::new(),
                latency_ms: 50,
                cursor_dir: PathBuf::from("cursors"),
                filter: FilterConfig {
                    skip_hidden_leaf: true,
                    skip_package_descendants: true,
                    skip_hidden_descendants: true,
                },
            },
            index: IndexConfig {
                path: PathBuf::from("names.idx"),
                kind: IndexKind::NameIndexed,
                strip_extension: false,
            },
            search: SearchDefaults {
                limit: DEFAULT_SEARCH_LIMIT,
                time_limit_ms: DEFAULT_TIME_LIMIT.as_millis() as u64,
                mode: MatchMode::default(),
            },
        }
    }

    /// Makes relative cursor and index paths absolute under `dir`.
    pub fn resolve_paths(mut self, dir: &Path) -> Self {
        if self.watcher.cursor_dir.is_relative() {
            self.watcher.cursor_dir = dir.join(&self.watcher.cursor_dir);
        }
        if self.index.path.is_relative() {
            self.index.path = dir.join(&self.index.path);
        }
        self
    }
}

impl WatcherConfig {
    pub fn latency(&self) -> Duration {
        Duration::from_millis(self.latency_ms)
    }

    pub fn policy(&self) -> FilterPolicy {
        self.filter.into()
    }

    /// The cursor store for this root set.
    pub fn cursor_store(&self) -> FileCursorStore {
        FileCursorStore::new(&self.cursor_dir, &self.roots)
    }
}

impl From<FilterConfig> for FilterPolicy {
    fn from(config: FilterConfig) -> Self {
        let mut policy = FilterPolicy::empty();
        policy.set(FilterPolicy::SKIP_HIDDEN_LEAF, config.skip_hidden_leaf);
        policy.set(
            FilterPolicy::SKIP_PACKAGE_DESCENDANTS,
            config.skip_package_descendants,
        );
        policy.set(
            FilterPolicy::SKIP_HIDDEN_DESCENDANTS,
            config.skip_hidden_descendants,
        );
        policy
    }
}

impl IndexConfig {
    pub fn options(&self) -> IndexOptions {
        IndexOptions {
            strip_extension: self.strip_extension,
        }
    }
}

impl SearchDefaults {
    /// A request for `query` carrying these defaults.
    pub fn request(&self, query: impl Into<String>) -> SearchRequest {
        SearchRequest::new(query)
            .with_limit(self.limit)
            .with_mode(self.mode)
            .with_time_limit(Duration::from_millis(self.time_limit_ms))
    }
}

/// Loads the config in `dir`, writing a default one first if there is none.
/// Relative paths in the result are resolved against `dir`.
pub fn load_or_create_config(dir: &Path) -> Result<SearchIndexConfig> {
    std::fs::create_dir_all(dir).map_err(|error| {
        SearchIndexError::Config(format!(
            "failed to create config directory {}: {error}",
            dir.display()
        ))
    })?;

    let path = config_path(dir);
    if !path.exists() {
        let config = SearchIndexConfig::default_new();
        write_config(&path, &config)?;
        return Ok(config.resolve_paths(dir));
    }

    let data = std::fs::read_to_string(&path).map_err(|error| {
        SearchIndexError::Config(format!(
            "failed to read config {}: {error}",
            path.display()
        ))
    })?;
    let config: SearchIndexConfig = serde_json::from_str(&data).map_err(|error| {
        SearchIndexError::Config(format!(
            "failed to parse config {}: {error}",
            path.display()
        ))
    })?;

    if config.version != SEARCH_INDEX_CONFIG_VERSION {
        return Err(SearchIndexError::Config(format!(
            "unsupported config version {} in {}",
            config.version,
            path.display()
        )));
    }

    Ok(config.resolve_paths(dir))
}

pub fn config_path(dir: &Path) -> PathBuf {
    dir.join(SEARCH_INDEX_CONFIG_FILENAME)
}

pub fn write_config(path: &Path, config: &SearchIndexConfig) -> Result<()> {
    let data = serde_json::to_string_pretty(config).map_err(|error| {
        SearchIndexError::Serialization(format!(
            "failed to serialize config {}: {error}",
            path.display()
        ))
    })?;
    std::fs::write(path, data).map_err(|error| {
        SearchIndexError::Config(format!(
            "failed to write config {}: {error}",
            path.display()
        ))
    })?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn creates_config_when_missing() {
        let dir = tempdir().expect("tempdir");
        let config = load_or_create_config(dir.path()).expect("load/create");

        assert!(config_path(dir.path()).exists());
        assert_eq!(config.version, SEARCH_INDEX_CONFIG_VERSION);
        assert_eq!(config.index.path, dir.path().join("names.idx"));
        assert_eq!(config.watcher.cursor_dir, dir.path().join("cursors"));
        assert_eq!(config.watcher.policy(), FilterPolicy::all());
    }

    #[test]
    fn loads_existing_config() {
        let dir = tempdir().expect("tempdir");
        let mut original = SearchIndexConfig::default_new();
        original.watcher.roots = vec![PathBuf::from("/w")];
        original.index.path = PathBuf::from("/var/index/content.idx");
        original.index.kind = IndexKind::ContentIndexed;
        original.search.mode = MatchMode::Exact;
        write_config(&config_path(dir.path()), &original).expect("write config");

        let loaded = load_or_create_config(dir.path()).expect("load config");
        assert_eq!(loaded.watcher.roots, vec![PathBuf::from("/w")]);
        assert_eq!(loaded.index.path, PathBuf::from("/var/index/content.idx"));
        assert_eq!(loaded.index.kind, IndexKind::ContentIndexed);
        assert_eq!(loaded.search.request("q").mode, MatchMode::Exact);
    }

    #[test]
    fn version_mismatch_is_rejected() {
        let dir = tempdir().expect("tempdir");
        let mut original = SearchIndexConfig::default_new();
        original.version = "0.9.0".to_string();
        write_config(&config_path(dir.path()), &original).expect("write config");

        let err = load_or_create_config(dir.path()).expect_err("expected error");
        match err {
            SearchIndexError::Config(message) => assert!(message.contains("0.9.0")),
            other => panic!("expected Config, got {other:?}"),
        }
    }

    #[test]
    fn filter_config_maps_to_policy_bits() {
        let config = FilterConfig {
            skip_hidden_leaf: true,
            skip_package_descendants: false,
            skip_hidden_descendants: true,
        };
        let policy: FilterPolicy = config.into();
        assert_eq!(
            policy,
            FilterPolicy::SKIP_HIDDEN_LEAF | FilterPolicy::SKIP_HIDDEN_DESCENDANTS
        );
        assert_eq!(FilterPolicy::from(FilterConfig::default()), FilterPolicy::empty());
    }

    #[test]
    fn search_defaults_build_requests() {
        let defaults = SearchDefaults {
            limit: 7,
            time_limit_ms: 250,
            mode: MatchMode::LeadingFuzzy,
        };
        let request = defaults.request("port");
        assert_eq!(request.limit, 7);
        assert_eq!(request.time_limit, Duration::from_millis(250));
        assert_eq!(request.mode, MatchMode::LeadingFuzzy);
        assert_eq!(request.query, "port");
    }

    #[test]
    fn kinds_serialize_as_snake_case() {
        let json = serde_json::to_string(&SearchIndexConfig::default_new()).expect("encode");
        assert!(json.contains("\"name_indexed\""));
        assert!(json.contains("\"trailing_fuzzy\""));
    }
}
