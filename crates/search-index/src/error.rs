use std::ffi::OsStr;
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug, thiserror::Error)]
pub enum SearchIndexError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Path not found: {0}")]
    NotFound(PathBuf),

    #[error("Index already exists or is incompatible: {0}")]
    CreateConflict(PathBuf),

    #[error("Index is already open for writing: {0}")]
    OpenConflict(PathBuf),

    #[error("Cursor unavailable: {0}")]
    CursorUnavailable(String),

    #[error("Malformed notification: {0}")]
    MalformedNotification(String),

    #[error("Watch error: {0}")]
    Watch(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Config error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, SearchIndexError>;

/// Canonicalizes a path, returning the original if canonicalization fails.
pub fn canonicalize_existing_path(path: PathBuf) -> PathBuf {
    fs::canonicalize(&path).unwrap_or(path)
}

/// Canonicalizes a path whose trailing components may not exist yet.
///
/// The nearest existing ancestor is resolved and the missing components are
/// appended to it, so a not-yet-created file compares equal to its later
/// canonical form however it was reached.
pub fn canonicalize_maybe_missing(path: PathBuf) -> PathBuf {
    if let Ok(resolved) = fs::canonicalize(&path) {
        return resolved;
    }
    let mut missing: Vec<&OsStr> = Vec::new();
    let mut ancestor = path.as_path();
    loop {
        let (Some(parent), Some(name)) = (ancestor.parent(), ancestor.file_name()) else {
            return path;
        };
        missing.push(name);
        ancestor = if parent.as_os_str().is_empty() {
            Path::new(".")
        } else {
            parent
        };
        if let Ok(mut resolved) = fs::canonicalize(ancestor) {
            resolved.extend(missing.iter().rev().copied());
            return resolved;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn missing_tail_is_kept_below_resolved_ancestor() {
        let temp = TempDir::new().expect("tempdir");
        let root = temp.path().canonicalize().expect("canonical tempdir");
        let nested = temp.path().join("b").join("c").join("x.idx");
        assert_eq!(
            canonicalize_maybe_missing(nested),
            root.join("b").join("c").join("x.idx")
        );
    }

    #[test]
    fn existing_path_is_fully_resolved() {
        let temp = TempDir::new().expect("tempdir");
        let root = temp.path().canonicalize().expect("canonical tempdir");
        fs::create_dir(root.join("d")).expect("mkdir");
        let detour = temp.path().join("d").join("..").join("d");
        assert_eq!(canonicalize_maybe_missing(detour), root.join("d"));
    }

    #[cfg(unix)]
    #[test]
    fn symlinked_ancestor_resolves_under_missing_tail() {
        let temp = TempDir::new().expect("tempdir");
        let root = temp.path().canonicalize().expect("canonical tempdir");
        fs::create_dir(root.join("real")).expect("mkdir");
        std::os::unix::fs::symlink(root.join("real"), root.join("link")).expect("symlink");

        let through_link = root.join("link").join("sub").join("n.idx");
        assert_eq!(
            canonicalize_maybe_missing(through_link),
            root.join("real").join("sub").join("n.idx")
        );
    }
}
