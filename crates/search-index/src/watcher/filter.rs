//! Path suppression rules for change events.
//!
//! Every check only inspects metadata of path components, never the changed
//! item's future state: by the time a batch is processed the item may already
//! be gone, and a missing component simply counts as "not hidden" and "not a
//! package".

use std::ffi::OsStr;
use std::fs;
use std::path::{Component, Path, PathBuf};

use bitflags::bitflags;

bitflags! {
    /// Which classes of paths the watcher suppresses.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct FilterPolicy: u8 {
        /// Suppress items that are themselves hidden.
        const SKIP_HIDDEN_LEAF         = 0b001;
        /// Suppress items living inside a package (bundle) directory.
        const SKIP_PACKAGE_DESCENDANTS = 0b010;
        /// Suppress items living inside a hidden directory.
        const SKIP_HIDDEN_DESCENDANTS  = 0b100;
    }
}

/// Returns `false` if the policy asks to suppress `path`.
pub fn should_keep(path: &Path, policy: FilterPolicy) -> bool {
    if policy.is_empty() {
        return true;
    }
    if policy.contains(FilterPolicy::SKIP_HIDDEN_LEAF) && is_hidden_leaf(path) {
        return false;
    }

    let skip_packages = policy.contains(FilterPolicy::SKIP_PACKAGE_DESCENDANTS);
    let skip_hidden = policy.contains(FilterPolicy::SKIP_HIDDEN_DESCENDANTS);
    if !skip_packages && !skip_hidden {
        return true;
    }

    !has_matching_ancestor(path, |ancestor| {
        (skip_hidden && is_hidden_dir(ancestor)) || (skip_packages && is_package(ancestor))
    })
}

/// Returns true if the final component is hidden by name or attribute.
pub fn is_hidden_leaf(path: &Path) -> bool {
    has_hidden_name(path) || has_hidden_attribute(path)
}

/// Walks ancestors from the filesystem root down to the parent of `path`,
/// stopping at the first one matching `predicate`.
fn has_matching_ancestor<F>(path: &Path, mut predicate: F) -> bool
where
    F: FnMut(&Path) -> bool,
{
    let Some(parent) = path.parent() else {
        return false;
    };

    let mut ancestor = PathBuf::new();
    for component in parent.components() {
        ancestor.push(component);
        if matches!(component, Component::RootDir | Component::Prefix(_)) {
            continue;
        }
        if predicate(&ancestor) {
            return true;
        }
    }
    false
}

fn has_hidden_name(path: &Path) -> bool {
    path.file_name()
        .and_then(OsStr::to_str)
        .is_some_and(|name| name.starts_with('.') && name != "." && name != "..")
}

fn is_hidden_dir(path: &Path) -> bool {
    has_hidden_name(path) || has_hidden_attribute(path)
}

// ---------------------------------------------------------------------------
// Platform attributes
// ---------------------------------------------------------------------------

/// Finder info is 32 bytes; the Finder flags are a big-endian u16 at offset 8.
#[cfg(target_os = "macos")]
const FINDER_INFO_XATTR: &str = "com.apple.FinderInfo";
#[cfg(target_os = "macos")]
const FINDER_FLAG_IS_INVISIBLE: u16 = 0x4000;
#[cfg(target_os = "macos")]
const FINDER_FLAG_HAS_BUNDLE: u16 = 0x2000;

#[cfg(target_os = "macos")]
fn finder_flags(path: &Path) -> Option<u16> {
    let raw = xattr::get(path, FINDER_INFO_XATTR).ok().flatten()?;
    let bytes = raw.get(8..10)?;
    Some(u16::from_be_bytes([bytes[0], bytes[1]]))
}

#[cfg(target_os = "macos")]
fn has_hidden_attribute(path: &Path) -> bool {
    use std::os::macos::fs::MetadataExt;

    const UF_HIDDEN: u32 = 0x8000;

    let Ok(metadata) = fs::symlink_metadata(path) else {
        return false;
    };
    if metadata.st_flags() & UF_HIDDEN == UF_HIDDEN {
        return true;
    }
    finder_flags(path).is_some_and(|flags| flags & FINDER_FLAG_IS_INVISIBLE != 0)
}

#[cfg(windows)]
fn has_hidden_attribute(path: &Path) -> bool {
    use std::os::windows::fs::MetadataExt;

    const FILE_ATTRIBUTE_HIDDEN: u32 = 0x2;

    fs::symlink_metadata(path)
        .map(|metadata| metadata.file_attributes() & FILE_ATTRIBUTE_HIDDEN != 0)
        .unwrap_or(false)
}

#[cfg(not(any(target_os = "macos", windows)))]
fn has_hidden_attribute(_path: &Path) -> bool {
    false
}

/// Returns true if `path` is a directory the platform treats as one opaque
/// item (application bundles, frameworks, document packages).
pub fn is_package(path: &Path) -> bool {
    let Ok(metadata) = fs::metadata(path) else {
        return false;
    };
    if !metadata.is_dir() {
        return false;
    }
    has_bundle_bit(path) || has_bundle_layout(path)
}

#[cfg(target_os = "macos")]
fn has_bundle_bit(path: &Path) -> bool {
    finder_flags(path).is_some_and(|flags| flags & FINDER_FLAG_HAS_BUNDLE != 0)
}

#[cfg(not(target_os = "macos"))]
fn has_bundle_bit(_path: &Path) -> bool {
    false
}

/// A bundle carries `Contents/Info.plist` declaring a package type.
#[cfg(target_os = "macos")]
fn has_bundle_layout(path: &Path) -> bool {
    let info = path.join("Contents").join("Info.plist");
    let Ok(value) = plist::Value::from_file(&info) else {
        return false;
    };
    value
        .as_dictionary()
        .and_then(|dict| dict.get("CFBundlePackageType"))
        .and_then(plist::Value::as_string)
        .is_some_and(|kind| !kind.trim().is_empty())
}

#[cfg(not(target_os = "macos"))]
fn has_bundle_layout(path: &Path) -> bool {
    path.join("Contents").join("Info.plist").is_file()
}
