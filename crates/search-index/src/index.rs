//! Persistent document index.
//!
//! ## Module Structure
//!
//! - `engine` - Engine/store traits and shared types
//! - `disk` - Bundled inverted-index engine
//! - `handle` - `Index`, the caller-facing handle and writer registry
//! - `persistence` - Index file read/write
//! - `terms` - Tokenization and query term patterns
//! - `text` - Name text and transliteration

mod disk;
mod engine;
mod handle;
mod persistence;
mod terms;
mod text;

pub use disk::{extract_content, DiskIndexEngine, DiskIndexStore, MAX_CONTENT_BYTES};
pub use engine::{
    DocumentId, EngineMatches, EngineQuery, IndexEngine, IndexKind, IndexStore, OpenMode,
};
pub use handle::{Index, IndexOptions};
pub use persistence::INDEX_FILE_VERSION;
pub use terms::{parse_query, tokenize, TermMatch, TermPattern};
pub use text::{name_text, transliterate};

/// An index backed by the bundled engine.
pub type DiskIndex = Index<DiskIndexStore>;
