//! Query normalization and ranked search.
//!
//! - `options` - Match modes, engine option bits, query normalization
//! - `planner` - `SearchRequest`, `QueryPlanner` and result ranking

mod options;
mod planner;

pub use options::{normalize_query, MatchMode, SearchOptions};
pub use planner::{QueryPlanner, SearchHit, SearchRequest, DEFAULT_SEARCH_LIMIT, DEFAULT_TIME_LIMIT};
