//! Rendered formula cache.
//!
//! Successful renders are kept in an in-memory LRU keyed by formula text and
//! scale, so repeated formulas never reach the rendering surface again.
//!
//! ```toml
//! [render]
//! cache_capacity = 256   # 0 disables the cache
//! ```

mod store;

pub use store::{CacheKey, FormulaCache};
