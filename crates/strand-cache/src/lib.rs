//! GC-aware query cache for strand records.
//!
//! The cache indexes every live record it knows about in a path trie keyed
//! by field names and scalar values, and answers equality queries by
//! intersecting the member trees of the constrained nodes. Records are held
//! weakly: once the application drops its last handle the record's trie
//! entries go away. Queries fall through to the backend after the cached
//! candidates are exhausted, loading stored matches into the cache.
//!
//! # Key Types
//!
//! - [`Cache`] -- registration, lookup, queries and listeners
//! - [`QueryCursor`] -- cache-then-backend result stream
//! - [`CacheConfig`] -- member tree shape and fall-through switch
//! - [`Segment`] -- one step of a trie path
//!
//! # Design Rules
//!
//! 1. The cache never keeps a record alive.
//! 2. A query yields each record at most once, and only if the live record matches.
//! 3. Concurrent loads of one key share a single replay.

pub mod cache;
pub mod config;
pub mod cursor;
pub mod error;
pub mod trie;

pub use cache::{Cache, CacheStats};
pub use config::CacheConfig;
pub use cursor::QueryCursor;
pub use error::{CacheError, CacheResult};
pub use trie::{trie_path, Segment};
