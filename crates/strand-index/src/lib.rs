//! Sorted key index for strand.
//!
//! A B-tree over binary keys, kept balanced by splitting on insert and
//! borrowing from or merging with siblings on removal. Any number of trees
//! can be intersected lazily with a sorted multi-way merge.
//!
//! # Key Types
//!
//! - [`IndexKey`] -- binary key, shorter keys sort first
//! - [`BTree`] -- the tree; [`Iter`] walks it in order from any start key
//! - [`Intersection`] -- keys present in every one of several trees

pub mod config;
pub mod error;
pub mod intersect;
pub mod key;
pub mod tree;

pub use config::IndexConfig;
pub use error::{IndexError, IndexResult};
pub use intersect::{intersection, Intersection};
pub use key::IndexKey;
pub use tree::{BTree, Iter};
