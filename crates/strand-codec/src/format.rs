//! Wire-format constants and encoder options.
//!
//! ```text
//! [b"STRG"][version u8][extent ...][0]
//!
//! 18 names       count, count x (utf-8 name, NUL)
//!  1 primitives  name, count, values
//!  4 binary      name, count, count x len, payload
//!  5 binary/zstd name, count, count x len, stored len, zstd(payload)
//!  6 large       name, len, payload
//!  7 large/zstd  name, len, stored len, zstd(payload)
//!  3 huffman     byte len, preorder tree bits
//!  2 compounds   name, count, byte len, per-instance bits
//! 17 root        distance from the last index
//! ```
//!
//! All integers outside bit extents are LEB128 varints. Values receive
//! consecutive indices in the order their extents appear.

use serde::{Deserialize, Serialize};

pub const MAGIC: [u8; 4] = *b"STRG";
pub const VERSION: u8 = 1;

pub(crate) const EXT_EOF: u8 = 0;
pub(crate) const EXT_PRIMITIVES: u8 = 1;
pub(crate) const EXT_COMPOUNDS: u8 = 2;
pub(crate) const EXT_HUFFMAN: u8 = 3;
pub(crate) const EXT_BINARY: u8 = 4;
pub(crate) const EXT_BINARY_ZSTD: u8 = 5;
pub(crate) const EXT_LARGE: u8 = 6;
pub(crate) const EXT_LARGE_ZSTD: u8 = 7;
pub(crate) const EXT_ROOT: u8 = 17;
pub(crate) const EXT_NAMES: u8 = 18;

/// Upper bound on instances in one compound list accepted from the wire.
pub(crate) const MAX_LIST_LEN: u64 = 1 << 28;

/// Encoder tuning.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EncodeOptions {
    /// Binary lists at least this large are zstd-compressed when that
    /// makes them smaller.
    pub compress_threshold: usize,
    /// Binary values at least this large get an extent of their own.
    pub large_payload: usize,
    pub zstd_level: i32,
}

impl Default for EncodeOptions {
    fn default() -> Self {
        Self {
            compress_threshold: 4 * 1024,
            large_payload: 1024 * 1024,
            zstd_level: 3,
        }
    }
}

/// Reference point for the dependency in `slot` of an instance at index
/// `own`: the previous instance's same slot, else this instance's previous
/// slot, else the instance itself.
pub(crate) fn slot_base(prev: Option<&[usize]>, current: &[usize], slot: usize, own: usize) -> usize {
    match prev.and_then(|p| p.get(slot)) {
        Some(base) => *base,
        None if slot > 0 => current[slot - 1],
        None => own,
    }
}
