//! Huffman coding of `(run, delta)` reference pairs.
//!
//! Trees are transmitted in preorder: a `0` bit is an internal node followed
//! by its left and right subtrees, a `1` bit is a leaf followed by the
//! zig-zagged delta and the run length in the variable-width scheme.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};

use strand_stream::{unzigzag, zigzag};

use crate::bits::{BitReader, BitWriter};
use crate::error::{CodecError, CodecResult};

/// One coded unit: `run` consecutive slots sharing the same `delta`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub(crate) struct Pair {
    pub run: u64,
    pub delta: i64,
}

/// Deepest tree accepted from the wire.
const MAX_DEPTH: usize = 64;

#[derive(Clone, Debug, PartialEq)]
pub(crate) enum Tree {
    Leaf(Pair),
    Internal(Box<Tree>, Box<Tree>),
}

impl Tree {
    pub fn build(freqs: &HashMap<Pair, u64>) -> CodecResult<Tree> {
        let mut symbols: Vec<(Pair, u64)> = freqs.iter().map(|(p, f)| (*p, *f)).collect();
        if symbols.is_empty() {
            return Err(CodecError::Invariant("Huffman tree over no symbols".into()));
        }
        symbols.sort();

        let mut slots: Vec<Option<Tree>> = Vec::with_capacity(symbols.len() * 2);
        let mut heap = BinaryHeap::new();
        for (pair, freq) in symbols {
            heap.push(Reverse((freq, slots.len())));
            slots.push(Some(Tree::Leaf(pair)));
        }
        while heap.len() > 1 {
            let (Some(Reverse((fa, a))), Some(Reverse((fb, b)))) = (heap.pop(), heap.pop()) else {
                break;
            };
            let left = slots[a].take();
            let right = slots[b].take();
            let (Some(left), Some(right)) = (left, right) else {
                return Err(CodecError::Invariant("Huffman slot reused".into()));
            };
            heap.push(Reverse((fa + fb, slots.len())));
            slots.push(Some(Tree::Internal(Box::new(left), Box::new(right))));
        }
        let Reverse((_, root)) = heap
            .pop()
            .ok_or_else(|| CodecError::Invariant("empty Huffman heap".into()))?;
        slots[root]
            .take()
            .ok_or_else(|| CodecError::Invariant("Huffman root missing".into()))
    }

    /// Code table: `(bits, length)` per pair, left = `0`.
    pub fn codes(&self) -> CodecResult<HashMap<Pair, (u64, u32)>> {
        let mut out = HashMap::new();
        let mut stack = vec![(self, 0u64, 0u32)];
        while let Some((node, bits, len)) = stack.pop() {
            match node {
                Tree::Leaf(pair) => {
                    out.insert(*pair, (bits, len));
                }
                Tree::Internal(left, right) => {
                    if len as usize >= MAX_DEPTH {
                        return Err(CodecError::Invariant("Huffman tree too deep".into()));
                    }
                    stack.push((right, (bits << 1) | 1, len + 1));
                    stack.push((left, bits << 1, len + 1));
                }
            }
        }
        Ok(out)
    }

    pub fn write(&self, w: &mut BitWriter) -> CodecResult<()> {
        match self {
            Tree::Leaf(pair) => {
                w.write_bit(true);
                w.write_var(zigzag(pair.delta))?;
                w.write_var(pair.run)?;
            }
            Tree::Internal(left, right) => {
                w.write_bit(false);
                left.write(w)?;
                right.write(w)?;
            }
        }
        Ok(())
    }

    pub fn read(r: &mut BitReader<'_>) -> CodecResult<Tree> {
        Self::read_at(r, 0)
    }

    fn read_at(r: &mut BitReader<'_>, depth: usize) -> CodecResult<Tree> {
        if depth > MAX_DEPTH {
            return Err(CodecError::MalformedHuffman("tree too deep".into()));
        }
        if r.read_bit()? {
            let delta = unzigzag(r.read_var()?);
            let run = r.read_var()?;
            if run == 0 {
                return Err(CodecError::MalformedHuffman("zero-length run".into()));
            }
            return Ok(Tree::Leaf(Pair { run, delta }));
        }
        let left = Self::read_at(r, depth + 1)?;
        let right = Self::read_at(r, depth + 1)?;
        Ok(Tree::Internal(Box::new(left), Box::new(right)))
    }

    /// Decode one pair. A tree that is a single leaf uses zero bits per code.
    pub fn decode(&self, r: &mut BitReader<'_>) -> CodecResult<Pair> {
        let mut node = self;
        loop {
            match node {
                Tree::Leaf(pair) => return Ok(*pair),
                Tree::Internal(left, right) => {
                    node = if r.read_bit()? { right } else { left };
                }
            }
        }
    }
}
