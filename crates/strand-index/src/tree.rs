//! The B-tree.
//!
//! Each node holds its keys and, for internal nodes, one more child than
//! keys, so the logical layout alternates `child0 key0 child1 key1 ...`.
//! Every key in `children[i]` lies strictly between `keys[i - 1]` and
//! `keys[i]`. All leaves sit at the same depth.

use std::fmt;

use tracing::trace;

use crate::config::IndexConfig;
use crate::error::{IndexError, IndexResult};
use crate::key::IndexKey;

#[derive(Clone, Default)]
struct Node {
    keys: Vec<IndexKey>,
    children: Vec<Node>,
}

enum Inserted {
    Present,
    Added,
    Split(IndexKey, Node),
}

impl Node {
    fn is_leaf(&self) -> bool {
        self.children.is_empty()
    }

    fn insert(&mut self, key: IndexKey, block: usize) -> Inserted {
        let i = match self.keys.binary_search(&key) {
            Ok(_) => return Inserted::Present,
            Err(i) => i,
        };
        if self.is_leaf() {
            self.keys.insert(i, key);
        } else {
            match self.children[i].insert(key, block) {
                Inserted::Split(promoted, right) => {
                    self.keys.insert(i, promoted);
                    self.children.insert(i + 1, right);
                }
                other => return other,
            }
        }
        if self.keys.len() <= block {
            return Inserted::Added;
        }
        let mid = self.keys.len() / 2;
        let right_keys = self.keys.split_off(mid + 1);
        let right_children = if self.is_leaf() {
            Vec::new()
        } else {
            self.children.split_off(mid + 1)
        };
        match self.keys.pop() {
            Some(promoted) => Inserted::Split(
                promoted,
                Node {
                    keys: right_keys,
                    children: right_children,
                },
            ),
            None => Inserted::Added,
        }
    }

    fn remove(&mut self, key: &IndexKey, min: usize) -> bool {
        match (self.keys.binary_search(key), self.is_leaf()) {
            (Ok(i), true) => {
                self.keys.remove(i);
                true
            }
            (Ok(i), false) => {
                // Swap in the in-order predecessor, then fix the left subtree.
                let Some(pred) = self.children[i].pop_max(min) else {
                    return false;
                };
                self.keys[i] = pred;
                self.rebalance(i, min);
                true
            }
            (Err(_), true) => false,
            (Err(i), false) => {
                let removed = self.children[i].remove(key, min);
                if removed {
                    self.rebalance(i, min);
                }
                removed
            }
        }
    }

    fn pop_max(&mut self, min: usize) -> Option<IndexKey> {
        if self.is_leaf() {
            return self.keys.pop();
        }
        let last = self.children.len() - 1;
        let key = self.children[last].pop_max(min);
        self.rebalance(last, min);
        key
    }

    /// Restore minimum occupancy of `children[i]` by borrowing from a
    /// sibling with keys to spare, or else merging with one.
    fn rebalance(&mut self, i: usize, min: usize) {
        if self.children[i].keys.len() >= min {
            return;
        }
        if i > 0 && self.children[i - 1].keys.len() > min {
            let (left, right) = self.children.split_at_mut(i);
            let (left, child) = (&mut left[i - 1], &mut right[0]);
            if let Some(borrowed) = left.keys.pop() {
                let separator = std::mem::replace(&mut self.keys[i - 1], borrowed);
                child.keys.insert(0, separator);
                if let Some(grandchild) = left.children.pop() {
                    child.children.insert(0, grandchild);
                }
            }
            return;
        }
        if i + 1 < self.children.len() && self.children[i + 1].keys.len() > min {
            let (left, right) = self.children.split_at_mut(i + 1);
            let (child, sibling) = (&mut left[i], &mut right[0]);
            let borrowed = sibling.keys.remove(0);
            let separator = std::mem::replace(&mut self.keys[i], borrowed);
            child.keys.push(separator);
            if !sibling.is_leaf() {
                child.children.push(sibling.children.remove(0));
            }
            return;
        }
        let at = if i > 0 { i - 1 } else { i };
        if at + 1 < self.children.len() {
            self.merge(at);
        }
    }

    /// Merge `children[at + 1]` and the separator between them into
    /// `children[at]`.
    fn merge(&mut self, at: usize) {
        let right = self.children.remove(at + 1);
        let separator = self.keys.remove(at);
        let left = &mut self.children[at];
        left.keys.push(separator);
        left.keys.extend(right.keys);
        left.children.extend(right.children);
    }

    fn check(
        &self,
        lower: Option<&IndexKey>,
        upper: Option<&IndexKey>,
        min: usize,
        block: usize,
        is_root: bool,
        leaf_depth: &mut Option<usize>,
        depth: usize,
    ) -> IndexResult<usize> {
        let fail = |msg: String| Err(IndexError::Invariant(msg));
        if self.keys.len() > block {
            return fail(format!("node holds {} keys, block size {block}", self.keys.len()));
        }
        if !is_root && self.keys.len() < min {
            return fail(format!("node holds {} keys, minimum {min}", self.keys.len()));
        }
        if self.keys.windows(2).any(|w| w[0] >= w[1]) {
            return fail("keys out of order within a node".into());
        }
        if let (Some(lo), Some(first)) = (lower, self.keys.first()) {
            if first <= lo {
                return fail(format!("{first:?} not above lower bound {lo:?}"));
            }
        }
        if let (Some(hi), Some(last)) = (upper, self.keys.last()) {
            if last >= hi {
                return fail(format!("{last:?} not below upper bound {hi:?}"));
            }
        }
        if self.is_leaf() {
            match *leaf_depth {
                Some(d) if d != depth => return fail("leaves at different depths".into()),
                Some(_) => {}
                None => *leaf_depth = Some(depth),
            }
            return Ok(self.keys.len());
        }
        if self.children.len() != self.keys.len() + 1 {
            return fail(format!(
                "{} children for {} keys",
                self.children.len(),
                self.keys.len()
            ));
        }
        let mut count = self.keys.len();
        for (i, child) in self.children.iter().enumerate() {
            let lo = if i == 0 { lower } else { self.keys.get(i - 1) };
            let hi = self.keys.get(i).or(upper);
            count += child.check(lo, hi, min, block, false, leaf_depth, depth + 1)?;
        }
        Ok(count)
    }
}

/// A B-tree set of [`IndexKey`]s.
#[derive(Clone)]
pub struct BTree {
    root: Node,
    block: usize,
    len: usize,
}

impl Default for BTree {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for BTree {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BTree")
            .field("len", &self.len)
            .field("depth", &self.depth())
            .field("block_size", &self.block)
            .finish()
    }
}

impl BTree {
    pub fn new() -> Self {
        Self {
            root: Node::default(),
            block: IndexConfig::default().block_size,
            len: 0,
        }
    }

    pub fn with_block_size(block_size: usize) -> IndexResult<Self> {
        if block_size < 3 {
            return Err(IndexError::BlockSize(block_size));
        }
        Ok(Self {
            root: Node::default(),
            block: block_size,
            len: 0,
        })
    }

    pub fn with_config(config: &IndexConfig) -> IndexResult<Self> {
        Self::with_block_size(config.block_size)
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn block_size(&self) -> usize {
        self.block
    }

    fn min_keys(&self) -> usize {
        self.block / 2
    }

    /// Levels from the root to the leaves; an empty tree has depth 1.
    pub fn depth(&self) -> usize {
        let mut depth = 1;
        let mut node = &self.root;
        while let Some(child) = node.children.first() {
            node = child;
            depth += 1;
        }
        depth
    }

    /// Insert `key`; returns `false` if it was already present.
    pub fn insert(&mut self, key: impl Into<IndexKey>) -> bool {
        match self.root.insert(key.into(), self.block) {
            Inserted::Present => false,
            Inserted::Added => {
                self.len += 1;
                true
            }
            Inserted::Split(promoted, right) => {
                let left = std::mem::take(&mut self.root);
                self.root = Node {
                    keys: vec![promoted],
                    children: vec![left, right],
                };
                self.len += 1;
                trace!(depth = self.depth(), len = self.len, "root split");
                true
            }
        }
    }

    /// Remove `key`; returns `false` if it was absent.
    pub fn remove(&mut self, key: &IndexKey) -> bool {
        if !self.root.remove(key, self.min_keys()) {
            return false;
        }
        self.len -= 1;
        if self.root.keys.is_empty() {
            if let Some(only) = self.root.children.pop() {
                self.root = only;
                trace!(depth = self.depth(), len = self.len, "root collapsed");
            }
        }
        true
    }

    pub fn contains(&self, key: &IndexKey) -> bool {
        let mut node = &self.root;
        loop {
            match node.keys.binary_search(key) {
                Ok(_) => return true,
                Err(i) => match node.children.get(i) {
                    Some(child) => node = child,
                    None => return false,
                },
            }
        }
    }

    pub fn first(&self) -> Option<&IndexKey> {
        let mut node = &self.root;
        while let Some(child) = node.children.first() {
            node = child;
        }
        node.keys.first()
    }

    pub fn last(&self) -> Option<&IndexKey> {
        let mut node = &self.root;
        while let Some(child) = node.children.last() {
            node = child;
        }
        node.keys.last()
    }

    pub fn clear(&mut self) {
        self.root = Node::default();
        self.len = 0;
    }

    /// All keys in ascending order.
    pub fn iter(&self) -> Iter<'_> {
        let mut iter = Iter { stack: Vec::new() };
        iter.descend(&self.root);
        iter
    }

    /// Keys `>= key`, ascending.
    pub fn seek(&self, key: &IndexKey) -> Iter<'_> {
        self.seek_from(key, true)
    }

    /// Keys `> key`, ascending.
    pub fn seek_after(&self, key: &IndexKey) -> Iter<'_> {
        self.seek_from(key, false)
    }

    fn seek_from(&self, key: &IndexKey, inclusive: bool) -> Iter<'_> {
        let mut iter = Iter { stack: Vec::new() };
        let mut node = &self.root;
        loop {
            match node.keys.binary_search(key) {
                Ok(i) if inclusive => {
                    iter.stack.push((node, i));
                    return iter;
                }
                Ok(i) => {
                    iter.stack.push((node, i + 1));
                    if let Some(child) = node.children.get(i + 1) {
                        iter.descend(child);
                    }
                    return iter;
                }
                Err(i) => {
                    iter.stack.push((node, i));
                    match node.children.get(i) {
                        Some(child) => node = child,
                        None => return iter,
                    }
                }
            }
        }
    }

    /// Verify ordering, occupancy, shape and the cached length.
    pub fn check_invariants(&self) -> IndexResult<()> {
        let mut leaf_depth = None;
        let count = self
            .root
            .check(None, None, self.min_keys(), self.block, true, &mut leaf_depth, 0)?;
        if !self.root.is_leaf() && self.root.keys.is_empty() {
            return Err(IndexError::Invariant("internal root without keys".into()));
        }
        if count != self.len {
            return Err(IndexError::Invariant(format!(
                "counted {count} keys, length says {}",
                self.len
            )));
        }
        Ok(())
    }
}

impl<K: Into<IndexKey>> Extend<K> for BTree {
    fn extend<I: IntoIterator<Item = K>>(&mut self, iter: I) {
        for key in iter {
            self.insert(key);
        }
    }
}

impl<K: Into<IndexKey>> FromIterator<K> for BTree {
    fn from_iter<I: IntoIterator<Item = K>>(iter: I) -> Self {
        let mut tree = BTree::new();
        tree.extend(iter);
        tree
    }
}

impl<'a> IntoIterator for &'a BTree {
    type Item = &'a IndexKey;
    type IntoIter = Iter<'a>;

    fn into_iter(self) -> Iter<'a> {
        self.iter()
    }
}

/// In-order iterator. Each stack entry is a node and the index of the next
/// key to yield from it; the child left of that key has been visited.
pub struct Iter<'a> {
    stack: Vec<(&'a Node, usize)>,
}

impl<'a> Iter<'a> {
    fn descend(&mut self, mut node: &'a Node) {
        loop {
            self.stack.push((node, 0));
            match node.children.first() {
                Some(child) => node = child,
                None => return,
            }
        }
    }
}

impl<'a> Iterator for Iter<'a> {
    type Item = &'a IndexKey;

    fn next(&mut self) -> Option<&'a IndexKey> {
        loop {
            let top = self.stack.last_mut()?;
            let node: &'a Node = top.0;
            let i = top.1;
            if i < node.keys.len() {
                top.1 += 1;
                if let Some(child) = node.children.get(i + 1) {
                    self.descend(child);
                }
                return Some(&node.keys[i]);
            }
            self.stack.pop();
        }
    }
}
