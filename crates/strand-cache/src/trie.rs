//! Path trie over record field values.
//!
//! A scalar at `address.city == "Paris"` becomes the trie path
//! `Field(address) / Field(city) / Value("Paris")`. A record is a member of
//! the root and of every node along each of its paths, so a node's members
//! always include its children's.

use std::collections::HashMap;
use std::sync::Arc;

use strand_index::{BTree, IndexKey};
use strand_types::Scalar;

#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Segment {
    Field(Arc<str>),
    Value(Scalar),
}

/// Trie path for one scalar leaf.
pub fn trie_path(fields: &[Arc<str>], value: &Scalar) -> Vec<Segment> {
    fields
        .iter()
        .cloned()
        .map(Segment::Field)
        .chain(std::iter::once(Segment::Value(value.clone())))
        .collect()
}

pub(crate) struct Trie {
    root: TrieNode,
    /// Empty tree cloned for new nodes, carrying the configured block size.
    empty: BTree,
}

struct TrieNode {
    members: BTree,
    children: HashMap<Segment, TrieNode>,
}

impl TrieNode {
    fn new(members: BTree) -> Self {
        Self {
            members,
            children: HashMap::new(),
        }
    }

    fn count(&self) -> usize {
        1 + self.children.values().map(TrieNode::count).sum::<usize>()
    }
}

impl Trie {
    pub(crate) fn new(empty: BTree) -> Self {
        Self {
            root: TrieNode::new(empty.clone()),
            empty,
        }
    }

    /// Add `key` to the root and to every node along `path`.
    pub(crate) fn insert(&mut self, path: &[Segment], key: &IndexKey) {
        let Trie { root, empty } = self;
        let mut node = root;
        node.members.insert(key.clone());
        for seg in path {
            node = node
                .children
                .entry(seg.clone())
                .or_insert_with(|| TrieNode::new(empty.clone()));
            node.members.insert(key.clone());
        }
    }

    /// Undo [`insert`](Self::insert), pruning nodes left without members.
    pub(crate) fn remove(&mut self, path: &[Segment], key: &IndexKey) {
        remove_from(&mut self.root, path, key);
    }

    pub(crate) fn members(&self, path: &[Segment]) -> Option<&BTree> {
        let mut node = &self.root;
        for seg in path {
            node = node.children.get(seg)?;
        }
        Some(&node.members)
    }

    pub(crate) fn node_count(&self) -> usize {
        self.root.count()
    }
}

fn remove_from(node: &mut TrieNode, path: &[Segment], key: &IndexKey) {
    node.members.remove(key);
    let Some((head, rest)) = path.split_first() else {
        return;
    };
    let emptied = match node.children.get_mut(head) {
        Some(child) => {
            remove_from(child, rest, key);
            child.members.is_empty()
        }
        None => false,
    };
    if emptied {
        node.children.remove(head);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn path(fields: &[&str], value: &str) -> Vec<Segment> {
        let fields: Vec<Arc<str>> = fields.iter().map(|f| Arc::from(*f)).collect();
        trie_path(&fields, &Scalar::from(value))
    }

    fn keys(tree: &BTree) -> Vec<String> {
        tree.iter().filter_map(|k| k.as_str().map(str::to_string)).collect()
    }

    #[test]
    fn members_accumulate_along_the_path() {
        let mut trie = Trie::new(BTree::new());
        trie.insert(&path(&["address", "city"], "Paris"), &IndexKey::from("a"));
        trie.insert(&path(&["address", "city"], "Oslo"), &IndexKey::from("b"));

        let city = [Segment::Field(Arc::from("address")), Segment::Field(Arc::from("city"))];
        assert_eq!(keys(trie.members(&city).unwrap()), ["a", "b"]);
        assert_eq!(keys(trie.members(&path(&["address", "city"], "Paris")).unwrap()), ["a"]);
        assert!(trie.members(&path(&["address", "city"], "Rome")).is_none());
        assert_eq!(keys(trie.members(&[]).unwrap()), ["a", "b"]);
        // root, address, city, Paris, Oslo
        assert_eq!(trie.node_count(), 5);
    }

    #[test]
    fn removal_prunes_empty_branches() {
        let mut trie = Trie::new(BTree::new());
        let paris = path(&["city"], "Paris");
        let oslo = path(&["city"], "Oslo");
        trie.insert(&paris, &IndexKey::from("a"));
        trie.insert(&oslo, &IndexKey::from("b"));

        trie.remove(&paris, &IndexKey::from("a"));
        assert!(trie.members(&paris).is_none());
        assert_eq!(keys(trie.members(&oslo).unwrap()), ["b"]);

        trie.remove(&oslo, &IndexKey::from("b"));
        assert_eq!(trie.node_count(), 1);
        assert!(trie.members(&[]).unwrap().is_empty());
    }

    #[test]
    fn values_are_typed() {
        let mut trie = Trie::new(BTree::new());
        trie.insert(&trie_path(&[Arc::from("n")], &Scalar::Int(1)), &IndexKey::from("a"));
        assert!(trie.members(&path(&["n"], "1")).is_none());
        assert!(trie.members(&trie_path(&[Arc::from("n")], &Scalar::Int(1))).is_some());
    }
}
