//! Sorted multi-way intersection.
//!
//! Every tree gets a cursor. The largest current key is the candidate; any
//! cursor behind it seeks forward to it. When all cursors agree the key is
//! yielded and every cursor steps past it.

use crate::key::IndexKey;
use crate::tree::{BTree, Iter};

/// Keys present in every one of `trees`, ascending. The intersection of no
/// trees is empty.
pub fn intersection<'a>(trees: &[&'a BTree]) -> Intersection<'a> {
    let mut trees: Vec<&'a BTree> = trees.to_vec();
    // smallest first, so an empty tree ends the walk at once
    trees.sort_by_key(|t| t.len());
    let mut cursors: Vec<Iter<'a>> = trees.iter().map(|t| t.iter()).collect();
    let heads = cursors.iter_mut().map(Iterator::next).collect();
    Intersection {
        trees,
        cursors,
        heads,
    }
}

pub struct Intersection<'a> {
    trees: Vec<&'a BTree>,
    cursors: Vec<Iter<'a>>,
    heads: Vec<Option<&'a IndexKey>>,
}

impl<'a> Iterator for Intersection<'a> {
    type Item = &'a IndexKey;

    fn next(&mut self) -> Option<&'a IndexKey> {
        if self.trees.is_empty() {
            return None;
        }
        loop {
            let mut max: &'a IndexKey = self.heads[0]?;
            for head in &self.heads[1..] {
                let head = (*head)?;
                if head > max {
                    max = head;
                }
            }
            let mut agreed = true;
            for i in 0..self.trees.len() {
                if self.heads[i] != Some(max) {
                    agreed = false;
                    self.cursors[i] = self.trees[i].seek(max);
                    self.heads[i] = self.cursors[i].next();
                }
            }
            if agreed {
                for (cursor, head) in self.cursors.iter_mut().zip(self.heads.iter_mut()) {
                    *head = cursor.next();
                }
                return Some(max);
            }
        }
    }
}
