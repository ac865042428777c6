use std::collections::VecDeque;

use strand_types::{related, Delta, DeltaOp, PathSeg};
use tracing::trace;

/// Pending deltas for one stream of a record (instance or projection).
///
/// A `Modify` replaces an earlier pending `Modify` of the same path when no
/// delta in between touched a related path, so a field rewritten many times
/// inside one squash window is logged once. An `Insert` or `Delete` in between
/// whose container encloses the path also blocks it: array shifts make the
/// two deltas address different elements.
#[derive(Debug, Default)]
pub struct ChangeTracker {
    pending: VecDeque<Delta>,
    squashed: u64,
}

impl ChangeTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, delta: Delta) {
        if delta.op == DeltaOp::Modify {
            if let Some(i) = self.squash_target(&delta) {
                trace!(target_record = %delta.target, "modify squashed");
                self.pending.remove(i);
                self.squashed += 1;
            }
        }
        self.pending.push_back(delta);
    }

    fn squash_target(&self, delta: &Delta) -> Option<usize> {
        for (i, earlier) in self.pending.iter().enumerate().rev() {
            if earlier.path == delta.path {
                return (earlier.op == DeltaOp::Modify).then_some(i);
            }
            if earlier.touches(&delta.path) || shifts(earlier, &delta.path) {
                return None;
            }
        }
        None
    }

    /// Take everything pending, oldest first.
    pub fn take(&mut self) -> Vec<Delta> {
        self.pending.drain(..).collect()
    }

    /// Put deltas from a failed write back in front of anything queued since.
    pub fn requeue(&mut self, deltas: Vec<Delta>) {
        for delta in deltas.into_iter().rev() {
            self.pending.push_front(delta);
        }
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Modifies dropped by squashing so far.
    pub fn squashed(&self) -> u64 {
        self.squashed
    }
}

/// Whether `delta` may renumber the elements along `path`.
fn shifts(delta: &Delta, path: &[PathSeg]) -> bool {
    match (delta.op, delta.path.split_last()) {
        (DeltaOp::Insert | DeltaOp::Delete, Some((_, parent))) => related(parent, path),
        _ => false,
    }
}
