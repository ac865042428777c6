use crate::clock::LogicalTime;
use crate::graph::Fragment;
use crate::id::RecordId;
use crate::path::{display_path, related, PathSeg};

/// Kind of change a [`Delta`] describes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum DeltaOp {
    Insert,
    Modify,
    Delete,
}

impl DeltaOp {
    /// Wire code used by the delta codec.
    pub fn code(self) -> i64 {
        match self {
            DeltaOp::Insert => 0,
            DeltaOp::Modify => 1,
            DeltaOp::Delete => 2,
        }
    }

    pub fn from_code(code: i64) -> Option<Self> {
        match code {
            0 => Some(DeltaOp::Insert),
            1 => Some(DeltaOp::Modify),
            2 => Some(DeltaOp::Delete),
            _ => None,
        }
    }
}

/// One path-addressed change to a record.
///
/// Deltas are the unit exchanged between the reactive [`Document`](crate::Document)
/// and the persistence layer. A `Delete` with an empty path logically
/// deletes the whole record.
#[derive(Clone, Debug)]
pub struct Delta {
    pub target: RecordId,
    pub op: DeltaOp,
    pub path: Vec<PathSeg>,
    /// New value for Insert/Modify; `None` for Delete.
    pub value: Option<Fragment>,
    pub time: LogicalTime,
}

impl Delta {
    pub fn is_record_delete(&self) -> bool {
        self.op == DeltaOp::Delete && self.path.is_empty()
    }

    /// Returns `true` if this delta may affect `path` or anything below it.
    pub fn touches(&self, path: &[PathSeg]) -> bool {
        related(&self.path, path)
    }

    /// First top-level key of the path, if any.
    pub fn top_key(&self) -> Option<&str> {
        match self.path.first() {
            Some(PathSeg::Key(k)) => Some(k),
            _ => None,
        }
    }
}

impl PartialEq for Delta {
    fn eq(&self, other: &Self) -> bool {
        self.target == other.target
            && self.op == other.op
            && self.path == other.path
            && self.time == other.time
            && match (&self.value, &other.value) {
                (Some(a), Some(b)) => a.structurally_eq(b),
                (None, None) => true,
                _ => false,
            }
    }
}

impl std::fmt::Display for Delta {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{:?} {}@{} t={}.{}",
            self.op,
            self.target,
            display_path(&self.path),
            self.time.physical_ms,
            self.time.logical
        )
    }
}
