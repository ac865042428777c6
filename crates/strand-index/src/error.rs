//! Error types for the index crate.

/// Errors that can occur building or checking a B-tree.
#[derive(Debug, thiserror::Error)]
pub enum IndexError {
    /// Block size below the minimum of three keys per node.
    #[error("invalid block size {0}: must be at least 3")]
    BlockSize(usize),

    /// A structural invariant does not hold.
    #[error("B-tree invariant violated: {0}")]
    Invariant(String),
}

/// Convenience alias for index results.
pub type IndexResult<T> = Result<T, IndexError>;
