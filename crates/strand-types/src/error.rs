use thiserror::Error;

/// Errors produced by graph, document, and delta operations.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TypeError {
    #[error("path not found: {0}")]
    PathNotFound(String),

    #[error("type mismatch at {path}: expected {expected}")]
    TypeMismatch { path: String, expected: &'static str },

    #[error("index {index} out of bounds at {path} (len {len})")]
    OutOfBounds {
        path: String,
        index: usize,
        len: usize,
    },

    #[error("value graph is cyclic and has no JSON form")]
    Cyclic,

    #[error("dangling node reference #{0}")]
    DanglingNode(usize),

    #[error("delta targets record {actual}, document is {expected}")]
    WrongTarget { expected: String, actual: String },

    #[error("invalid delta: {0}")]
    InvalidDelta(String),

    #[error("document root must be an object node")]
    InvalidRoot,
}

/// Convenience alias for type-level results.
pub type TypeResult<T> = Result<T, TypeError>;
