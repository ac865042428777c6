use thiserror::Error;

/// Errors produced by stream reads and writes.
#[derive(Debug, Error)]
pub enum StreamError {
    #[error("stream underflow: needed {needed} bytes, {available} buffered")]
    Underflow { needed: usize, available: usize },

    #[error("stream closed")]
    Closed,

    #[error("stream already closed")]
    AlreadyClosed,

    #[error("sink receiver dropped")]
    SinkGone,

    #[error("varint overflows 64 bits")]
    VarintOverflow,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type StreamResult<T> = Result<T, StreamError>;
