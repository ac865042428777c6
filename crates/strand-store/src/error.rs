use strand_codec::CodecError;
use strand_index::IndexError;
use strand_stream::StreamError;
use strand_types::TypeError;

/// Errors from backend operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The backend was closed; no further reads or writes are accepted.
    #[error("backend is closed")]
    Closed,

    /// A cursor was used after `close`.
    #[error("cursor is closed")]
    CursorClosed,

    #[error("record {key} not found in table {table}")]
    NotFound { table: String, key: String },

    /// A stored query delta could not be applied to the projection.
    #[error("projection update failed for {key}: {source}")]
    Projection {
        key: String,
        #[source]
        source: TypeError,
    },

    #[error("codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("index error: {0}")]
    Index(#[from] IndexError),

    #[error("stream error: {0}")]
    Stream(#[from] StreamError),

    /// I/O error from the underlying storage.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Driver-specific failure (connection loss, quota, ...).
    #[error("backend error: {0}")]
    Backend(String),
}

/// Result alias for backend operations.
pub type StoreResult<T> = Result<T, StoreError>;
