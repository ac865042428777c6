use strand_codec::CodecError;
use strand_store::StoreError;
use strand_stream::StreamError;
use strand_types::TypeError;

/// Errors from the per-record persistence protocol.
#[derive(Debug, thiserror::Error)]
pub enum PersistError {
    /// Configuration could not be parsed.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// A delta-log frame failed its length or CRC check.
    #[error("corrupt delta frame at offset {offset}: {reason}")]
    CorruptFrame { offset: u64, reason: String },

    /// A delta batch too large for the frame length field.
    #[error("delta batch of {0} bytes does not fit in one frame")]
    FrameTooLarge(usize),

    /// A stored delta batch could not be decoded or applied (strict replay).
    #[error("replay of {key} failed at batch {batch}: {reason}")]
    Replay {
        key: String,
        batch: usize,
        reason: String,
    },

    /// The stored checkpoint could not be decoded.
    #[error("checkpoint for {key} is unreadable: {reason}")]
    Checkpoint { key: String, reason: String },

    /// Mutation attempted on a logically deleted record.
    #[error("record {0} is deleted")]
    Deleted(String),

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("stream error: {0}")]
    Stream(#[from] StreamError),

    #[error("document error: {0}")]
    Type(#[from] TypeError),
}

/// Result alias for persistence operations.
pub type PersistResult<T> = Result<T, PersistError>;
