use strand_stream::StreamError;
use strand_types::TypeError;
use thiserror::Error;

/// Errors produced while encoding, decoding, or copying object graphs.
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("invalid magic: expected STRG, got {0:02x?}")]
    InvalidMagic([u8; 4]),

    #[error("unsupported format version: {0}")]
    UnsupportedVersion(u8),

    #[error("unknown type: {0}")]
    UnknownType(String),

    #[error("unknown extent tag: {0}")]
    UnknownExtent(u8),

    #[error("type name index {0} out of range")]
    UnknownTypeIndex(u64),

    #[error("malformed Huffman table: {0}")]
    MalformedHuffman(String),

    #[error("malformed input: {0}")]
    Malformed(String),

    #[error("value does not fit serializer {serializer}: {reason}")]
    WrongValue { serializer: String, reason: String },

    /// A registry or algorithm bug, not a data problem.
    #[error("invariant violated: {0}")]
    Invariant(String),

    #[error("compression failed: {0}")]
    Compression(String),

    #[error("stream error: {0}")]
    Stream(#[from] StreamError),

    #[error("graph error: {0}")]
    Type(#[from] TypeError),
}

pub type CodecResult<T> = Result<T, CodecError>;
