//! Buffered byte streams for strand.
//!
//! [`StreamReader`] and [`StreamWriter`] sit between the codec and whatever
//! actually holds the bytes. Both are agnostic of where bytes come from or go
//! to: anything implementing [`ByteSource`] / [`ByteSink`] works, and adapters
//! are provided for whole buffers, chunk iterators, tokio `AsyncRead` /
//! `AsyncWrite` objects, and `mpsc` channels.
//!
//! The reader keeps a growable buffer and only pulls from its source when a
//! caller asks for more than is buffered ([`StreamReader::ensure_read`]).
//! Fixed-width reads are synchronous and assume availability was ensured.

pub mod error;
pub mod reader;
pub mod sink;
pub mod source;
pub mod varint;
pub mod writer;

pub use error::{StreamError, StreamResult};
pub use reader::StreamReader;
pub use sink::{AsyncWriteSink, ByteSink, ChannelSink, CollectSink, Collected};
pub use source::{AsyncReadSource, ByteSource, BytesSource, ChannelSource, ChunkSource};
pub use varint::{decode_varint, encode_varint, unzigzag, varint_len, zigzag};
pub use writer::{passthrough, StreamWriter, DEFAULT_FLUSH_THRESHOLD};
