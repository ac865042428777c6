//! Object-graph codec for strand.
//!
//! Values are grouped by serializer into extents: primitives first, then
//! binary payloads, then compound nodes in type-dependency order. Every value
//! gets an index from its position, and compound nodes store their
//! dependencies as Huffman-coded index deltas. Shared sub-objects are
//! written once and cycles are ordinary back references.
//!
//! # Entry points
//!
//! - [`to_bytes`] / [`from_bytes`] for whole buffers
//! - [`encode`] / [`decode`] over [`strand_stream`] writers and readers;
//!   decoding resumes wherever the input runs out
//! - [`copy`] for a deep copy with the same sharing, without bytes
//! - [`encode_batch`] / [`decode_batch`] for delta logs
//!
//! Serializers live in a process-wide [`Registry`]; [`register`] adds user
//! types such as a [`RecordSerializer`].

pub mod builtins;
pub mod copy;
pub mod decoder;
pub mod delta;
pub mod encoder;
pub mod error;
pub mod format;
pub mod registry;

mod bits;
mod huffman;
mod plan;

pub use builtins::{MapSerializer, ObjectSerializer, RecordSerializer, SequenceSerializer};
pub use copy::{copy, copy_with};
pub use decoder::{decode, decode_with, from_bytes, from_bytes_with, Decoder, Progress};
pub use delta::{decode_batch, encode_batch};
pub use encoder::{encode, encode_fragment, encode_with, to_bytes, to_bytes_with, Encoder};
pub use error::{CodecError, CodecResult};
pub use format::{EncodeOptions, MAGIC, VERSION};
pub use registry::{
    register, register_selector, snapshot, CompoundSerializer, PrimitiveSerializer, Registry,
    Selector, Serializer,
};
