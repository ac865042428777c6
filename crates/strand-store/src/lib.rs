//! Backend driver contract for strand records.
//!
//! A backend stores, per record, an append-only delta log, an optional
//! checkpoint snapshot, and a query projection. It never interprets log or
//! checkpoint bytes; the persistence layer owns their format.
//!
//! # Key Types
//!
//! - [`Backend`] -- opens records, iterates tables, flushes, compacts
//! - [`RecordHandle`] -- one record's projection, stored bytes, and writes
//! - [`RecordCursor`] -- async iterator over a table's matching records
//! - [`MemoryBackend`] -- in-memory driver for tests and embedding
//!
//! # Design Rules
//!
//! 1. A checkpoint reflects the state after the deltas written with it.
//! 2. Deltas for one record are returned in the order they were written.
//! 3. Queries filter on the projection only, never on replayed deltas.
//! 4. I/O errors are surfaced to the caller; backends do not retry.

pub mod error;
pub mod memory;
pub mod traits;

pub use error::{StoreError, StoreResult};
pub use memory::MemoryBackend;
pub use traits::{Backend, BackendStats, RecordCursor, RecordHandle, RecordWrite, StoredRecord};
