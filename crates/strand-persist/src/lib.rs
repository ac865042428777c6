//! Per-record persistence for strand.
//!
//! Each record is stored as an append-only log of delta batches plus an
//! occasional checkpoint snapshot. A live [`Record`] tracks mutations on two
//! streams (the full instance and the query projection), squashes them over
//! a digest window, and writes both in a single backend write. Reading a
//! record decodes the checkpoint and replays the deltas logged after it.
//!
//! # Key Types
//!
//! - [`Persistence`] -- creates, opens, and loads records of one table
//! - [`Record`] -- live document with change trackers and a serialized flush
//! - [`RecordObserver`] -- change and disposal notifications
//! - [`ChangeTracker`] -- pending deltas with Modify squashing
//! - [`PersistConfig`] -- squash window, checkpoint cadence, replay mode
//!
//! # Design Rules
//!
//! 1. At most one flush is in flight per record.
//! 2. A failed write puts its deltas back; nothing is dropped or retried.
//! 3. A checkpoint reflects the state after the deltas written with it.
//! 4. Replay applies each batch all-or-nothing.

pub mod config;
pub mod error;
pub mod log;
pub mod persistence;
pub mod record;
pub mod replay;
pub mod tracker;

pub use config::{PersistConfig, ReplayMode};
pub use error::{PersistError, PersistResult};
pub use log::{frame, Frame, FrameReader};
pub use persistence::Persistence;
pub use record::{Record, RecordObserver};
pub use replay::{replay, Replayed};
pub use tracker::ChangeTracker;
