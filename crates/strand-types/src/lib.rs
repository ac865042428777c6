//! Foundation types for strand.
//!
//! Every other strand crate depends on `strand-types`. It defines the
//! in-memory object-graph model the codec serializes, the delta records the
//! persistence layer logs, and the reactive [`Document`] container that
//! produces those deltas.
//!
//! # Key Types
//!
//! - [`Value`] / [`Scalar`] -- primitive values and graph references
//! - [`Graph`] -- arena of compound [`Node`]s addressed by [`NodeId`]
//! - [`Fragment`] -- a self-contained value together with its arena
//! - [`Delta`] -- a path-addressed Insert/Modify/Delete with a [`LogicalTime`]
//! - [`Document`] -- mutation-tracked record instance keyed by a [`RecordId`]
//! - [`Query`] -- equality constraints over document field paths

pub mod clock;
pub mod delta;
pub mod document;
pub mod error;
pub mod graph;
pub mod id;
pub mod path;
pub mod query;
pub mod value;

pub use clock::{LogicalClock, LogicalTime};
pub use delta::{Delta, DeltaOp};
pub use document::Document;
pub use error::{TypeError, TypeResult};
pub use graph::{structurally_equal, tags, Fragment, Graph, Node, NodeData};
pub use id::RecordId;
pub use path::{display_path, parse_path, related, PathSeg};
pub use query::{Constraint, Query};
pub use value::{NodeId, Scalar, Value};
