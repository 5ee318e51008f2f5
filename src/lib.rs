//! Hierarchical intermediate representation for trained computation graphs.
//!
//! The crate centers on [`GraphContainer`], a directed acyclic arena of
//! typed operation vertices with exclusive sub-graph nesting. Around it:
//!
//! * [`trace`] reconstructs a container from a linear call trace,
//! * [`serialize`] persists containers as versioned JSON documents,
//! * [`rewrite`] matches and atomically replaces local vertex motifs,
//! * [`prune`] drops coupled channel groups across the whole graph.

pub mod ir;
pub mod prune;
pub mod rewrite;
pub mod serialize;
pub mod shape;
pub mod trace;

pub use ir::ops::{AnyOp, ChannelRule, Op, OpKind};
pub use ir::{GraphContainer, IrError, PortRef, Vertex, VertexId};
pub use shape::{Shape, ShapeError};
