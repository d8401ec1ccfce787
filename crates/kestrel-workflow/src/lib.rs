//! Kestrel Workflow
//!
//! This crate provides the "locked" workflow representation for Kestrel.
//! A locked workflow is the validated form of a `WorkflowDef` that an
//! instance is started from and that never changes afterwards.
//!
//! Key differences from `kestrel-config`:
//! - Node ids are unique and every edge references a known node
//! - The graph is acyclic and has at least one entry point
//! - Upstream and downstream sets are derived per node
//! - Traversal order is deterministic (sorted by node id)

mod error;
mod graph;
mod node;
mod workflow;

pub use error::WorkflowError;
pub use graph::Graph;
pub use node::TaskNode;
pub use workflow::Workflow;
