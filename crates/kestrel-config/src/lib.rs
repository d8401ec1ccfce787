//! Kestrel Config
//!
//! Serializable configuration types for Kestrel. These represent workflow
//! definitions as submitted by a trigger, before they are validated and
//! locked into a `kestrel_workflow::Workflow`, plus the settings that tune a
//! master process.
//!
//! Definitions can be loaded from:
//! - JSON files (via CLI with `kestrel run workflow.json`)
//! - The store (embedded as JSON in a persisted instance)

mod edge;
mod enums;
mod master;
mod task;
mod workflow;

pub use edge::Edge;
pub use enums::{DependentRelation, FailureStrategy, RunMode, TimeoutStrategy};
pub use master::{ConfigError, MasterConfig};
pub use task::{RetryPolicy, TaskDef, TimeoutPolicy};
pub use workflow::WorkflowDef;
