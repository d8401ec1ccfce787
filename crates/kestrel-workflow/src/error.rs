use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WorkflowError {
  #[error("workflow '{workflow_id}' has no tasks")]
  Empty { workflow_id: String },

  #[error("duplicate node id: {0}")]
  DuplicateNode(String),

  #[error("node not found: {0}")]
  NodeNotFound(String),

  #[error("edge references unknown node: from={from}, to={to}")]
  InvalidEdge { from: String, to: String },

  #[error("duplicate edge: from={from}, to={to}")]
  DuplicateEdge { from: String, to: String },

  #[error("no entry points found (all nodes have incoming edges)")]
  NoEntryPoints,

  #[error("cycle detected involving nodes: {}", nodes.join(", "))]
  CycleDetected { nodes: Vec<String> },
}
