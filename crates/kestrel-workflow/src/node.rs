use std::collections::BTreeSet;

use kestrel_config::{RetryPolicy, TaskDef, TimeoutPolicy};
use serde::{Deserialize, Serialize};

/// A node of a locked workflow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskNode {
  pub node_id: String,
  pub name: String,
  pub task_type: String,
  pub params: serde_json::Value,
  pub priority: i32,
  pub retry: RetryPolicy,
  pub timeout: Option<TimeoutPolicy>,
  pub upstream: BTreeSet<String>,
  pub downstream: BTreeSet<String>,
}

impl TaskNode {
  pub(crate) fn from_def(def: TaskDef) -> Self {
    Self {
      name: def.name.unwrap_or_else(|| def.node_id.clone()),
      node_id: def.node_id,
      task_type: def.task_type,
      params: def.params,
      priority: def.priority,
      retry: def.retry,
      timeout: def.timeout,
      upstream: BTreeSet::new(),
      downstream: BTreeSet::new(),
    }
  }
}
