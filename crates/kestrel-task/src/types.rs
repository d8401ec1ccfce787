use std::collections::HashMap;

use serde::{Deserialize, Serialize};

pub const EXIT_CODE_SUCCESS: i32 = 0;
pub const EXIT_CODE_FAILURE: i32 = -1;
pub const EXIT_CODE_KILL: i32 = 137;

/// Everything a worker needs to run one attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskExecutionContext {
  pub instance_id: String,
  pub task_instance_id: String,
  pub node_id: String,
  pub task_type: String,
  pub attempt: u32,
  /// Parameters after template resolution.
  pub params: serde_json::Value,
  /// Global parameters and upstream variables visible to the task.
  pub variables: HashMap<String, serde_json::Value>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub timeout_ms: Option<u64>,
}
