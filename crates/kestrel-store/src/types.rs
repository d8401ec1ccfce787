use std::collections::HashMap;
use std::fmt;

use chrono::{DateTime, Utc};
use kestrel_config::{FailureStrategy, RunMode};
use kestrel_workflow::Workflow;
use serde::{Deserialize, Serialize};

/// State of a workflow instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowState {
  Submitted,
  Running,
  Pause,
  Success,
  Failure,
  Stop,
}

impl WorkflowState {
  pub fn is_terminal(self) -> bool {
    matches!(
      self,
      WorkflowState::Success | WorkflowState::Failure | WorkflowState::Stop
    )
  }
}

impl fmt::Display for WorkflowState {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let name = match self {
      WorkflowState::Submitted => "SUBMITTED",
      WorkflowState::Running => "RUNNING",
      WorkflowState::Pause => "PAUSE",
      WorkflowState::Success => "SUCCESS",
      WorkflowState::Failure => "FAILURE",
      WorkflowState::Stop => "STOP",
    };
    f.write_str(name)
  }
}

/// State of one task attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
  Submitted,
  Dispatched,
  Running,
  Success,
  Failure,
  Killed,
  Timeout,
}

impl TaskState {
  pub fn is_terminal(self) -> bool {
    matches!(
      self,
      TaskState::Success | TaskState::Failure | TaskState::Killed | TaskState::Timeout
    )
  }

  pub fn is_success(self) -> bool {
    self == TaskState::Success
  }
}

impl fmt::Display for TaskState {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let name = match self {
      TaskState::Submitted => "SUBMITTED",
      TaskState::Dispatched => "DISPATCHED",
      TaskState::Running => "RUNNING",
      TaskState::Success => "SUCCESS",
      TaskState::Failure => "FAILURE",
      TaskState::Killed => "KILLED",
      TaskState::Timeout => "TIMEOUT",
    };
    f.write_str(name)
  }
}

/// Link from a sub-workflow child back to the task that started it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParentRef {
  pub instance_id: String,
  pub task_instance_id: String,
  pub node_id: String,
}

/// A workflow instance as stored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowInstance {
  pub instance_id: String,
  pub workflow_id: String,
  /// Locked definition the instance runs; never changes after creation.
  pub workflow: Workflow,
  pub global_params: HashMap<String, serde_json::Value>,
  /// Variables published by finished tasks.
  #[serde(default)]
  pub var_pool: HashMap<String, serde_json::Value>,
  pub state: WorkflowState,
  pub failure_strategy: FailureStrategy,
  pub run_mode: RunMode,
  /// Master currently responsible for driving the instance.
  pub owner: String,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub parent: Option<ParentRef>,
  /// Set when an internal invariant violation halted the instance.
  #[serde(skip_serializing_if = "Option::is_none")]
  pub halted_reason: Option<String>,
  pub created_at: DateTime<Utc>,
  pub started_at: Option<DateTime<Utc>>,
  pub ended_at: Option<DateTime<Utc>>,
}

/// One attempt of a node as stored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskInstance {
  pub task_instance_id: String,
  pub instance_id: String,
  pub node_id: String,
  pub task_type: String,
  /// 1-based attempt number.
  pub attempt: u32,
  pub state: TaskState,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub worker: Option<String>,
  pub submitted_at: DateTime<Utc>,
  pub started_at: Option<DateTime<Utc>>,
  pub ended_at: Option<DateTime<Utc>>,
  pub exit_code: Option<i32>,
  #[serde(default)]
  pub outputs: HashMap<String, serde_json::Value>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub error: Option<String>,
  /// Downstream nodes a branch decision of this attempt cut off.
  #[serde(default, skip_serializing_if = "Vec::is_empty")]
  pub pruned: Vec<String>,
}
