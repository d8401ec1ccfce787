use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

/// Progress report for one attempt, sent by the worker transport.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskEvent {
  pub instance_id: String,
  pub task_instance_id: String,
  pub kind: TaskEventKind,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TaskEventKind {
  /// The worker accepted the attempt.
  Ack { worker: String },
  /// The payload started running.
  Running,
  /// The payload finished; non-zero exit codes are failures.
  Result {
    exit_code: i32,
    #[serde(default)]
    outputs: HashMap<String, serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
  },
  /// The worker enforced the timeout itself.
  Timeout,
  /// The worker confirmed a kill.
  Killed,
}

impl TaskEvent {
  pub fn new(
    instance_id: impl Into<String>,
    task_instance_id: impl Into<String>,
    kind: TaskEventKind,
  ) -> Self {
    Self {
      instance_id: instance_id.into(),
      task_instance_id: task_instance_id.into(),
      kind,
    }
  }
}

/// Channel carrying worker events into the engine.
pub fn task_event_channel(buffer: usize) -> (mpsc::Sender<TaskEvent>, mpsc::Receiver<TaskEvent>) {
  mpsc::channel(buffer)
}
