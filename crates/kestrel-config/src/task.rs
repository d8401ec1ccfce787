use serde::{Deserialize, Serialize};

use crate::enums::TimeoutStrategy;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskDef {
  pub node_id: String,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub name: Option<String>,
  /// Plugin key, e.g. `shell`, `switch`, `sub_workflow`.
  #[serde(rename = "type")]
  pub task_type: String,
  /// Task specific parameters, opaque to the scheduler.
  #[serde(default)]
  pub params: serde_json::Value,
  #[serde(default)]
  pub priority: i32,
  #[serde(default)]
  pub retry: RetryPolicy,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub timeout: Option<TimeoutPolicy>,
}

impl TaskDef {
  pub fn new(node_id: impl Into<String>, task_type: impl Into<String>) -> Self {
    Self {
      node_id: node_id.into(),
      name: None,
      task_type: task_type.into(),
      params: serde_json::Value::Null,
      priority: 0,
      retry: RetryPolicy::default(),
      timeout: None,
    }
  }

  pub fn with_params(mut self, params: serde_json::Value) -> Self {
    self.params = params;
    self
  }

  pub fn with_priority(mut self, priority: i32) -> Self {
    self.priority = priority;
    self
  }

  pub fn with_retry(mut self, max_retries: u32, interval_ms: u64) -> Self {
    self.retry = RetryPolicy {
      max_retries,
      interval_ms,
    };
    self
  }

  pub fn with_timeout(mut self, timeout_ms: u64, strategy: TimeoutStrategy) -> Self {
    self.timeout = Some(TimeoutPolicy {
      timeout_ms,
      strategy,
    });
    self
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RetryPolicy {
  /// Attempts allowed after the first one.
  #[serde(default)]
  pub max_retries: u32,
  /// Delay before a retry is dispatched.
  #[serde(default)]
  pub interval_ms: u64,
}

impl RetryPolicy {
  pub fn max_attempts(&self) -> u32 {
    self.max_retries + 1
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeoutPolicy {
  pub timeout_ms: u64,
  #[serde(default)]
  pub strategy: TimeoutStrategy,
}
