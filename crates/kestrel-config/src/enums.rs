use std::fmt;

use serde::{Deserialize, Serialize};

/// What an instance does once a task has exhausted its retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureStrategy {
  /// Stop dispatching, drain in-flight tasks, end in `FAILURE`.
  EndOnFailure,
  /// Keep every branch going; end in `FAILURE` if any node failed.
  #[default]
  ContinueOnFailure,
}

impl fmt::Display for FailureStrategy {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      FailureStrategy::EndOnFailure => f.write_str("end_on_failure"),
      FailureStrategy::ContinueOnFailure => f.write_str("continue_on_failure"),
    }
  }
}

/// How the sub-runs of a backfill submission are executed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunMode {
  #[default]
  Serial,
  Parallel,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimeoutStrategy {
  /// Log once and let the task keep running.
  #[default]
  Warn,
  /// Kill the task and end the attempt as timed out.
  Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DependentRelation {
  #[default]
  And,
  Or,
}
