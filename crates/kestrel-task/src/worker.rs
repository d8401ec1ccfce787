use std::collections::HashMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::DispatchError;
use crate::types::TaskExecutionContext;

/// What the fleet knows about an attempt, used to reconcile after failover.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum WorkerTaskStatus {
  /// A live worker is still processing the attempt.
  Running { worker: String },
  Finished {
    exit_code: i32,
    outputs: HashMap<String, serde_json::Value>,
  },
  /// No live worker knows the attempt.
  Unknown,
  /// The assigned worker is gone.
  WorkerDead,
}

/// Master side of the worker transport.
#[async_trait]
pub trait WorkerClient: Send + Sync {
  /// Hand an attempt to a worker and return that worker's id.
  ///
  /// Must not wait for the attempt to run.
  async fn dispatch(&self, ctx: TaskExecutionContext) -> Result<String, DispatchError>;

  /// Ask the worker to cancel an attempt. Unknown attempts are ignored.
  ///
  /// `worker` is `None` when the attempt was never acknowledged.
  async fn kill(&self, worker: Option<&str>, task_instance_id: &str) -> Result<(), DispatchError>;

  /// Ask the fleet for the real status of an attempt.
  async fn query(
    &self,
    worker: Option<&str>,
    task_instance_id: &str,
  ) -> Result<WorkerTaskStatus, DispatchError>;
}
