//! `dependent`: wait for other workflows.
//!
//! ```json
//! {
//!   "relation": "and",
//!   "items": [
//!     { "workflow_id": "ingest" },
//!     { "workflow_id": "billing", "node_id": "close_books", "state": "success" }
//!   ],
//!   "check_interval_ms": 5000
//! }
//! ```
//!
//! Each item looks at the latest instance of the referenced workflow. Without
//! `node_id` the instance state is compared, otherwise the latest attempt of
//! that node. The task polls until the relation is decided.

use std::time::Duration;

use async_trait::async_trait;
use kestrel_config::DependentRelation;
use kestrel_store::{StoreError, TaskState, WorkflowState};
use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{LogicOutcome, LogicTask, LogicTaskContext, LogicTaskPluginFactory};
use crate::error::EngineError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
enum RequiredState {
  #[default]
  Success,
  Failure,
}

#[derive(Debug, Clone, Deserialize)]
struct DependentItem {
  workflow_id: String,
  #[serde(default)]
  node_id: Option<String>,
  #[serde(default)]
  state: RequiredState,
}

#[derive(Debug, Clone, Deserialize)]
struct DependentParams {
  #[serde(default)]
  relation: DependentRelation,
  items: Vec<DependentItem>,
  #[serde(default)]
  check_interval_ms: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Check {
  Satisfied,
  Failed,
  Waiting,
}

pub struct DependentFactory;

impl LogicTaskPluginFactory for DependentFactory {
  fn task_type(&self) -> &str {
    "dependent"
  }

  fn create_logic_task(&self, ctx: LogicTaskContext) -> Result<Box<dyn LogicTask>, EngineError> {
    ctx.workflow_handle()?;
    let params: DependentParams = ctx.params()?;
    if params.items.is_empty() {
      return Err(EngineError::LogicTaskInitialize {
        instance_id: ctx.instance_id.clone(),
        message: format!("dependent node '{}' has no items", ctx.node.node_id),
      });
    }
    let interval = params
      .check_interval_ms
      .unwrap_or(ctx.engine.config.dependent_check_interval_ms)
      .max(1);
    Ok(Box::new(DependentTask {
      ctx,
      params,
      interval: Duration::from_millis(interval),
    }))
  }
}

struct DependentTask {
  ctx: LogicTaskContext,
  params: DependentParams,
  interval: Duration,
}

impl DependentTask {
  async fn check_item(&self, item: &DependentItem) -> Result<Check, StoreError> {
    let store = &self.ctx.engine.store;
    let latest = store
      .list_instances(&item.workflow_id)
      .await?
      .into_iter()
      .filter(|i| i.instance_id != self.ctx.instance_id)
      .next_back();
    let Some(instance) = latest else {
      return Ok(Check::Waiting);
    };

    let Some(node_id) = &item.node_id else {
      return Ok(match (instance.state, item.state) {
        (WorkflowState::Success, RequiredState::Success) => Check::Satisfied,
        (WorkflowState::Failure | WorkflowState::Stop, RequiredState::Failure) => Check::Satisfied,
        (state, _) if state.is_terminal() => Check::Failed,
        _ => Check::Waiting,
      });
    };

    let task = store
      .list_task_instances(&instance.instance_id)
      .await?
      .into_iter()
      .filter(|t| &t.node_id == node_id)
      .next_back();
    let finished = instance.state.is_terminal();
    Ok(match task {
      Some(task) if task.state.is_terminal() => {
        let wanted = match item.state {
          RequiredState::Success => task.state == TaskState::Success,
          RequiredState::Failure => task.state != TaskState::Success,
        };
        if wanted {
          Check::Satisfied
        } else if finished {
          Check::Failed
        } else {
          // A later attempt may still change the outcome.
          Check::Waiting
        }
      }
      _ if finished => Check::Failed,
      _ => Check::Waiting,
    })
  }

  async fn check(&self) -> Result<Check, EngineError> {
    let mut checks = Vec::with_capacity(self.params.items.len());
    for item in &self.params.items {
      match self.check_item(item).await {
        Ok(check) => checks.push(check),
        Err(StoreError::Unavailable { message }) => {
          warn!(
            instance_id = %self.ctx.instance_id,
            node_id = %self.ctx.node.node_id,
            error = %message,
            "dependent_check_store_unavailable"
          );
          checks.push(Check::Waiting);
        }
        Err(e) => return Err(e.into()),
      }
    }
    Ok(combine(self.params.relation, &checks))
  }
}

fn combine(relation: DependentRelation, checks: &[Check]) -> Check {
  match relation {
    DependentRelation::And => {
      if checks.contains(&Check::Failed) {
        Check::Failed
      } else if checks.iter().all(|c| *c == Check::Satisfied) {
        Check::Satisfied
      } else {
        Check::Waiting
      }
    }
    DependentRelation::Or => {
      if checks.contains(&Check::Satisfied) {
        Check::Satisfied
      } else if checks.iter().all(|c| *c == Check::Failed) {
        Check::Failed
      } else {
        Check::Waiting
      }
    }
  }
}

#[async_trait]
impl LogicTask for DependentTask {
  async fn execute(&mut self, cancel: CancellationToken) -> Result<LogicOutcome, EngineError> {
    loop {
      match self.check().await? {
        Check::Satisfied => {
          info!(
            instance_id = %self.ctx.instance_id,
            node_id = %self.ctx.node.node_id,
            "dependency_satisfied"
          );
          return Ok(LogicOutcome::success());
        }
        Check::Failed => {
          return Ok(LogicOutcome::failure(format!(
            "dependencies of '{}' finished in an unexpected state",
            self.ctx.node.node_id
          )));
        }
        Check::Waiting => {
          debug!(
            instance_id = %self.ctx.instance_id,
            node_id = %self.ctx.node.node_id,
            "dependency_waiting"
          );
        }
      }

      tokio::select! {
        _ = cancel.cancelled() => return Ok(LogicOutcome::killed()),
        _ = tokio::time::sleep(self.interval) => {}
      }
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_and_fails_on_any_failure() {
    let checks = [Check::Satisfied, Check::Failed, Check::Waiting];
    assert_eq!(combine(DependentRelation::And, &checks), Check::Failed);
  }

  #[test]
  fn test_and_waits_until_all_satisfied() {
    let checks = [Check::Satisfied, Check::Waiting];
    assert_eq!(combine(DependentRelation::And, &checks), Check::Waiting);
    let checks = [Check::Satisfied, Check::Satisfied];
    assert_eq!(combine(DependentRelation::And, &checks), Check::Satisfied);
  }

  #[test]
  fn test_or_needs_one() {
    let checks = [Check::Failed, Check::Satisfied];
    assert_eq!(combine(DependentRelation::Or, &checks), Check::Satisfied);
    let checks = [Check::Failed, Check::Waiting];
    assert_eq!(combine(DependentRelation::Or, &checks), Check::Waiting);
    let checks = [Check::Failed, Check::Failed];
    assert_eq!(combine(DependentRelation::Or, &checks), Check::Failed);
  }

  #[test]
  fn test_params_defaults() {
    let params: DependentParams = serde_json::from_value(serde_json::json!({
      "items": [{ "workflow_id": "ingest" }]
    }))
    .unwrap();
    assert_eq!(params.relation, DependentRelation::And);
    assert_eq!(params.items[0].state, RequiredState::Success);
    assert!(params.items[0].node_id.is_none());
    assert!(params.check_interval_ms.is_none());
  }
}
