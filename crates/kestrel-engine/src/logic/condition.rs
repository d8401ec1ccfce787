//! `conditions`: branch on how upstream nodes ended.
//!
//! ```json
//! {
//!   "relation": "and",
//!   "conditions": [{ "node": "extract", "state": "success" }],
//!   "success_next": ["load"],
//!   "failure_next": ["alert"]
//! }
//! ```
//!
//! The node itself always succeeds; the branch that was not taken is pruned.

use async_trait::async_trait;
use kestrel_config::DependentRelation;
use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use tracing::info;

use super::{LogicOutcome, LogicTask, LogicTaskContext, LogicTaskPluginFactory};
use crate::error::EngineError;
use crate::repository::WorkflowHandle;
use crate::scheduler::NodeState;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
enum ExpectedOutcome {
  Success,
  Failure,
}

#[derive(Debug, Clone, Deserialize)]
struct ConditionItem {
  node: String,
  state: ExpectedOutcome,
}

#[derive(Debug, Clone, Deserialize)]
struct ConditionParams {
  #[serde(default)]
  relation: DependentRelation,
  conditions: Vec<ConditionItem>,
  #[serde(default)]
  success_next: Vec<String>,
  #[serde(default)]
  failure_next: Vec<String>,
}

pub struct ConditionsFactory;

impl LogicTaskPluginFactory for ConditionsFactory {
  fn task_type(&self) -> &str {
    "conditions"
  }

  fn create_logic_task(&self, ctx: LogicTaskContext) -> Result<Box<dyn LogicTask>, EngineError> {
    let handle = ctx.workflow_handle()?;
    let params = ctx.params()?;
    Ok(Box::new(ConditionsTask {
      ctx,
      handle,
      params,
    }))
  }
}

struct ConditionsTask {
  ctx: LogicTaskContext,
  handle: WorkflowHandle,
  params: ConditionParams,
}

impl ConditionsTask {
  fn holds(&self, item: &ConditionItem) -> Result<bool, EngineError> {
    match self.handle.node_state(&item.node) {
      Some(NodeState::Succeeded) => Ok(item.state == ExpectedOutcome::Success),
      Some(NodeState::Failed) => Ok(item.state == ExpectedOutcome::Failure),
      Some(NodeState::Skipped) => Ok(false),
      Some(state) => Err(self.ctx.logic_error(format!(
        "condition node '{}' has not finished (state {state:?})",
        item.node
      ))),
      None => Err(
        self
          .ctx
          .logic_error(format!("condition references unknown node '{}'", item.node)),
      ),
    }
  }
}

#[async_trait]
impl LogicTask for ConditionsTask {
  async fn execute(&mut self, _cancel: CancellationToken) -> Result<LogicOutcome, EngineError> {
    let results = self
      .params
      .conditions
      .iter()
      .map(|item| self.holds(item))
      .collect::<Result<Vec<bool>, _>>()?;

    let passed = match self.params.relation {
      DependentRelation::And => results.iter().all(|r| *r),
      DependentRelation::Or => results.iter().any(|r| *r),
    };

    let taken = if passed {
      &self.params.success_next
    } else {
      &self.params.failure_next
    };
    let pruned = self.ctx.prune_all_but(taken)?;
    // The other list must name downstream nodes as well.
    let other = if passed {
      &self.params.failure_next
    } else {
      &self.params.success_next
    };
    self.ctx.prune_all_but(other)?;

    info!(
      instance_id = %self.ctx.instance_id,
      node_id = %self.ctx.node.node_id,
      passed,
      "conditions_evaluated"
    );

    Ok(LogicOutcome::success().with_pruned(pruned))
  }
}
