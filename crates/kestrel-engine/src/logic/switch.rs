//! `switch`: take the first branch whose expression holds.
//!
//! ```json
//! {
//!   "cases": [
//!     { "expression": "rows > 1000", "next": "bulk_load" },
//!     { "expression": "mode == 'full'", "next": "full_load" }
//!   ],
//!   "default_next": "incremental_load"
//! }
//! ```
//!
//! Expressions are minijinja expressions over the instance variables. Every
//! direct downstream node other than the taken one is pruned.

use std::collections::HashMap;

use async_trait::async_trait;
use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use tracing::info;

use super::{LogicOutcome, LogicTask, LogicTaskContext, LogicTaskPluginFactory};
use crate::error::EngineError;
use crate::params::strict_environment;
use crate::repository::WorkflowHandle;

#[derive(Debug, Clone, Deserialize)]
struct SwitchParams {
  cases: Vec<SwitchCase>,
  #[serde(default)]
  default_next: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct SwitchCase {
  expression: String,
  next: String,
}

pub struct SwitchFactory;

impl LogicTaskPluginFactory for SwitchFactory {
  fn task_type(&self) -> &str {
    "switch"
  }

  fn create_logic_task(&self, ctx: LogicTaskContext) -> Result<Box<dyn LogicTask>, EngineError> {
    let handle = ctx.workflow_handle()?;
    let params = ctx.params()?;
    Ok(Box::new(SwitchTask {
      ctx,
      handle,
      params,
    }))
  }
}

struct SwitchTask {
  ctx: LogicTaskContext,
  handle: WorkflowHandle,
  params: SwitchParams,
}

#[async_trait]
impl LogicTask for SwitchTask {
  async fn execute(&mut self, _cancel: CancellationToken) -> Result<LogicOutcome, EngineError> {
    let variables = self.handle.variables();

    let mut taken = None;
    for case in &self.params.cases {
      if evaluate(&self.ctx, &case.expression, &variables)? {
        taken = Some(case.next.clone());
        break;
      }
    }

    let next = taken
      .or_else(|| self.params.default_next.clone())
      .ok_or_else(|| self.ctx.logic_error("no case matched and no default_next is set"))?;
    let pruned = self.ctx.prune_all_but(std::slice::from_ref(&next))?;

    info!(
      instance_id = %self.ctx.instance_id,
      node_id = %self.ctx.node.node_id,
      next = %next,
      "switch_branch_taken"
    );

    Ok(LogicOutcome::success().with_pruned(pruned))
  }
}

/// Evaluate a branch expression; referencing an undefined variable is an error.
pub(crate) fn evaluate(
  ctx: &LogicTaskContext,
  expression: &str,
  variables: &HashMap<String, serde_json::Value>,
) -> Result<bool, EngineError> {
  let env = strict_environment();
  let source = format!("{{% if {expression} %}}true{{% else %}}false{{% endif %}}");
  let template = env
    .template_from_str(&source)
    .map_err(|e| ctx.logic_error(format!("invalid expression '{expression}': {e}")))?;

  let mut undefined: Vec<String> = template
    .undeclared_variables(false)
    .into_iter()
    .filter(|name| !variables.contains_key(name))
    .collect();
  if !undefined.is_empty() {
    undefined.sort();
    return Err(ctx.logic_error(format!(
      "expression '{expression}' references undefined variable(s): {}",
      undefined.join(", ")
    )));
  }

  let rendered = template
    .render(variables)
    .map_err(|e| ctx.logic_error(format!("failed to evaluate '{expression}': {e}")))?;
  Ok(rendered == "true")
}
