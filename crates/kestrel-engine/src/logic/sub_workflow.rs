//! `sub_workflow`: run an inline workflow as a child instance.
//!
//! ```json
//! {
//!   "workflow": { "workflow_id": "load", "name": "Load", "tasks": [...], "edges": [...] },
//!   "params": { "day": "{{ day }}" }
//! }
//! ```
//!
//! The child sees the parent's variables overlaid with the resolved `params`
//! and runs under the parent's failure strategy. Its var pool becomes this
//! node's outputs. Children are not admitted through the concurrency gate.

use async_trait::async_trait;
use kestrel_config::{RunMode, WorkflowDef};
use kestrel_store::{ParentRef, WorkflowState};
use kestrel_workflow::Workflow;
use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::{LogicOutcome, LogicTask, LogicTaskContext, LogicTaskPluginFactory};
use crate::error::EngineError;
use crate::message::Command;
use crate::params::resolve_params;
use crate::repository::WorkflowHandle;

#[derive(Debug, Clone, Deserialize)]
struct SubWorkflowParams {
  workflow: WorkflowDef,
  #[serde(default)]
  params: serde_json::Map<String, serde_json::Value>,
}

pub struct SubWorkflowFactory;

impl LogicTaskPluginFactory for SubWorkflowFactory {
  fn task_type(&self) -> &str {
    "sub_workflow"
  }

  fn create_logic_task(&self, ctx: LogicTaskContext) -> Result<Box<dyn LogicTask>, EngineError> {
    let parent = ctx.workflow_handle()?;
    let params: SubWorkflowParams = ctx.params()?;
    let workflow =
      Workflow::lock(params.workflow).map_err(|e| EngineError::LogicTaskInitialize {
        instance_id: ctx.instance_id.clone(),
        message: format!("invalid sub workflow in node '{}': {e}", ctx.node.node_id),
      })?;
    Ok(Box::new(SubWorkflowTask {
      ctx,
      parent,
      workflow,
      params: params.params,
    }))
  }
}

struct SubWorkflowTask {
  ctx: LogicTaskContext,
  parent: WorkflowHandle,
  workflow: Workflow,
  params: serde_json::Map<String, serde_json::Value>,
}

enum Child {
  Live(WorkflowHandle),
  Finished { instance_id: String, state: WorkflowState },
}

impl SubWorkflowTask {
  /// Reattach to a child started by this task instance, or start one.
  async fn child(&self) -> Result<Child, EngineError> {
    let engine = &self.ctx.engine;
    if let Some(existing) = engine
      .store
      .find_child_instance(&self.ctx.task_instance_id)
      .await?
    {
      if existing.state.is_terminal() {
        return Ok(Child::Finished {
          instance_id: existing.instance_id,
          state: existing.state,
        });
      }
      if let Some(handle) = engine.repository.get(&existing.instance_id) {
        return Ok(Child::Live(handle));
      }
      info!(
        instance_id = %self.ctx.instance_id,
        child_instance_id = %existing.instance_id,
        "sub_workflow_reattaching"
      );
      return Ok(Child::Live(engine.recover_instance(existing).await?));
    }

    let view = self.parent.view();
    let mut globals = view.variables();
    let resolved = resolve_params(
      &self.ctx.node.node_id,
      &serde_json::Value::Object(self.params.clone()),
      &globals,
    )?;
    if let serde_json::Value::Object(resolved) = resolved {
      globals.extend(resolved);
    }

    let instance = engine.new_instance(
      self.workflow.clone(),
      globals,
      view.failure_strategy,
      RunMode::Serial,
      Some(ParentRef {
        instance_id: self.ctx.instance_id.clone(),
        task_instance_id: self.ctx.task_instance_id.clone(),
        node_id: self.ctx.node.node_id.clone(),
      }),
    );
    info!(
      instance_id = %self.ctx.instance_id,
      child_instance_id = %instance.instance_id,
      workflow_id = %instance.workflow_id,
      "sub_workflow_started"
    );
    Ok(Child::Live(engine.submit(instance, false, None).await?))
  }

  async fn outcome(&self, instance_id: &str, state: WorkflowState) -> Result<LogicOutcome, EngineError> {
    if state != WorkflowState::Success {
      return Ok(LogicOutcome::failure(format!(
        "sub workflow {instance_id} finished in {state}"
      )));
    }
    let child = self.ctx.engine.store.get_instance(instance_id).await?;
    Ok(LogicOutcome::success().with_outputs(child.var_pool))
  }
}

#[async_trait]
impl LogicTask for SubWorkflowTask {
  async fn execute(&mut self, cancel: CancellationToken) -> Result<LogicOutcome, EngineError> {
    let handle = match self.child().await? {
      Child::Finished { instance_id, state } => return self.outcome(&instance_id, state).await,
      Child::Live(handle) => handle,
    };

    tokio::select! {
      state = handle.wait() => self.outcome(handle.instance_id(), state).await,
      _ = cancel.cancelled() => {
        if !self.ctx.engine.shutdown.is_cancelled() {
          if let Err(e) = handle.command(Command::Stop).await {
            warn!(
              instance_id = %self.ctx.instance_id,
              child_instance_id = %handle.instance_id(),
              error = %e,
              "sub_workflow_stop_failed"
            );
          }
          handle.wait().await;
        }
        Ok(LogicOutcome::killed())
      }
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_params_parse_inline_workflow() {
    let params: SubWorkflowParams = serde_json::from_value(serde_json::json!({
      "workflow": {
        "workflow_id": "child",
        "name": "Child",
        "tasks": [{ "node_id": "a", "type": "shell", "params": { "command": "true" } }]
      },
      "params": { "day": "{{ day }}" }
    }))
    .unwrap();
    assert_eq!(params.workflow.workflow_id, "child");
    assert_eq!(params.params["day"], "{{ day }}");
  }
}
