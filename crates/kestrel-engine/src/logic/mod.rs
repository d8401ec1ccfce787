//! Logic tasks: task types executed inside the master.
//!
//! A logic task needs the live state of its own instance (variables, node
//! states) or of the engine (store, other instances), so it is not sent to a
//! worker. Each task type is served by a [`LogicTaskPluginFactory`] looked
//! up by type key in the [`LogicTaskRegistry`] when an attempt is built.
//!
//! Building a logic task resolves the owning instance through the
//! [`WorkflowRepository`](crate::WorkflowRepository); an instance that is not
//! registered cannot have logic tasks.

mod condition;
mod dependent;
mod sub_workflow;
mod switch;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use kestrel_store::TaskState;
use kestrel_workflow::TaskNode;
use serde::de::DeserializeOwned;
use tokio_util::sync::CancellationToken;

pub use condition::ConditionsFactory;
pub use dependent::DependentFactory;
pub use sub_workflow::SubWorkflowFactory;
pub use switch::SwitchFactory;

use crate::engine::EngineContext;
use crate::error::EngineError;
use crate::repository::WorkflowHandle;

/// How a logic task ended.
#[derive(Debug, Clone, PartialEq)]
pub struct LogicOutcome {
  /// `Success`, `Failure` or `Killed`.
  pub state: TaskState,
  pub outputs: HashMap<String, serde_json::Value>,
  /// Direct downstream nodes cut off by a branch decision.
  pub pruned: Vec<String>,
  pub message: Option<String>,
}

impl LogicOutcome {
  pub fn success() -> Self {
    Self {
      state: TaskState::Success,
      outputs: HashMap::new(),
      pruned: Vec::new(),
      message: None,
    }
  }

  pub fn failure(message: impl Into<String>) -> Self {
    Self {
      state: TaskState::Failure,
      message: Some(message.into()),
      ..Self::success()
    }
  }

  pub fn killed() -> Self {
    Self {
      state: TaskState::Killed,
      ..Self::success()
    }
  }

  pub fn with_pruned(mut self, pruned: Vec<String>) -> Self {
    self.pruned = pruned;
    self
  }

  pub fn with_outputs(mut self, outputs: HashMap<String, serde_json::Value>) -> Self {
    self.outputs = outputs;
    self
  }
}

/// A task executed inside the master.
#[async_trait]
pub trait LogicTask: Send {
  /// Run to completion. Cancellation must end the task with
  /// [`LogicOutcome::killed`]; errors fail the node.
  async fn execute(&mut self, cancel: CancellationToken) -> Result<LogicOutcome, EngineError>;
}

/// Everything a factory gets to build one attempt.
#[derive(Clone)]
pub struct LogicTaskContext {
  pub instance_id: String,
  pub task_instance_id: String,
  pub node: TaskNode,
  pub attempt: u32,
  pub engine: Arc<EngineContext>,
}

impl LogicTaskContext {
  /// Resolve the handle of the owning instance.
  pub fn workflow_handle(&self) -> Result<WorkflowHandle, EngineError> {
    self
      .engine
      .repository
      .get(&self.instance_id)
      .ok_or_else(|| EngineError::LogicTaskInitialize {
        instance_id: self.instance_id.clone(),
        message: format!(
          "cannot find the workflow execution runnable by: {}",
          self.instance_id
        ),
      })
  }

  /// Deserialize the node's params.
  pub fn params<T: DeserializeOwned>(&self) -> Result<T, EngineError> {
    serde_json::from_value(self.node.params.clone()).map_err(|e| EngineError::LogicTaskInitialize {
      instance_id: self.instance_id.clone(),
      message: format!("invalid params for node '{}': {e}", self.node.node_id),
    })
  }

  pub(crate) fn logic_error(&self, message: impl Into<String>) -> EngineError {
    EngineError::Logic {
      node_id: self.node.node_id.clone(),
      message: message.into(),
    }
  }

  /// Check a branch target list and return the downstream nodes it leaves out.
  pub(crate) fn prune_all_but(&self, taken: &[String]) -> Result<Vec<String>, EngineError> {
    if let Some(unknown) = taken.iter().find(|n| !self.node.downstream.contains(*n)) {
      return Err(self.logic_error(format!(
        "branch target '{unknown}' is not a downstream node of '{}'",
        self.node.node_id
      )));
    }
    Ok(
      self
        .node
        .downstream
        .iter()
        .filter(|n| !taken.contains(n))
        .cloned()
        .collect(),
    )
  }
}

/// Builds logic tasks of one type.
pub trait LogicTaskPluginFactory: Send + Sync {
  fn task_type(&self) -> &str;

  fn create_logic_task(&self, ctx: LogicTaskContext) -> Result<Box<dyn LogicTask>, EngineError>;
}

/// Task type key to logic task factory.
#[derive(Clone)]
pub struct LogicTaskRegistry {
  factories: HashMap<String, Arc<dyn LogicTaskPluginFactory>>,
}

impl LogicTaskRegistry {
  /// A registry without any logic task types.
  pub fn empty() -> Self {
    Self {
      factories: HashMap::new(),
    }
  }

  pub fn register(&mut self, factory: Arc<dyn LogicTaskPluginFactory>) {
    self
      .factories
      .insert(factory.task_type().to_string(), factory);
  }

  pub fn get(&self, task_type: &str) -> Option<Arc<dyn LogicTaskPluginFactory>> {
    self.factories.get(task_type).cloned()
  }

  pub fn contains(&self, task_type: &str) -> bool {
    self.factories.contains_key(task_type)
  }
}

impl Default for LogicTaskRegistry {
  /// `switch`, `conditions`, `dependent` and `sub_workflow`.
  fn default() -> Self {
    let mut registry = Self::empty();
    registry.register(Arc::new(SwitchFactory));
    registry.register(Arc::new(ConditionsFactory));
    registry.register(Arc::new(DependentFactory));
    registry.register(Arc::new(SubWorkflowFactory));
    registry
  }
}
