//! Process-wide registry of running instances.
//!
//! The repository holds [`WorkflowHandle`]s, not runnables: a handle can
//! send into the instance's queue and read a snapshot of its state, but the
//! runnable's task stays the only owner of the instance. Lookups take a read
//! lock; registration and removal take the write lock.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use kestrel_config::FailureStrategy;
use kestrel_store::WorkflowState;
use kestrel_workflow::Workflow;
use tokio::sync::{mpsc, watch};

use crate::error::EngineError;
use crate::message::{Command, WorkflowEvent};
use crate::scheduler::NodeState;

/// Read-only snapshot of an instance, refreshed by its runnable.
#[derive(Debug, Clone)]
pub struct InstanceView {
  pub workflow: Arc<Workflow>,
  pub global_params: HashMap<String, serde_json::Value>,
  pub var_pool: HashMap<String, serde_json::Value>,
  pub node_states: HashMap<String, NodeState>,
  pub failure_strategy: FailureStrategy,
}

impl InstanceView {
  /// Global parameters overlaid with the var pool.
  pub fn variables(&self) -> HashMap<String, serde_json::Value> {
    let mut variables = self.global_params.clone();
    variables.extend(self.var_pool.clone());
    variables
  }
}

/// Non-owning reference to a running instance.
#[derive(Clone)]
pub struct WorkflowHandle {
  instance_id: String,
  sender: mpsc::Sender<WorkflowEvent>,
  state: watch::Receiver<WorkflowState>,
  view: Arc<RwLock<InstanceView>>,
}

impl WorkflowHandle {
  pub(crate) fn new(
    instance_id: String,
    sender: mpsc::Sender<WorkflowEvent>,
    state: watch::Receiver<WorkflowState>,
    view: Arc<RwLock<InstanceView>>,
  ) -> Self {
    Self {
      instance_id,
      sender,
      state,
      view,
    }
  }

  pub fn instance_id(&self) -> &str {
    &self.instance_id
  }

  /// Last state the instance persisted.
  pub fn state(&self) -> WorkflowState {
    *self.state.borrow()
  }

  pub fn view(&self) -> InstanceView {
    self
      .view
      .read()
      .unwrap_or_else(PoisonError::into_inner)
      .clone()
  }

  pub fn variables(&self) -> HashMap<String, serde_json::Value> {
    self
      .view
      .read()
      .unwrap_or_else(PoisonError::into_inner)
      .variables()
  }

  pub fn node_state(&self, node_id: &str) -> Option<NodeState> {
    self
      .view
      .read()
      .unwrap_or_else(PoisonError::into_inner)
      .node_states
      .get(node_id)
      .copied()
  }

  pub async fn command(&self, command: Command) -> Result<(), EngineError> {
    self.send(WorkflowEvent::Command(command)).await
  }

  pub(crate) async fn send(&self, event: WorkflowEvent) -> Result<(), EngineError> {
    self
      .sender
      .send(event)
      .await
      .map_err(|_| EngineError::InstanceNotFound {
        instance_id: self.instance_id.clone(),
      })
  }

  /// Resolves once the runnable dropped its queue.
  pub(crate) async fn closed(&self) {
    self.sender.closed().await
  }

  /// Send without waiting; dropped when the queue is full.
  pub(crate) fn try_send(&self, event: WorkflowEvent) -> bool {
    self.sender.try_send(event).is_ok()
  }

  /// Wait until the instance reaches a persisted terminal state.
  ///
  /// If the runnable goes away first (engine shutdown) the last known state
  /// is returned.
  pub async fn wait(&self) -> WorkflowState {
    let mut state = self.state.clone();
    let reached = match state.wait_for(|s| s.is_terminal()).await {
      Ok(s) => Some(*s),
      Err(_) => None,
    };
    reached.unwrap_or_else(|| *state.borrow())
  }
}

/// Instance id to handle.
#[derive(Clone, Default)]
pub struct WorkflowRepository {
  handles: Arc<RwLock<HashMap<String, WorkflowHandle>>>,
}

impl WorkflowRepository {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn register(&self, handle: WorkflowHandle) -> Result<(), EngineError> {
    let mut handles = self.handles.write().unwrap_or_else(PoisonError::into_inner);
    if handles.contains_key(handle.instance_id()) {
      return Err(EngineError::AlreadyRegistered {
        instance_id: handle.instance_id().to_string(),
      });
    }
    handles.insert(handle.instance_id().to_string(), handle);
    Ok(())
  }

  pub fn get(&self, instance_id: &str) -> Option<WorkflowHandle> {
    self
      .handles
      .read()
      .unwrap_or_else(PoisonError::into_inner)
      .get(instance_id)
      .cloned()
  }

  pub fn remove(&self, instance_id: &str) -> Option<WorkflowHandle> {
    self
      .handles
      .write()
      .unwrap_or_else(PoisonError::into_inner)
      .remove(instance_id)
  }

  pub fn contains(&self, instance_id: &str) -> bool {
    self
      .handles
      .read()
      .unwrap_or_else(PoisonError::into_inner)
      .contains_key(instance_id)
  }

  pub fn handles(&self) -> Vec<WorkflowHandle> {
    self
      .handles
      .read()
      .unwrap_or_else(PoisonError::into_inner)
      .values()
      .cloned()
      .collect()
  }

  pub fn len(&self) -> usize {
    self
      .handles
      .read()
      .unwrap_or_else(PoisonError::into_inner)
      .len()
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use kestrel_config::{TaskDef, WorkflowDef};

  fn handle(id: &str) -> (WorkflowHandle, mpsc::Receiver<WorkflowEvent>, watch::Sender<WorkflowState>) {
    let workflow = Workflow::lock(WorkflowDef {
      workflow_id: "wf".to_string(),
      name: "wf".to_string(),
      global_params: HashMap::new(),
      tasks: vec![TaskDef::new("a", "shell")],
      edges: vec![],
    })
    .unwrap();
    let (tx, rx) = mpsc::channel(4);
    let (state_tx, state_rx) = watch::channel(WorkflowState::Submitted);
    let view = InstanceView {
      workflow: Arc::new(workflow),
      global_params: HashMap::from([("a".to_string(), serde_json::json!(1))]),
      var_pool: HashMap::from([("a".to_string(), serde_json::json!(2))]),
      node_states: HashMap::new(),
      failure_strategy: FailureStrategy::ContinueOnFailure,
    };
    (
      WorkflowHandle::new(id.to_string(), tx, state_rx, Arc::new(RwLock::new(view))),
      rx,
      state_tx,
    )
  }

  #[test]
  fn test_register_get_remove() {
    let repo = WorkflowRepository::new();
    let (h, _rx, _state) = handle("i1");
    repo.register(h.clone()).unwrap();
    assert!(matches!(
      repo.register(h),
      Err(EngineError::AlreadyRegistered { .. })
    ));

    assert!(repo.get("i1").is_some());
    assert!(repo.get("i2").is_none());
    assert_eq!(repo.len(), 1);

    assert!(repo.remove("i1").is_some());
    assert!(repo.is_empty());
  }

  #[test]
  fn test_var_pool_overrides_globals() {
    let (h, _rx, _state) = handle("i1");
    assert_eq!(h.variables().get("a"), Some(&serde_json::json!(2)));
  }

  #[tokio::test]
  async fn test_wait_returns_terminal_state() {
    let (h, _rx, state) = handle("i1");
    let waiter = tokio::spawn(async move { h.wait().await });
    state.send(WorkflowState::Running).unwrap();
    state.send(WorkflowState::Success).unwrap();
    assert_eq!(waiter.await.unwrap(), WorkflowState::Success);
  }

  #[tokio::test]
  async fn test_concurrent_lookups() {
    let repo = WorkflowRepository::new();
    for i in 0..8 {
      let (h, _rx, _state) = handle(&format!("i{i}"));
      repo.register(h).unwrap();
    }
    let lookups: Vec<_> = (0..8)
      .map(|i| {
        let repo = repo.clone();
        tokio::spawn(async move { repo.get(&format!("i{i}")).is_some() })
      })
      .collect();
    for lookup in lookups {
      assert!(lookup.await.unwrap());
    }
  }
}
