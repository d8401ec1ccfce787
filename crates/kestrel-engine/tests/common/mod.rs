//! Shared fixtures: a scripted worker and an engine harness.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use kestrel_config::{Edge, FailureStrategy, MasterConfig, RunMode, TaskDef, WorkflowDef};
use kestrel_engine::{
  ChannelNotifier, EngineBuilder, ExecutionEvent, LogicTaskPluginFactory, WorkflowEngine,
};
use kestrel_store::{MemoryStore, WorkflowState};
use kestrel_task::{
  DispatchError, TaskEvent, TaskEventKind, TaskExecutionContext, WorkerClient, WorkerTaskStatus,
  task_event_channel,
};
use tokio::sync::{Notify, mpsc};

pub const WAIT: Duration = Duration::from_secs(10);

/// How the scripted worker answers a dispatch of a node.
#[derive(Debug, Clone)]
pub enum Behavior {
  Succeed(HashMap<String, serde_json::Value>),
  Fail(i32),
  /// Fail the first `n` attempts, then succeed.
  FailTimes(u32),
  /// Ack and report running, then wait for `finish` or a kill.
  Hang,
  /// Block inside `dispatch` until `release_stalled`, then succeed.
  Stall,
}

/// In-memory worker fleet driven by per-node scripts.
pub struct ScriptedWorker {
  worker_id: String,
  events: mpsc::Sender<TaskEvent>,
  behaviors: Mutex<HashMap<String, Behavior>>,
  dispatched: Mutex<Vec<TaskExecutionContext>>,
  hanging: Mutex<HashMap<String, TaskExecutionContext>>,
  statuses: Mutex<HashMap<String, WorkerTaskStatus>>,
  kills: Mutex<Vec<String>>,
  confirm_kills: AtomicBool,
  stalled: Notify,
}

impl ScriptedWorker {
  pub fn new(events: mpsc::Sender<TaskEvent>) -> Self {
    Self {
      worker_id: "worker-1".to_string(),
      events,
      behaviors: Mutex::new(HashMap::new()),
      dispatched: Mutex::new(Vec::new()),
      hanging: Mutex::new(HashMap::new()),
      statuses: Mutex::new(HashMap::new()),
      kills: Mutex::new(Vec::new()),
      confirm_kills: AtomicBool::new(true),
      stalled: Notify::new(),
    }
  }

  pub fn script(&self, node_id: &str, behavior: Behavior) {
    self
      .behaviors
      .lock()
      .unwrap()
      .insert(node_id.to_string(), behavior);
  }

  pub fn set_status(&self, task_instance_id: &str, status: WorkerTaskStatus) {
    self
      .statuses
      .lock()
      .unwrap()
      .insert(task_instance_id.to_string(), status);
  }

  pub fn confirm_kills(&self, confirm: bool) {
    self.confirm_kills.store(confirm, Ordering::SeqCst);
  }

  pub fn dispatched(&self) -> Vec<TaskExecutionContext> {
    self.dispatched.lock().unwrap().clone()
  }

  pub fn dispatched_nodes(&self) -> Vec<String> {
    self
      .dispatched
      .lock()
      .unwrap()
      .iter()
      .map(|ctx| ctx.node_id.clone())
      .collect()
  }

  pub fn dispatch_count(&self, node_id: &str) -> usize {
    self
      .dispatched
      .lock()
      .unwrap()
      .iter()
      .filter(|ctx| ctx.node_id == node_id)
      .count()
  }

  pub fn last_dispatch(&self, node_id: &str) -> Option<TaskExecutionContext> {
    self
      .dispatched
      .lock()
      .unwrap()
      .iter()
      .rev()
      .find(|ctx| ctx.node_id == node_id)
      .cloned()
  }

  /// Let one stalled dispatch return.
  pub fn release_stalled(&self) {
    self.stalled.notify_one();
  }

  pub fn kills(&self) -> Vec<String> {
    self.kills.lock().unwrap().clone()
  }

  /// Poll until `node_id` was dispatched `count` times.
  pub async fn wait_for_dispatch(&self, node_id: &str, count: usize) {
    tokio::time::timeout(WAIT, async {
      while self.dispatch_count(node_id) < count {
        tokio::time::sleep(Duration::from_millis(5)).await;
      }
    })
    .await
    .unwrap_or_else(|_| panic!("node '{node_id}' was not dispatched {count} time(s)"));
  }

  /// Finish a hanging attempt of `node_id`.
  pub async fn finish(&self, node_id: &str, exit_code: i32) {
    let ctx = {
      let mut hanging = self.hanging.lock().unwrap();
      let tid = hanging
        .values()
        .find(|ctx| ctx.node_id == node_id)
        .map(|ctx| ctx.task_instance_id.clone())
        .unwrap_or_else(|| panic!("node '{node_id}' is not hanging"));
      hanging.remove(&tid).unwrap()
    };
    self
      .events
      .send(TaskEvent::new(
        ctx.instance_id,
        ctx.task_instance_id,
        TaskEventKind::Result {
          exit_code,
          outputs: HashMap::new(),
          error: None,
        },
      ))
      .await
      .unwrap();
  }

  /// Report a result for an attempt this worker never saw dispatched.
  pub async fn complete(&self, instance_id: &str, task_instance_id: &str, exit_code: i32) {
    self
      .events
      .send(TaskEvent::new(
        instance_id,
        task_instance_id,
        TaskEventKind::Result {
          exit_code,
          outputs: HashMap::new(),
          error: None,
        },
      ))
      .await
      .unwrap();
  }
}

#[async_trait]
impl WorkerClient for ScriptedWorker {
  async fn dispatch(&self, ctx: TaskExecutionContext) -> Result<String, DispatchError> {
    self.dispatched.lock().unwrap().push(ctx.clone());
    let behavior = self
      .behaviors
      .lock()
      .unwrap()
      .get(&ctx.node_id)
      .cloned()
      .unwrap_or(Behavior::Succeed(HashMap::new()));

    let result = match behavior {
      Behavior::Succeed(outputs) => Some((0, outputs)),
      Behavior::Fail(code) => Some((code, HashMap::new())),
      Behavior::FailTimes(n) if ctx.attempt <= n => Some((1, HashMap::new())),
      Behavior::FailTimes(_) => Some((0, HashMap::new())),
      Behavior::Stall => {
        self.stalled.notified().await;
        Some((0, HashMap::new()))
      }
      Behavior::Hang => {
        self
          .hanging
          .lock()
          .unwrap()
          .insert(ctx.task_instance_id.clone(), ctx.clone());
        None
      }
    };

    let events = self.events.clone();
    let worker = self.worker_id.clone();
    tokio::spawn(async move {
      let send = |kind| TaskEvent::new(&ctx.instance_id, &ctx.task_instance_id, kind);
      let _ = events.send(send(TaskEventKind::Ack { worker })).await;
      let _ = events.send(send(TaskEventKind::Running)).await;
      if let Some((exit_code, outputs)) = result {
        let _ = events
          .send(send(TaskEventKind::Result {
            exit_code,
            outputs,
            error: (exit_code != 0).then(|| format!("exit code {exit_code}")),
          }))
          .await;
      }
    });
    Ok(self.worker_id.clone())
  }

  async fn kill(&self, _worker: Option<&str>, task_instance_id: &str) -> Result<(), DispatchError> {
    self.kills.lock().unwrap().push(task_instance_id.to_string());
    if !self.confirm_kills.load(Ordering::SeqCst) {
      return Ok(());
    }
    let ctx = self.hanging.lock().unwrap().remove(task_instance_id);
    if let Some(ctx) = ctx {
      let events = self.events.clone();
      tokio::spawn(async move {
        let _ = events
          .send(TaskEvent::new(
            ctx.instance_id,
            ctx.task_instance_id,
            TaskEventKind::Killed,
          ))
          .await;
      });
    }
    Ok(())
  }

  async fn query(
    &self,
    _worker: Option<&str>,
    task_instance_id: &str,
  ) -> Result<WorkerTaskStatus, DispatchError> {
    Ok(
      self
        .statuses
        .lock()
        .unwrap()
        .get(task_instance_id)
        .cloned()
        .unwrap_or(WorkerTaskStatus::Unknown),
    )
  }
}

/// Config with short intervals for tests.
pub fn test_config(master_id: &str) -> MasterConfig {
  MasterConfig {
    master_id: master_id.to_string(),
    timeout_sweep_interval_ms: 10,
    kill_wait_ms: 200,
    dependent_check_interval_ms: 10,
    store_retry_interval_ms: 1,
    ..MasterConfig::default()
  }
}

pub struct Harness {
  pub engine: WorkflowEngine,
  pub store: Arc<MemoryStore>,
  pub worker: Arc<ScriptedWorker>,
  pub events: mpsc::UnboundedReceiver<ExecutionEvent>,
}

impl Harness {
  pub fn new(config: MasterConfig) -> Self {
    Self::with_store(config, Arc::new(MemoryStore::new()))
  }

  pub fn with_store(config: MasterConfig, store: Arc<MemoryStore>) -> Self {
    Self::build(config, store, None)
  }

  pub fn with_logic(
    config: MasterConfig,
    factory: Arc<dyn LogicTaskPluginFactory>,
  ) -> Self {
    Self::build(config, Arc::new(MemoryStore::new()), Some(factory))
  }

  fn build(
    config: MasterConfig,
    store: Arc<MemoryStore>,
    extra: Option<Arc<dyn LogicTaskPluginFactory>>,
  ) -> Self {
    let (events_tx, events_rx) = task_event_channel(100);
    let worker = Arc::new(ScriptedWorker::new(events_tx));
    let (notify_tx, notify_rx) = mpsc::unbounded_channel();
    let mut builder = EngineBuilder::new(config, store.clone(), worker.clone())
      .notifier(Arc::new(ChannelNotifier::new(notify_tx)));
    if let Some(factory) = extra {
      builder = builder.logic_factory(factory);
    }
    let engine = builder.build(events_rx).unwrap();
    Self {
      engine,
      store,
      worker,
      events: notify_rx,
    }
  }

  pub async fn run(&self, def: WorkflowDef, strategy: FailureStrategy) -> String {
    self
      .engine
      .create(def, HashMap::new(), strategy, RunMode::Serial)
      .await
      .unwrap()
  }

  pub async fn wait(&self, instance_id: &str) -> WorkflowState {
    tokio::time::timeout(WAIT, self.engine.wait(instance_id))
      .await
      .expect("workflow did not finish in time")
      .unwrap()
  }

  /// Receive notifications until one matches.
  pub async fn wait_for_event(
    &mut self,
    mut matches: impl FnMut(&ExecutionEvent) -> bool,
  ) -> ExecutionEvent {
    tokio::time::timeout(WAIT, async {
      loop {
        let event = self.events.recv().await.expect("notifier closed");
        if matches(&event) {
          return event;
        }
      }
    })
    .await
    .expect("expected event was not emitted")
  }

  /// Everything notified so far.
  pub fn drain_events(&mut self) -> Vec<ExecutionEvent> {
    let mut events = Vec::new();
    while let Ok(event) = self.events.try_recv() {
      events.push(event);
    }
    events
  }
}

pub fn workflow(workflow_id: &str, tasks: Vec<TaskDef>, edges: &[(&str, &str)]) -> WorkflowDef {
  WorkflowDef {
    workflow_id: workflow_id.to_string(),
    name: workflow_id.to_string(),
    global_params: HashMap::new(),
    tasks,
    edges: edges.iter().map(|(from, to)| Edge::new(*from, *to)).collect(),
  }
}

pub fn shell(node_id: &str) -> TaskDef {
  TaskDef::new(node_id, "shell")
}

pub fn outputs(pairs: &[(&str, serde_json::Value)]) -> HashMap<String, serde_json::Value> {
  pairs
    .iter()
    .map(|(k, v)| (k.to_string(), v.clone()))
    .collect()
}
