//! Engine facade: trigger-in, control-in and the background tasks shared by
//! every instance.
//!
//! `EngineBuilder::build` spawns two long-lived tasks:
//! - the router, which moves worker [`TaskEvent`]s from the engine-wide
//!   channel to a per-instance forwarder feeding the owning instance's queue
//! - the sweeper, which sends a timeout sweep tick to every registered
//!   instance on a fixed interval

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use kestrel_config::{FailureStrategy, MasterConfig, RunMode, WorkflowDef};
use kestrel_store::{ParentRef, Store, StoreError, TaskInstance, WorkflowInstance, WorkflowState};
use kestrel_task::{TaskEvent, WorkerClient};
use kestrel_workflow::Workflow;
use tokio::sync::{Semaphore, mpsc};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::error::EngineError;
use crate::events::{ExecutionNotifier, NoopNotifier};
use crate::logic::{LogicTaskPluginFactory, LogicTaskRegistry};
use crate::message::{Command, WorkflowEvent};
use crate::repository::{WorkflowHandle, WorkflowRepository};
use crate::runnable::WorkflowExecutionRunnable;

/// State shared by the engine, every runnable and every logic task.
pub struct EngineContext {
  pub config: MasterConfig,
  pub store: Arc<dyn Store>,
  pub worker: Arc<dyn WorkerClient>,
  pub repository: WorkflowRepository,
  pub logic: LogicTaskRegistry,
  pub notifier: Arc<dyn ExecutionNotifier>,
  pub(crate) gate: Arc<Semaphore>,
  pub(crate) shutdown: CancellationToken,
}

impl EngineContext {
  pub fn master_id(&self) -> &str {
    &self.config.master_id
  }

  /// Run a store operation, retrying while the backend is unavailable.
  pub(crate) async fn with_store_retry<T, F, Fut>(&self, what: &str, mut op: F) -> Result<T, StoreError>
  where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, StoreError>>,
  {
    let attempts = self.config.store_write_attempts.max(1);
    let mut attempt = 1;
    loop {
      match op().await {
        Ok(value) => return Ok(value),
        Err(StoreError::Unavailable { message }) if attempt < attempts => {
          warn!(operation = what, attempt, error = %message, "store_write_retrying");
          attempt += 1;
          tokio::time::sleep(Duration::from_millis(self.config.store_retry_interval_ms)).await;
        }
        Err(e) => return Err(e),
      }
    }
  }

  /// A fresh `SUBMITTED` instance owned by this master.
  pub fn new_instance(
    &self,
    workflow: Workflow,
    params: HashMap<String, serde_json::Value>,
    failure_strategy: FailureStrategy,
    run_mode: RunMode,
    parent: Option<ParentRef>,
  ) -> WorkflowInstance {
    let mut global_params = workflow.global_params.clone();
    global_params.extend(params);
    WorkflowInstance {
      instance_id: uuid::Uuid::new_v4().to_string(),
      workflow_id: workflow.workflow_id.clone(),
      workflow,
      global_params,
      var_pool: HashMap::new(),
      state: WorkflowState::Submitted,
      failure_strategy,
      run_mode,
      owner: self.master_id().to_string(),
      parent,
      halted_reason: None,
      created_at: Utc::now(),
      started_at: None,
      ended_at: None,
    }
  }

  /// Persist a new instance and start its runnable.
  ///
  /// Gated instances wait for a slot of `max_concurrent_workflows`. With
  /// `after` set, the instance is admitted only once that one ended.
  pub(crate) async fn submit(
    self: &Arc<Self>,
    instance: WorkflowInstance,
    gated: bool,
    after: Option<WorkflowHandle>,
  ) -> Result<WorkflowHandle, EngineError> {
    if self.shutdown.is_cancelled() {
      return Err(EngineError::Shutdown);
    }
    instance.workflow.validate()?;
    let store = self.store.clone();
    self
      .with_store_retry("create_instance", || store.create_instance(&instance))
      .await?;
    self.spawn_runnable(instance, None, gated, after)
  }

  /// Claim an unfinished instance from its previous owner and rehydrate it.
  pub(crate) async fn recover_instance(
    self: &Arc<Self>,
    mut instance: WorkflowInstance,
  ) -> Result<WorkflowHandle, EngineError> {
    if let Some(handle) = self.repository.get(&instance.instance_id) {
      return Ok(handle);
    }
    let store = self.store.clone();
    let claimed = self
      .with_store_retry("claim_instance", || {
        store.claim_instance(&instance.instance_id, &instance.owner, &self.config.master_id)
      })
      .await?;
    if !claimed {
      return Err(EngineError::ClaimLost {
        instance_id: instance.instance_id,
      });
    }

    info!(
      instance_id = %instance.instance_id,
      previous_owner = %instance.owner,
      master_id = %self.master_id(),
      "workflow_claimed"
    );
    instance.owner = self.master_id().to_string();
    let tasks = self.store.list_task_instances(&instance.instance_id).await?;
    let gated = instance.parent.is_none();
    self.spawn_runnable(instance, Some(tasks), gated, None)
  }

  fn spawn_runnable(
    self: &Arc<Self>,
    instance: WorkflowInstance,
    recovery: Option<Vec<TaskInstance>>,
    gated: bool,
    after: Option<WorkflowHandle>,
  ) -> Result<WorkflowHandle, EngineError> {
    let (runnable, handle) = WorkflowExecutionRunnable::new(self.clone(), instance, recovery);
    self.repository.register(handle.clone())?;
    tokio::spawn(runnable.run(gated, after));
    Ok(handle)
  }
}

/// Builds a [`WorkflowEngine`].
pub struct EngineBuilder {
  config: MasterConfig,
  store: Arc<dyn Store>,
  worker: Arc<dyn WorkerClient>,
  notifier: Arc<dyn ExecutionNotifier>,
  logic: LogicTaskRegistry,
}

impl EngineBuilder {
  pub fn new(config: MasterConfig, store: Arc<dyn Store>, worker: Arc<dyn WorkerClient>) -> Self {
    Self {
      config,
      store,
      worker,
      notifier: Arc::new(NoopNotifier),
      logic: LogicTaskRegistry::default(),
    }
  }

  pub fn notifier(mut self, notifier: Arc<dyn ExecutionNotifier>) -> Self {
    self.notifier = notifier;
    self
  }

  /// Register an additional logic task type.
  pub fn logic_factory(mut self, factory: Arc<dyn LogicTaskPluginFactory>) -> Self {
    self.logic.register(factory);
    self
  }

  /// Start the engine. `events` is the receiving end of the channel the
  /// worker transport reports into.
  ///
  /// Must be called inside a tokio runtime.
  pub fn build(self, events: mpsc::Receiver<TaskEvent>) -> Result<WorkflowEngine, EngineError> {
    self.config.validate()?;
    let ctx = Arc::new(EngineContext {
      gate: Arc::new(Semaphore::new(self.config.max_concurrent_workflows)),
      config: self.config,
      store: self.store,
      worker: self.worker,
      repository: WorkflowRepository::new(),
      logic: self.logic,
      notifier: self.notifier,
      shutdown: CancellationToken::new(),
    });

    tokio::spawn(route_task_events(
      ctx.repository.clone(),
      events,
      ctx.shutdown.clone(),
    ));
    tokio::spawn(sweep_timeouts(
      ctx.repository.clone(),
      Duration::from_millis(ctx.config.timeout_sweep_interval_ms),
      ctx.shutdown.clone(),
    ));

    info!(master_id = %ctx.master_id(), "engine_started");
    Ok(WorkflowEngine { ctx })
  }
}

async fn route_task_events(
  repository: WorkflowRepository,
  mut events: mpsc::Receiver<TaskEvent>,
  shutdown: CancellationToken,
) {
  // One forwarder per instance, so a full queue only holds up its own events.
  let mut forwarders: HashMap<String, mpsc::UnboundedSender<TaskEvent>> = HashMap::new();
  loop {
    let mut event = tokio::select! {
      _ = shutdown.cancelled() => break,
      event = events.recv() => match event {
        Some(event) => event,
        None => break,
      },
    };

    forwarders.retain(|_, forwarder| !forwarder.is_closed());
    if let Some(forwarder) = forwarders.get(&event.instance_id) {
      match forwarder.send(event) {
        Ok(()) => continue,
        Err(mpsc::error::SendError(returned)) => event = returned,
      }
    }

    let Some(handle) = repository.get(&event.instance_id) else {
      warn!(
        instance_id = %event.instance_id,
        task_instance_id = %event.task_instance_id,
        "task_event_for_unknown_instance"
      );
      continue;
    };
    let (forwarder, inbox) = mpsc::unbounded_channel();
    tokio::spawn(forward_task_events(handle, inbox, shutdown.clone()));
    let instance_id = event.instance_id.clone();
    if forwarder.send(event).is_ok() {
      forwarders.insert(instance_id, forwarder);
    }
  }
}

/// Feed one instance's queue in arrival order until the instance ends.
async fn forward_task_events(
  handle: WorkflowHandle,
  mut inbox: mpsc::UnboundedReceiver<TaskEvent>,
  shutdown: CancellationToken,
) {
  loop {
    let event = tokio::select! {
      _ = shutdown.cancelled() => break,
      _ = handle.closed() => break,
      event = inbox.recv() => match event {
        Some(event) => event,
        None => break,
      },
    };
    if handle.send(WorkflowEvent::Task(event)).await.is_err() {
      debug!(instance_id = %handle.instance_id(), "task_event_dropped");
      break;
    }
  }
}

async fn sweep_timeouts(repository: WorkflowRepository, every: Duration, shutdown: CancellationToken) {
  let mut interval = tokio::time::interval(every);
  interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
  loop {
    tokio::select! {
      _ = shutdown.cancelled() => break,
      _ = interval.tick() => {
        for handle in repository.handles() {
          handle.try_send(WorkflowEvent::TimeoutSweep);
        }
      }
    }
  }
}

/// The master's entry point for running workflows.
pub struct WorkflowEngine {
  ctx: Arc<EngineContext>,
}

impl WorkflowEngine {
  /// Validate a definition, persist a new instance and start it.
  #[instrument(
    name = "create_workflow",
    skip(self, def, params),
    fields(workflow_id = %def.workflow_id)
  )]
  pub async fn create(
    &self,
    def: WorkflowDef,
    params: HashMap<String, serde_json::Value>,
    failure_strategy: FailureStrategy,
    run_mode: RunMode,
  ) -> Result<String, EngineError> {
    let workflow = Workflow::lock(def)?;
    let instance = self
      .ctx
      .new_instance(workflow, params, failure_strategy, run_mode, None);
    let handle = self.ctx.submit(instance, true, None).await?;
    Ok(handle.instance_id().to_string())
  }

  /// Start one instance per parameter set.
  ///
  /// In `Serial` mode each instance is admitted after the previous one
  /// ended; in `Parallel` mode they only share the concurrency gate.
  #[instrument(
    name = "create_backfill",
    skip(self, def, runs),
    fields(workflow_id = %def.workflow_id, runs = runs.len())
  )]
  pub async fn create_backfill(
    &self,
    def: WorkflowDef,
    runs: Vec<HashMap<String, serde_json::Value>>,
    failure_strategy: FailureStrategy,
    run_mode: RunMode,
  ) -> Result<Vec<String>, EngineError> {
    let workflow = Workflow::lock(def)?;
    let mut ids = Vec::with_capacity(runs.len());
    let mut previous: Option<WorkflowHandle> = None;
    for params in runs {
      let instance = self
        .ctx
        .new_instance(workflow.clone(), params, failure_strategy, run_mode, None);
      let after = match run_mode {
        RunMode::Serial => previous.take(),
        RunMode::Parallel => None,
      };
      let handle = self.ctx.submit(instance, true, after).await?;
      ids.push(handle.instance_id().to_string());
      previous = Some(handle);
    }
    Ok(ids)
  }

  pub async fn pause(&self, instance_id: &str) -> Result<(), EngineError> {
    self.command(instance_id, Command::Pause).await
  }

  /// Stop an instance. Repeated calls are harmless.
  pub async fn stop(&self, instance_id: &str) -> Result<(), EngineError> {
    self.command(instance_id, Command::Stop).await
  }

  /// Resume a paused instance.
  pub async fn recover(&self, instance_id: &str) -> Result<(), EngineError> {
    self.command(instance_id, Command::Recover).await
  }

  async fn command(&self, instance_id: &str, command: Command) -> Result<(), EngineError> {
    let handle = self
      .ctx
      .repository
      .get(instance_id)
      .ok_or_else(|| EngineError::InstanceNotFound {
        instance_id: instance_id.to_string(),
      })?;
    info!(instance_id = %instance_id, command = ?command, "workflow_command");
    handle.command(command).await
  }

  pub fn handle(&self, instance_id: &str) -> Option<WorkflowHandle> {
    self.ctx.repository.get(instance_id)
  }

  /// Wait for an instance to reach a terminal state.
  ///
  /// Instances that already left the repository are answered from the store.
  pub async fn wait(&self, instance_id: &str) -> Result<WorkflowState, EngineError> {
    if let Some(handle) = self.ctx.repository.get(instance_id) {
      return Ok(handle.wait().await);
    }
    match self.ctx.store.get_instance(instance_id).await {
      Ok(instance) => Ok(instance.state),
      Err(StoreError::NotFound(_)) => Err(EngineError::InstanceNotFound {
        instance_id: instance_id.to_string(),
      }),
      Err(e) => Err(e.into()),
    }
  }

  pub fn repository(&self) -> &WorkflowRepository {
    &self.ctx.repository
  }

  pub fn context(&self) -> &Arc<EngineContext> {
    &self.ctx
  }

  pub fn master_id(&self) -> &str {
    self.ctx.master_id()
  }

  /// Stop background tasks and abandon running instances without changing
  /// their persisted state, as a crashed master would.
  pub fn shutdown(&self) {
    info!(master_id = %self.ctx.master_id(), "engine_shutdown");
    self.ctx.shutdown.cancel();
  }
}

impl Drop for WorkflowEngine {
  fn drop(&mut self) {
    self.ctx.shutdown.cancel();
  }
}
