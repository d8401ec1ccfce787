//! Workflow execution runnable: the single owner of one instance.
//!
//! Each instance runs as one tokio task that owns its DAG scheduler, its
//! executors and its instance record. Everything that can change the
//! instance arrives as a [`WorkflowEvent`] on a bounded queue and is handled
//! to completion before the next one is read:
//!
//! ```text
//!   router ──Task──┐
//!   commands ──────┤
//!   timers ────────┼──> queue ──> handle_event ──> settle ──> sync_view
//!   logic tasks ───┤                   │             │
//!   sweeper ───────┘                   │             └─ dispatch ready nodes,
//!                                      │                check completion
//!                                      └─ local queue (attempts that ended
//!                                         inside the loop)
//! ```
//!
//! Attempts that end while the loop is already handling something (a kill
//! of an attempt that never reached a worker, a failed dispatch) are pushed
//! onto a local queue instead of being handled re-entrantly.

use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::{Duration, Instant};

use chrono::Utc;
use kestrel_config::FailureStrategy;
use kestrel_store::{TaskInstance, TaskState, WorkflowInstance, WorkflowState};
use kestrel_task::{
  EXIT_CODE_FAILURE, TaskEvent, TaskEventKind, TaskExecutionContext, WorkerTaskStatus,
};
use kestrel_workflow::{TaskNode, Workflow, WorkflowError};
use tokio::sync::{OwnedSemaphorePermit, mpsc, watch};
use tracing::{debug, error, info, instrument, warn};

use crate::engine::EngineContext;
use crate::error::EngineError;
use crate::events::ExecutionEvent;
use crate::executor::{KillAction, KillReason, TaskExecutor, TimeoutCheck};
use crate::logic::{LogicOutcome, LogicTaskContext, LogicTaskPluginFactory};
use crate::message::{Command, WorkflowEvent};
use crate::params::resolve_params;
use crate::repository::{InstanceView, WorkflowHandle};
use crate::scheduler::{Completion, DagScheduler, NodeState};

enum Admission {
  Admitted(Option<OwnedSemaphorePermit>),
  /// Stopped while waiting; the loop only has to persist `STOP`.
  Stopped,
  Abandoned,
}

pub(crate) struct WorkflowExecutionRunnable {
  ctx: Arc<EngineContext>,
  instance: WorkflowInstance,
  workflow: Arc<Workflow>,
  scheduler: DagScheduler,
  /// Live attempts by task instance id.
  executors: HashMap<String, TaskExecutor>,
  /// Highest attempt number per node.
  attempts: HashMap<String, u32>,
  /// Nodes waiting out their retry interval. They keep their slot.
  retry_pending: HashSet<String>,
  /// Retries that came due while pausing.
  held_retries: BTreeSet<String>,
  logic_cancels: HashMap<String, tokio_util::sync::CancellationToken>,
  local: VecDeque<WorkflowEvent>,
  receiver: mpsc::Receiver<WorkflowEvent>,
  sender: mpsc::Sender<WorkflowEvent>,
  state_tx: watch::Sender<WorkflowState>,
  view: Arc<RwLock<InstanceView>>,
  recovery: Option<Vec<TaskInstance>>,
  stop_requested: bool,
  pause_requested: bool,
  fail_fast: bool,
  halted: Option<String>,
  /// Terminal state whose write failed; retried on every sweep.
  pending_terminal: Option<WorkflowState>,
  finished: bool,
}

impl WorkflowExecutionRunnable {
  pub(crate) fn new(
    ctx: Arc<EngineContext>,
    instance: WorkflowInstance,
    recovery: Option<Vec<TaskInstance>>,
  ) -> (Self, WorkflowHandle) {
    let workflow = Arc::new(instance.workflow.clone());
    let scheduler = DagScheduler::new(&workflow, ctx.config.max_parallel_tasks_per_instance);
    let (sender, receiver) = mpsc::channel(ctx.config.event_buffer_size);
    let (state_tx, state_rx) = watch::channel(instance.state);
    let view = Arc::new(RwLock::new(InstanceView {
      workflow: workflow.clone(),
      global_params: instance.global_params.clone(),
      var_pool: instance.var_pool.clone(),
      node_states: scheduler.states().clone(),
      failure_strategy: instance.failure_strategy,
    }));
    let handle = WorkflowHandle::new(
      instance.instance_id.clone(),
      sender.clone(),
      state_rx,
      view.clone(),
    );

    let runnable = Self {
      ctx,
      instance,
      workflow,
      scheduler,
      executors: HashMap::new(),
      attempts: HashMap::new(),
      retry_pending: HashSet::new(),
      held_retries: BTreeSet::new(),
      logic_cancels: HashMap::new(),
      local: VecDeque::new(),
      receiver,
      sender,
      state_tx,
      view,
      recovery,
      stop_requested: false,
      pause_requested: false,
      fail_fast: false,
      halted: None,
      pending_terminal: None,
      finished: false,
    };
    (runnable, handle)
  }

  #[instrument(
    name = "workflow_instance",
    skip_all,
    fields(instance_id = %self.instance.instance_id, workflow_id = %self.instance.workflow_id)
  )]
  pub(crate) async fn run(mut self, gated: bool, after: Option<WorkflowHandle>) {
    let _permit = match self.admit(gated, after).await {
      Admission::Admitted(permit) => {
        self.start().await;
        permit
      }
      Admission::Stopped => {
        self.stop_before_start().await;
        None
      }
      Admission::Abandoned => {
        info!("workflow_abandoned");
        return;
      }
    };

    while !self.finished {
      let event = match self.local.pop_front() {
        Some(event) => event,
        None => tokio::select! {
          _ = self.ctx.shutdown.cancelled() => {
            info!("workflow_abandoned");
            return;
          }
          event = self.receiver.recv() => match event {
            Some(event) => event,
            None => return,
          },
        },
      };
      self.handle_event(event).await;
    }
  }

  /// Wait for the predecessor and a gate permit while still taking commands.
  async fn admit(&mut self, gated: bool, after: Option<WorkflowHandle>) -> Admission {
    let after = if self.recovery.is_some() { None } else { after };
    let gate = self.ctx.gate.clone();
    let shutdown = self.ctx.shutdown.clone();

    // Built once so the gate's FIFO position survives queued commands.
    let admitted = async move {
      if let Some(previous) = &after {
        previous.wait().await;
      }
      if gated {
        gate.acquire_owned().await.ok()
      } else {
        None
      }
    };
    tokio::pin!(admitted);

    loop {
      tokio::select! {
        _ = shutdown.cancelled() => return Admission::Abandoned,
        permit = &mut admitted => return Admission::Admitted(permit),
        event = self.receiver.recv() => match event {
          Some(WorkflowEvent::Command(Command::Stop)) => return Admission::Stopped,
          Some(WorkflowEvent::Command(Command::Pause)) => self.pause_requested = true,
          Some(WorkflowEvent::Command(Command::Recover)) => {
            if self.instance.state == WorkflowState::Pause {
              // Persisted pause; resumed once started.
              self.local.push_back(WorkflowEvent::Command(Command::Recover));
            } else {
              self.pause_requested = false;
            }
          }
          Some(WorkflowEvent::TimeoutSweep) => {}
          Some(other) => self.local.push_back(other),
          None => return Admission::Abandoned,
        },
      }
    }
  }

  /// Honor a stop that arrived before admission.
  ///
  /// A recovered instance first reattaches what the previous owner left in
  /// flight, so the stop kills those attempts like any other.
  async fn stop_before_start(&mut self) {
    info!(
      instance_id = %self.instance.instance_id,
      recovered = self.recovery.is_some(),
      "workflow_stopped_before_start"
    );
    let Some(tasks) = self.recovery.take() else {
      self.stop_requested = true;
      self.finish(WorkflowState::Stop).await;
      return;
    };
    if let Err(e) = self.restore(tasks).await {
      self.halt(e).await;
    }
    self.handle_event(WorkflowEvent::Command(Command::Stop)).await;
  }

  async fn start(&mut self) {
    let recovered = self.recovery.is_some();
    if let Err(e) = self.workflow.validate() {
      self.halt(e.into()).await;
    } else if let Some(tasks) = self.recovery.take() {
      if let Err(e) = self.restore(tasks).await {
        self.halt(e).await;
      }
    }

    if self.instance.state == WorkflowState::Pause {
      self.pause_requested = true;
    } else if self.instance.state != WorkflowState::Running {
      self.instance.state = WorkflowState::Running;
      self.instance.started_at.get_or_insert_with(Utc::now);
      self.persist_instance().await;
      self.state_tx.send_replace(WorkflowState::Running);
    }

    info!(
      instance_id = %self.instance.instance_id,
      workflow_id = %self.instance.workflow_id,
      recovered,
      "workflow_started"
    );
    self.ctx.notifier.notify(ExecutionEvent::WorkflowStarted {
      instance_id: self.instance.instance_id.clone(),
      workflow_id: self.instance.workflow_id.clone(),
      recovered,
    });

    self.settle().await;
    self.sync_view();
  }

  async fn handle_event(&mut self, event: WorkflowEvent) {
    if let Err(e) = self.dispatch_event(event).await {
      self.halt(e).await;
    }
    self.settle().await;
    self.sync_view();
  }

  async fn dispatch_event(&mut self, event: WorkflowEvent) -> Result<(), EngineError> {
    match event {
      WorkflowEvent::Task(event) => self.on_task_event(event).await,
      WorkflowEvent::Command(command) => self.on_command(command).await,
      WorkflowEvent::RetryDue { node_id } => self.on_retry_due(node_id).await,
      WorkflowEvent::LogicFinished {
        task_instance_id,
        outcome,
      } => self.on_logic_finished(task_instance_id, outcome).await,
      WorkflowEvent::KillDeadline { task_instance_id } => {
        self.on_kill_deadline(task_instance_id).await
      }
      WorkflowEvent::TimeoutSweep => self.on_sweep().await,
      WorkflowEvent::AttemptEnded { task_instance_id } => {
        self.on_attempt_ended(task_instance_id).await
      }
    }
  }

  /// Dispatch what can be dispatched, then see whether the instance is done.
  async fn settle(&mut self) {
    let result = match self.dispatch_ready().await {
      Ok(()) => self.check_completion().await,
      Err(e) => Err(e),
    };
    if let Err(e) = result {
      self.halt(e).await;
      if let Err(e) = self.check_completion().await {
        error!(
          instance_id = %self.instance.instance_id,
          error = %e,
          "workflow_completion_check_failed"
        );
      }
    }
  }

  fn sync_view(&self) {
    let mut view = self.view.write().unwrap_or_else(PoisonError::into_inner);
    view.var_pool = self.instance.var_pool.clone();
    view.node_states = self.scheduler.states().clone();
  }

  async fn on_task_event(&mut self, event: TaskEvent) -> Result<(), EngineError> {
    let tid = event.task_instance_id;
    let Some(executor) = self.executors.get_mut(&tid) else {
      debug!(
        instance_id = %self.instance.instance_id,
        task_instance_id = %tid,
        "stale_task_event"
      );
      return Ok(());
    };

    match event.kind {
      TaskEventKind::Ack { worker } => {
        if executor.on_ack(&worker) {
          self.persist_task(&tid).await;
        }
      }
      TaskEventKind::Running => {
        if executor.on_running() {
          self.persist_task(&tid).await;
        }
      }
      TaskEventKind::Result {
        exit_code,
        outputs,
        error,
      } => {
        if executor.on_result(exit_code, outputs, error).is_some() {
          self.on_attempt_ended(tid).await?;
        }
      }
      TaskEventKind::Timeout => {
        if executor.on_timeout().is_some() {
          self.on_attempt_ended(tid).await?;
        }
      }
      TaskEventKind::Killed => {
        if executor.on_killed().is_some() {
          self.on_attempt_ended(tid).await?;
        }
      }
    }
    Ok(())
  }

  async fn on_logic_finished(
    &mut self,
    tid: String,
    outcome: LogicOutcome,
  ) -> Result<(), EngineError> {
    let ended = self
      .executors
      .get_mut(&tid)
      .and_then(|executor| executor.on_logic_outcome(outcome))
      .is_some();
    if ended {
      self.on_attempt_ended(tid).await?;
    }
    Ok(())
  }

  async fn on_kill_deadline(&mut self, tid: String) -> Result<(), EngineError> {
    let kill_wait = Duration::from_millis(self.ctx.config.kill_wait_ms);
    let ended = self
      .executors
      .get_mut(&tid)
      .and_then(|executor| executor.force_kill(Instant::now(), kill_wait))
      .is_some();
    if ended {
      warn!(
        instance_id = %self.instance.instance_id,
        task_instance_id = %tid,
        "task_kill_unconfirmed"
      );
      self.on_attempt_ended(tid).await?;
    }
    Ok(())
  }

  /// Apply a terminal attempt to the DAG.
  async fn on_attempt_ended(&mut self, tid: String) -> Result<(), EngineError> {
    let Some(executor) = self.executors.remove(&tid) else {
      return Ok(());
    };
    self.logic_cancels.remove(&tid);
    let record = executor.record().clone();
    self.write_task(&record).await;

    let node_id = record.node_id.clone();
    let state = record.state;
    info!(
      instance_id = %self.instance.instance_id,
      node_id = %node_id,
      task_instance_id = %tid,
      attempt = record.attempt,
      state = %state,
      "task_completed"
    );
    self.ctx.notifier.notify(ExecutionEvent::TaskFinished {
      instance_id: self.instance.instance_id.clone(),
      node_id: node_id.clone(),
      task_instance_id: tid.clone(),
      state,
    });

    if state == TaskState::Success {
      self.instance.var_pool.extend(record.outputs);
      let released = self
        .scheduler
        .complete(&node_id, Completion::Success, &record.pruned)
        .map_err(|e| self.violation(e))?;
      for skipped in released.skipped {
        info!(instance_id = %self.instance.instance_id, node_id = %skipped, "node_skipped");
        self.ctx.notifier.notify(ExecutionEvent::NodeSkipped {
          instance_id: self.instance.instance_id.clone(),
          node_id: skipped,
        });
      }
      self.persist_instance().await;
      return Ok(());
    }

    let killed_by_us = matches!(
      executor.kill_reason(),
      Some(KillReason::Stop | KillReason::Halt)
    );
    if self.stop_requested || self.halted.is_some() || killed_by_us {
      self.scheduler.abort(&node_id).map_err(|e| self.violation(e))?;
      return Ok(());
    }

    let node = self.workflow.node(&node_id)?;
    let retryable = matches!(state, TaskState::Failure | TaskState::Timeout);
    if retryable && record.attempt < node.retry.max_attempts() && !self.fail_fast {
      let interval = Duration::from_millis(node.retry.interval_ms);
      self.schedule_retry(&node_id, record.attempt + 1, interval);
      return Ok(());
    }

    warn!(
      instance_id = %self.instance.instance_id,
      node_id = %node_id,
      attempts = record.attempt,
      error = record.error.as_deref().unwrap_or(""),
      "task_failed"
    );
    self
      .scheduler
      .complete(&node_id, Completion::Failure, &[])
      .map_err(|e| self.violation(e))?;
    if self.instance.failure_strategy == FailureStrategy::EndOnFailure && !self.fail_fast {
      info!(
        instance_id = %self.instance.instance_id,
        node_id = %node_id,
        "workflow_ending_on_failure"
      );
      self.fail_fast = true;
    }
    Ok(())
  }

  fn schedule_retry(&mut self, node_id: &str, next_attempt: u32, interval: Duration) {
    info!(
      instance_id = %self.instance.instance_id,
      node_id = %node_id,
      next_attempt,
      interval_ms = interval.as_millis() as u64,
      "task_retrying"
    );
    self.ctx.notifier.notify(ExecutionEvent::TaskRetrying {
      instance_id: self.instance.instance_id.clone(),
      node_id: node_id.to_string(),
      next_attempt,
    });
    self.retry_pending.insert(node_id.to_string());

    let sender = self.sender.clone();
    let node_id = node_id.to_string();
    tokio::spawn(async move {
      tokio::time::sleep(interval).await;
      let _ = sender.send(WorkflowEvent::RetryDue { node_id }).await;
    });
  }

  async fn on_retry_due(&mut self, node_id: String) -> Result<(), EngineError> {
    if !self.retry_pending.contains(&node_id) {
      return Ok(());
    }
    if self.pause_requested {
      self.held_retries.insert(node_id);
      return Ok(());
    }
    if self.fail_fast {
      // Completed as failures once the in-flight attempts drained.
      return Ok(());
    }
    self.retry_pending.remove(&node_id);
    self.launch_attempt(&node_id).await
  }

  async fn on_command(&mut self, command: Command) -> Result<(), EngineError> {
    let id = self.instance.instance_id.clone();
    match command {
      Command::Stop => {
        if self.stop_requested {
          debug!(instance_id = %id, "workflow_already_stopping");
          return Ok(());
        }
        info!(instance_id = %id, executors = self.executors.len(), "workflow_stopping");
        self.stop_requested = true;
        self.pause_requested = false;
        self.held_retries.clear();
        for node_id in std::mem::take(&mut self.retry_pending) {
          self.scheduler.abort(&node_id).map_err(|e| self.violation(e))?;
        }
        let tids: Vec<String> = self.executors.keys().cloned().collect();
        for tid in tids {
          self.kill_executor(&tid, KillReason::Stop).await;
        }
      }
      Command::Pause => {
        if self.stop_requested || self.pause_requested {
          return Ok(());
        }
        info!(instance_id = %id, "workflow_pausing");
        self.pause_requested = true;
      }
      Command::Recover => {
        if !self.pause_requested {
          warn!(instance_id = %id, state = %self.instance.state, "workflow_not_paused");
          return Ok(());
        }
        self.pause_requested = false;
        if self.instance.state == WorkflowState::Pause {
          self.instance.state = WorkflowState::Running;
          self.persist_instance().await;
          self.state_tx.send_replace(WorkflowState::Running);
        }
        info!(instance_id = %id, "workflow_resumed");
        for node_id in std::mem::take(&mut self.held_retries) {
          self.retry_pending.remove(&node_id);
          self.launch_attempt(&node_id).await?;
        }
      }
    }
    Ok(())
  }

  async fn on_sweep(&mut self) -> Result<(), EngineError> {
    if let Some(state) = self.pending_terminal {
      self.finish(state).await;
      return Ok(());
    }

    let now = Instant::now();
    let mut expired = Vec::new();
    for (tid, executor) in self.executors.iter_mut() {
      match executor.check_timeout(now) {
        TimeoutCheck::WithinLimit => {}
        TimeoutCheck::Warn => {
          warn!(
            instance_id = %self.instance.instance_id,
            node_id = %executor.node_id(),
            task_instance_id = %tid,
            "task_timeout_warning"
          );
          self.ctx.notifier.notify(ExecutionEvent::TaskTimeoutWarning {
            instance_id: self.instance.instance_id.clone(),
            node_id: executor.node_id().to_string(),
            task_instance_id: tid.clone(),
          });
        }
        TimeoutCheck::Kill => expired.push(tid.clone()),
      }
    }
    for tid in expired {
      warn!(instance_id = %self.instance.instance_id, task_instance_id = %tid, "task_timed_out");
      self.kill_executor(&tid, KillReason::Timeout).await;
    }
    Ok(())
  }

  async fn kill_executor(&mut self, tid: &str, reason: KillReason) {
    let Some(executor) = self.executors.get_mut(tid) else {
      return;
    };
    match executor.request_kill(reason) {
      KillAction::Nothing => {}
      KillAction::Killed(_) => {
        self.local.push_back(WorkflowEvent::AttemptEnded {
          task_instance_id: tid.to_string(),
        });
      }
      KillAction::SendToWorker { worker } => {
        if let Some(cancel) = self.logic_cancels.get(tid) {
          cancel.cancel();
        } else if let Err(e) = self.ctx.worker.kill(worker.as_deref(), tid).await {
          warn!(
            instance_id = %self.instance.instance_id,
            task_instance_id = %tid,
            error = %e,
            "task_kill_failed"
          );
        }
        let sender = self.sender.clone();
        let wait = Duration::from_millis(self.ctx.config.kill_wait_ms);
        let task_instance_id = tid.to_string();
        tokio::spawn(async move {
          tokio::time::sleep(wait).await;
          let _ = sender
            .send(WorkflowEvent::KillDeadline { task_instance_id })
            .await;
        });
      }
    }
  }

  async fn dispatch_ready(&mut self) -> Result<(), EngineError> {
    if self.finished
      || self.pending_terminal.is_some()
      || self.stop_requested
      || self.pause_requested
      || self.fail_fast
      || self.halted.is_some()
    {
      return Ok(());
    }
    while let Some(node_id) = self.scheduler.next_dispatchable() {
      self.launch_attempt(&node_id).await?;
    }
    Ok(())
  }

  /// Create and start the next attempt of an active node.
  async fn launch_attempt(&mut self, node_id: &str) -> Result<(), EngineError> {
    if self.executors.values().any(|e| e.node_id() == node_id) {
      return Err(self.violation(format!("node '{node_id}' already has a live attempt")));
    }
    let node = self.workflow.node(node_id)?.clone();
    let attempt = self.attempts.get(node_id).copied().unwrap_or(0) + 1;
    self.attempts.insert(node_id.to_string(), attempt);

    let logic = self.ctx.logic.get(&node.task_type);
    let executor = TaskExecutor::new(&self.instance.instance_id, &node, attempt, logic.is_some());
    let store = self.ctx.store.clone();
    let record = executor.record().clone();
    if let Err(e) = self
      .ctx
      .with_store_retry("create_task_instance", || store.create_task_instance(&record))
      .await
    {
      self.persistence_failed(&e.to_string());
    }

    match logic {
      Some(factory) => self.start_logic(executor, node, factory).await,
      None => self.dispatch_remote(executor, node).await,
    }
  }

  /// Run a logic attempt inside the master. Also used to re-execute one
  /// under its existing task instance id after failover.
  async fn start_logic(
    &mut self,
    mut executor: TaskExecutor,
    node: TaskNode,
    factory: Arc<dyn LogicTaskPluginFactory>,
  ) -> Result<(), EngineError> {
    let tid = executor.task_instance_id().to_string();
    executor.mark_dispatched();
    executor.assign_worker(self.ctx.master_id());
    executor.on_running();
    let attempt = executor.attempt();
    self.executors.insert(tid.clone(), executor);
    self.persist_task(&tid).await;
    // Logic tasks read node states and variables through the view.
    self.sync_view();

    let ctx = LogicTaskContext {
      instance_id: self.instance.instance_id.clone(),
      task_instance_id: tid.clone(),
      node: node.clone(),
      attempt,
      engine: self.ctx.clone(),
    };
    match factory.create_logic_task(ctx) {
      Ok(mut task) => {
        let cancel = self.ctx.shutdown.child_token();
        self.logic_cancels.insert(tid.clone(), cancel.clone());
        let sender = self.sender.clone();
        let task_instance_id = tid.clone();
        tokio::spawn(async move {
          let outcome = match task.execute(cancel).await {
            Ok(outcome) => outcome,
            Err(e) => LogicOutcome::failure(e.to_string()),
          };
          let _ = sender
            .send(WorkflowEvent::LogicFinished {
              task_instance_id,
              outcome,
            })
            .await;
        });
      }
      Err(e) => {
        error!(
          instance_id = %self.instance.instance_id,
          node_id = %node.node_id,
          error = %e,
          "logic_task_initialize_failed"
        );
        self.local.push_back(WorkflowEvent::LogicFinished {
          task_instance_id: tid.clone(),
          outcome: LogicOutcome::failure(e.to_string()),
        });
      }
    }

    self.notify_dispatched(&node.node_id, &tid, attempt);
    Ok(())
  }

  async fn dispatch_remote(
    &mut self,
    mut executor: TaskExecutor,
    node: TaskNode,
  ) -> Result<(), EngineError> {
    let tid = executor.task_instance_id().to_string();
    let attempt = executor.attempt();
    let variables = self.variables();

    let params = match resolve_params(&node.node_id, &node.params, &variables) {
      Ok(params) => params,
      Err(e) => {
        warn!(
          instance_id = %self.instance.instance_id,
          node_id = %node.node_id,
          error = %e,
          "task_params_unresolved"
        );
        executor.fail(e.to_string());
        self.executors.insert(tid.clone(), executor);
        self.local.push_back(WorkflowEvent::AttemptEnded {
          task_instance_id: tid,
        });
        return Ok(());
      }
    };

    if !executor.mark_dispatched() {
      return Err(self.violation(format!("attempt '{tid}' was dispatched twice")));
    }
    self.executors.insert(tid.clone(), executor);
    self.persist_task(&tid).await;

    let ctx = TaskExecutionContext {
      instance_id: self.instance.instance_id.clone(),
      task_instance_id: tid.clone(),
      node_id: node.node_id.clone(),
      task_type: node.task_type.clone(),
      attempt,
      params,
      variables,
      timeout_ms: node.timeout.map(|t| t.timeout_ms),
    };
    match self.ctx.worker.dispatch(ctx).await {
      Ok(worker) => {
        if let Some(executor) = self.executors.get_mut(&tid) {
          executor.assign_worker(&worker);
        }
        self.persist_task(&tid).await;
        info!(
          instance_id = %self.instance.instance_id,
          node_id = %node.node_id,
          task_instance_id = %tid,
          attempt,
          worker = %worker,
          "task_dispatched"
        );
        self.notify_dispatched(&node.node_id, &tid, attempt);
      }
      Err(e) => {
        warn!(
          instance_id = %self.instance.instance_id,
          node_id = %node.node_id,
          task_instance_id = %tid,
          error = %e,
          "task_dispatch_failed"
        );
        if let Some(executor) = self.executors.get_mut(&tid) {
          executor.fail(format!("dispatch failed: {e}"));
        }
        self.local.push_back(WorkflowEvent::AttemptEnded {
          task_instance_id: tid,
        });
      }
    }
    Ok(())
  }

  fn notify_dispatched(&self, node_id: &str, tid: &str, attempt: u32) {
    self.ctx.notifier.notify(ExecutionEvent::TaskDispatched {
      instance_id: self.instance.instance_id.clone(),
      node_id: node_id.to_string(),
      task_instance_id: tid.to_string(),
      attempt,
    });
  }

  async fn check_completion(&mut self) -> Result<(), EngineError> {
    if self.finished || self.pending_terminal.is_some() {
      return Ok(());
    }
    if self.halted.is_some() {
      if self.executors.is_empty() {
        self.finish(WorkflowState::Failure).await;
      }
      return Ok(());
    }
    if self.stop_requested {
      if self.executors.is_empty() {
        self.finish(WorkflowState::Stop).await;
      }
      return Ok(());
    }
    if self.fail_fast {
      if self.executors.is_empty() {
        self.held_retries.clear();
        for node_id in std::mem::take(&mut self.retry_pending) {
          self
            .scheduler
            .complete(&node_id, Completion::Failure, &[])
            .map_err(|e| self.violation(e))?;
        }
        self.finish(WorkflowState::Failure).await;
      }
      return Ok(());
    }
    if self.scheduler.is_complete() {
      let state = if self.scheduler.has_failures() {
        WorkflowState::Failure
      } else {
        WorkflowState::Success
      };
      self.finish(state).await;
      return Ok(());
    }
    if self.pause_requested {
      if self.executors.is_empty() && self.instance.state != WorkflowState::Pause {
        self.instance.state = WorkflowState::Pause;
        self.persist_instance().await;
        self.state_tx.send_replace(WorkflowState::Pause);
        info!(instance_id = %self.instance.instance_id, "workflow_paused");
        self.ctx.notifier.notify(ExecutionEvent::WorkflowPaused {
          instance_id: self.instance.instance_id.clone(),
        });
      }
      return Ok(());
    }
    if self.executors.is_empty() && self.retry_pending.is_empty() && self.local.is_empty() {
      let waiting: Vec<&String> = self
        .scheduler
        .states()
        .iter()
        .filter(|(_, state)| !state.is_resolved())
        .map(|(node_id, _)| node_id)
        .collect();
      return Err(self.violation(format!(
        "no attempt in flight but nodes are unresolved: {waiting:?}"
      )));
    }
    Ok(())
  }

  /// Write the terminal state, then deregister.
  async fn finish(&mut self, state: WorkflowState) {
    self.instance.state = state;
    self.instance.ended_at.get_or_insert_with(Utc::now);
    if let Err(e) = self.write_instance().await {
      error!(
        instance_id = %self.instance.instance_id,
        state = %state,
        error = %e,
        "workflow_terminal_state_not_persisted"
      );
      self.persistence_failed(&e.to_string());
      self.pending_terminal = Some(state);
      return;
    }

    self.pending_terminal = None;
    self.finished = true;
    self.ctx.repository.remove(&self.instance.instance_id);
    match state {
      WorkflowState::Success => info!(
        instance_id = %self.instance.instance_id,
        workflow_id = %self.instance.workflow_id,
        "workflow_completed"
      ),
      _ => warn!(
        instance_id = %self.instance.instance_id,
        workflow_id = %self.instance.workflow_id,
        state = %state,
        "workflow_completed"
      ),
    }
    self.ctx.notifier.notify(ExecutionEvent::WorkflowFinished {
      instance_id: self.instance.instance_id.clone(),
      workflow_id: self.instance.workflow_id.clone(),
      state,
    });
    self.state_tx.send_replace(state);
  }

  /// Stop the instance after an internal inconsistency.
  async fn halt(&mut self, error: EngineError) {
    let reason = error.to_string();
    if self.halted.is_some() {
      error!(instance_id = %self.instance.instance_id, error = %reason, "workflow_error_while_halted");
      return;
    }
    error!(instance_id = %self.instance.instance_id, reason = %reason, "workflow_halted");
    self.halted = Some(reason.clone());
    self.instance.halted_reason = Some(reason.clone());
    self.ctx.notifier.notify(ExecutionEvent::WorkflowHalted {
      instance_id: self.instance.instance_id.clone(),
      reason,
    });

    self.held_retries.clear();
    for node_id in std::mem::take(&mut self.retry_pending) {
      if let Err(e) = self.scheduler.abort(&node_id) {
        error!(
          instance_id = %self.instance.instance_id,
          node_id = %node_id,
          error = %e,
          "workflow_retry_abort_failed"
        );
      }
    }
    let tids: Vec<String> = self.executors.keys().cloned().collect();
    for tid in tids {
      self.kill_executor(&tid, KillReason::Halt).await;
    }
  }

  /// Rebuild scheduler and executors from persisted attempts.
  async fn restore(&mut self, tasks: Vec<TaskInstance>) -> Result<(), EngineError> {
    let mut latest: HashMap<String, TaskInstance> = HashMap::new();
    for task in tasks {
      let highest = self.attempts.entry(task.node_id.clone()).or_insert(0);
      *highest = (*highest).max(task.attempt);
      match latest.get(&task.node_id) {
        Some(existing) if existing.attempt > task.attempt => {}
        _ => {
          latest.insert(task.node_id.clone(), task);
        }
      }
    }

    let order = self
      .scheduler
      .graph()
      .topological_order()
      .map_err(|nodes| WorkflowError::CycleDetected { nodes })?;

    for node_id in order {
      let Some(task) = latest.remove(&node_id) else {
        continue;
      };
      if self.scheduler.state(&node_id) != Some(NodeState::Ready) {
        warn!(
          instance_id = %self.instance.instance_id,
          node_id = %node_id,
          task_instance_id = %task.task_instance_id,
          "recovered_attempt_for_unreleased_node"
        );
        continue;
      }
      self
        .scheduler
        .activate(&node_id)
        .map_err(|e| self.violation(e))?;
      let node = self.workflow.node(&node_id)?.clone();

      match task.state {
        TaskState::Success => {
          self.instance.var_pool.extend(task.outputs);
          self
            .scheduler
            .complete(&node_id, Completion::Success, &task.pruned)
            .map_err(|e| self.violation(e))?;
        }
        TaskState::Failure | TaskState::Timeout if task.attempt < node.retry.max_attempts() => {
          self.retry_pending.insert(node_id.clone());
          self.local.push_back(WorkflowEvent::RetryDue { node_id });
        }
        TaskState::Failure | TaskState::Timeout | TaskState::Killed => {
          self
            .scheduler
            .complete(&node_id, Completion::Failure, &[])
            .map_err(|e| self.violation(e))?;
          if self.instance.failure_strategy == FailureStrategy::EndOnFailure {
            self.fail_fast = true;
          }
        }
        TaskState::Submitted | TaskState::Dispatched | TaskState::Running => {
          self.reattach(task, node).await?;
        }
      }
    }

    info!(
      instance_id = %self.instance.instance_id,
      in_flight = self.executors.len(),
      retrying = self.retry_pending.len(),
      "workflow_restored"
    );
    Ok(())
  }

  /// Reconcile an attempt that was in flight when the previous owner died.
  async fn reattach(&mut self, task: TaskInstance, node: TaskNode) -> Result<(), EngineError> {
    let logic = self.ctx.logic.get(&node.task_type);
    let mut executor = TaskExecutor::from_record(task, &node, logic.is_some());
    let tid = executor.task_instance_id().to_string();

    if let Some(factory) = logic {
      info!(
        instance_id = %self.instance.instance_id,
        node_id = %node.node_id,
        task_instance_id = %tid,
        "logic_task_reexecuting"
      );
      return self.start_logic(executor, node, factory).await;
    }

    let worker = executor.record().worker.clone();
    let lost = |reason: String| TaskEventKind::Result {
      exit_code: EXIT_CODE_FAILURE,
      outputs: HashMap::new(),
      error: Some(reason),
    };
    let replay = match self.ctx.worker.query(worker.as_deref(), &tid).await {
      Ok(WorkerTaskStatus::Running { worker }) => {
        executor.adopt_running(&worker);
        info!(
          instance_id = %self.instance.instance_id,
          node_id = %node.node_id,
          task_instance_id = %tid,
          worker = %worker,
          "task_adopted"
        );
        None
      }
      Ok(WorkerTaskStatus::Finished { exit_code, outputs }) => Some(TaskEventKind::Result {
        exit_code,
        outputs,
        error: None,
      }),
      Ok(WorkerTaskStatus::Unknown) => Some(lost("task lost during failover".to_string())),
      Ok(WorkerTaskStatus::WorkerDead) => Some(lost("worker died during failover".to_string())),
      Err(e) => Some(lost(format!("worker query failed during failover: {e}"))),
    };

    self.executors.insert(tid.clone(), executor);
    self.persist_task(&tid).await;
    if let Some(kind) = replay {
      self.local.push_back(WorkflowEvent::Task(TaskEvent::new(
        self.instance.instance_id.clone(),
        tid,
        kind,
      )));
    }
    Ok(())
  }

  fn variables(&self) -> HashMap<String, serde_json::Value> {
    let mut variables = self.instance.global_params.clone();
    variables.extend(self.instance.var_pool.clone());
    variables
  }

  fn violation(&self, error: impl std::fmt::Display) -> EngineError {
    EngineError::InvariantViolation {
      instance_id: self.instance.instance_id.clone(),
      message: error.to_string(),
    }
  }

  async fn write_instance(&self) -> Result<(), EngineError> {
    let store = self.ctx.store.clone();
    let instance = &self.instance;
    self
      .ctx
      .with_store_retry("update_instance", || store.update_instance(instance))
      .await?;
    Ok(())
  }

  async fn persist_instance(&self) {
    if let Err(e) = self.write_instance().await {
      error!(instance_id = %self.instance.instance_id, error = %e, "workflow_persist_failed");
      self.persistence_failed(&e.to_string());
    }
  }

  async fn persist_task(&self, tid: &str) {
    if let Some(executor) = self.executors.get(tid) {
      self.write_task(executor.record()).await;
    }
  }

  async fn write_task(&self, record: &TaskInstance) {
    let store = self.ctx.store.clone();
    if let Err(e) = self
      .ctx
      .with_store_retry("update_task_instance", || store.update_task_instance(record))
      .await
    {
      error!(
        instance_id = %self.instance.instance_id,
        task_instance_id = %record.task_instance_id,
        error = %e,
        "task_persist_failed"
      );
      self.persistence_failed(&e.to_string());
    }
  }

  fn persistence_failed(&self, error: &str) {
    self.ctx.notifier.notify(ExecutionEvent::PersistenceFailed {
      instance_id: self.instance.instance_id.clone(),
      error: error.to_string(),
    });
  }
}
