//! Task executor: the state machine of one attempt.
//!
//! `SUBMITTED -> DISPATCHED -> RUNNING -> {SUCCESS, FAILURE, KILLED, TIMEOUT}`
//!
//! The executor does no I/O. The runnable performs the side effects an
//! executor asks for (dispatching, sending kills, persisting the record) and
//! feeds worker events back in. Each method that can end the attempt returns
//! `Some(state)` exactly once, the first time the attempt becomes terminal;
//! anything arriving afterwards is ignored.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use chrono::Utc;
use kestrel_config::TimeoutStrategy;
use kestrel_store::{TaskInstance, TaskState};
use kestrel_workflow::TaskNode;

use crate::logic::LogicOutcome;

/// Why an attempt is being killed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KillReason {
  Stop,
  Timeout,
  Halt,
}

/// What the runnable has to do after `request_kill`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KillAction {
  /// Already terminal or already being killed.
  Nothing,
  /// Never reached a worker; killed locally.
  Killed(TaskState),
  /// Send a kill to this worker and arm the deadline.
  SendToWorker { worker: Option<String> },
}

/// Result of a timeout check during a sweep.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutCheck {
  WithinLimit,
  Warn,
  Kill,
}

#[derive(Debug, Clone)]
pub struct TaskExecutor {
  task: TaskInstance,
  logic: bool,
  timeout: Option<(Duration, TimeoutStrategy)>,
  running_since: Option<Instant>,
  timeout_warned: bool,
  kill_reason: Option<KillReason>,
  kill_requested_at: Option<Instant>,
}

impl TaskExecutor {
  /// A fresh attempt in `SUBMITTED`.
  pub fn new(instance_id: &str, node: &TaskNode, attempt: u32, logic: bool) -> Self {
    let task = TaskInstance {
      task_instance_id: uuid::Uuid::new_v4().to_string(),
      instance_id: instance_id.to_string(),
      node_id: node.node_id.clone(),
      task_type: node.task_type.clone(),
      attempt,
      state: TaskState::Submitted,
      worker: None,
      submitted_at: Utc::now(),
      started_at: None,
      ended_at: None,
      exit_code: None,
      outputs: HashMap::new(),
      error: None,
      pruned: Vec::new(),
    };
    Self::from_record(task, node, logic)
  }

  /// Rebuild an executor around a persisted attempt.
  pub fn from_record(task: TaskInstance, node: &TaskNode, logic: bool) -> Self {
    let running_since = (task.state == TaskState::Running).then(Instant::now);
    Self {
      task,
      logic,
      timeout: node
        .timeout
        .map(|t| (Duration::from_millis(t.timeout_ms), t.strategy)),
      running_since,
      timeout_warned: false,
      kill_reason: None,
      kill_requested_at: None,
    }
  }

  pub fn record(&self) -> &TaskInstance {
    &self.task
  }

  pub fn task_instance_id(&self) -> &str {
    &self.task.task_instance_id
  }

  pub fn node_id(&self) -> &str {
    &self.task.node_id
  }

  pub fn attempt(&self) -> u32 {
    self.task.attempt
  }

  pub fn state(&self) -> TaskState {
    self.task.state
  }

  pub fn is_logic(&self) -> bool {
    self.logic
  }

  pub fn is_terminal(&self) -> bool {
    self.task.state.is_terminal()
  }

  pub fn kill_reason(&self) -> Option<KillReason> {
    self.kill_reason
  }

  /// Record that the attempt is being handed to a worker.
  ///
  /// Returns `false` if the attempt already left `SUBMITTED`, which means
  /// the same attempt would be dispatched twice.
  pub fn mark_dispatched(&mut self) -> bool {
    if self.task.state != TaskState::Submitted {
      return false;
    }
    self.task.state = TaskState::Dispatched;
    true
  }

  pub fn assign_worker(&mut self, worker: &str) {
    self.task.worker = Some(worker.to_string());
  }

  /// Returns whether the record changed.
  pub fn on_ack(&mut self, worker: &str) -> bool {
    match self.task.state {
      TaskState::Submitted | TaskState::Dispatched => {
        let changed =
          self.task.state != TaskState::Dispatched || self.task.worker.as_deref() != Some(worker);
        self.task.state = TaskState::Dispatched;
        self.task.worker = Some(worker.to_string());
        changed
      }
      _ => false,
    }
  }

  /// Returns whether the record changed.
  pub fn on_running(&mut self) -> bool {
    match self.task.state {
      TaskState::Submitted | TaskState::Dispatched => {
        self.task.state = TaskState::Running;
        self.task.started_at = Some(Utc::now());
        self.running_since = Some(Instant::now());
        true
      }
      _ => false,
    }
  }

  /// Adopt an attempt a live worker is still running.
  pub fn adopt_running(&mut self, worker: &str) {
    if !self.is_terminal() {
      self.task.worker = Some(worker.to_string());
      if self.task.state != TaskState::Running {
        self.task.state = TaskState::Running;
        self.task.started_at.get_or_insert_with(Utc::now);
      }
      self.running_since = Some(Instant::now());
    }
  }

  pub fn on_result(
    &mut self,
    exit_code: i32,
    outputs: HashMap<String, serde_json::Value>,
    error: Option<String>,
  ) -> Option<TaskState> {
    if self.is_terminal() {
      return None;
    }
    let state = if exit_code == 0 {
      TaskState::Success
    } else {
      match self.kill_reason {
        Some(KillReason::Timeout) => TaskState::Timeout,
        Some(KillReason::Stop | KillReason::Halt) => TaskState::Killed,
        None => TaskState::Failure,
      }
    };
    self.task.exit_code = Some(exit_code);
    self.task.outputs = outputs;
    self.task.error = error;
    Some(self.finish(state))
  }

  /// The worker confirmed a kill.
  pub fn on_killed(&mut self) -> Option<TaskState> {
    if self.is_terminal() {
      return None;
    }
    let state = self.killed_state();
    self.task.exit_code = Some(kestrel_task::EXIT_CODE_KILL);
    Some(self.finish(state))
  }

  /// The worker enforced the timeout itself.
  pub fn on_timeout(&mut self) -> Option<TaskState> {
    if self.is_terminal() {
      return None;
    }
    self.task.error = Some("timed out on worker".to_string());
    Some(self.finish(TaskState::Timeout))
  }

  pub fn on_logic_outcome(&mut self, outcome: LogicOutcome) -> Option<TaskState> {
    if self.is_terminal() {
      return None;
    }
    let state = match outcome.state {
      TaskState::Killed => self.killed_state(),
      other => other,
    };
    self.task.outputs = outcome.outputs;
    self.task.pruned = outcome.pruned;
    self.task.error = outcome.message;
    self.task.exit_code = Some(if state.is_success() { 0 } else { kestrel_task::EXIT_CODE_FAILURE });
    Some(self.finish(state))
  }

  /// Fail the attempt without a worker result (dispatch or resolution error).
  pub fn fail(&mut self, error: String) -> Option<TaskState> {
    self.on_result(kestrel_task::EXIT_CODE_FAILURE, HashMap::new(), Some(error))
  }

  pub fn request_kill(&mut self, reason: KillReason) -> KillAction {
    if self.is_terminal() || self.kill_reason.is_some() {
      return KillAction::Nothing;
    }
    self.kill_reason = Some(reason);
    if self.task.state == TaskState::Submitted {
      let state = self.killed_state();
      return KillAction::Killed(self.finish(state));
    }
    self.kill_requested_at = Some(Instant::now());
    KillAction::SendToWorker {
      worker: self.task.worker.clone(),
    }
  }

  /// Terminate locally once the worker had `kill_wait` to confirm.
  pub fn force_kill(&mut self, now: Instant, kill_wait: Duration) -> Option<TaskState> {
    let requested = self.kill_requested_at?;
    if self.is_terminal() || now.duration_since(requested) < kill_wait {
      return None;
    }
    let state = self.killed_state();
    self.task.error = Some("worker did not confirm kill in time".to_string());
    Some(self.finish(state))
  }

  pub fn check_timeout(&mut self, now: Instant) -> TimeoutCheck {
    let (Some((limit, strategy)), Some(since)) = (self.timeout, self.running_since) else {
      return TimeoutCheck::WithinLimit;
    };
    if self.is_terminal() || self.kill_reason.is_some() || now.duration_since(since) <= limit {
      return TimeoutCheck::WithinLimit;
    }
    match strategy {
      TimeoutStrategy::Failed => TimeoutCheck::Kill,
      TimeoutStrategy::Warn if !self.timeout_warned => {
        self.timeout_warned = true;
        TimeoutCheck::Warn
      }
      TimeoutStrategy::Warn => TimeoutCheck::WithinLimit,
    }
  }

  fn killed_state(&self) -> TaskState {
    match self.kill_reason {
      Some(KillReason::Timeout) => TaskState::Timeout,
      _ => TaskState::Killed,
    }
  }

  fn finish(&mut self, state: TaskState) -> TaskState {
    self.task.state = state;
    self.task.ended_at = Some(Utc::now());
    state
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use kestrel_config::{TaskDef, WorkflowDef};
  use kestrel_workflow::Workflow;

  fn node(timeout: Option<(u64, TimeoutStrategy)>) -> TaskNode {
    let mut def = TaskDef::new("a", "shell");
    if let Some((ms, strategy)) = timeout {
      def = def.with_timeout(ms, strategy);
    }
    let workflow = Workflow::lock(WorkflowDef {
      workflow_id: "wf".to_string(),
      name: "wf".to_string(),
      global_params: Default::default(),
      tasks: vec![def],
      edges: vec![],
    })
    .unwrap();
    workflow.node("a").unwrap().clone()
  }

  fn executor() -> TaskExecutor {
    TaskExecutor::new("i1", &node(None), 1, false)
  }

  #[test]
  fn test_happy_path() {
    let mut exec = executor();
    assert!(exec.mark_dispatched());
    assert!(exec.on_ack("w1"));
    assert!(exec.on_running());
    assert_eq!(exec.state(), TaskState::Running);

    let outputs = HashMap::from([("rows".to_string(), serde_json::json!(3))]);
    assert_eq!(exec.on_result(0, outputs, None), Some(TaskState::Success));
    assert_eq!(exec.record().worker.as_deref(), Some("w1"));
    assert!(exec.record().ended_at.is_some());
  }

  #[test]
  fn test_second_dispatch_is_detected() {
    let mut exec = executor();
    assert!(exec.mark_dispatched());
    assert!(!exec.mark_dispatched());
  }

  #[test]
  fn test_terminal_outcome_reported_once() {
    let mut exec = executor();
    exec.mark_dispatched();
    assert_eq!(exec.on_result(1, HashMap::new(), None), Some(TaskState::Failure));
    assert_eq!(exec.on_result(0, HashMap::new(), None), None);
    assert_eq!(exec.on_killed(), None);
    assert_eq!(exec.state(), TaskState::Failure);
  }

  #[test]
  fn test_kill_before_dispatch_is_local() {
    let mut exec = executor();
    assert_eq!(
      exec.request_kill(KillReason::Stop),
      KillAction::Killed(TaskState::Killed)
    );
    assert!(!exec.mark_dispatched());
    assert_eq!(exec.request_kill(KillReason::Stop), KillAction::Nothing);
  }

  #[test]
  fn test_kill_waits_for_worker_then_forces() {
    let mut exec = executor();
    exec.mark_dispatched();
    exec.on_ack("w1");
    assert_eq!(
      exec.request_kill(KillReason::Stop),
      KillAction::SendToWorker {
        worker: Some("w1".to_string())
      }
    );
    assert_eq!(exec.request_kill(KillReason::Stop), KillAction::Nothing);

    let now = Instant::now();
    assert_eq!(exec.force_kill(now, Duration::from_secs(60)), None);
    assert_eq!(
      exec.force_kill(now + Duration::from_secs(61), Duration::from_secs(60)),
      Some(TaskState::Killed)
    );
  }

  #[test]
  fn test_timeout_failed_strategy() {
    let mut exec = TaskExecutor::new("i1", &node(Some((10, TimeoutStrategy::Failed))), 1, false);
    exec.mark_dispatched();
    exec.on_running();

    let later = Instant::now() + Duration::from_millis(50);
    assert_eq!(exec.check_timeout(later), TimeoutCheck::Kill);
    assert!(matches!(
      exec.request_kill(KillReason::Timeout),
      KillAction::SendToWorker { .. }
    ));
    assert_eq!(exec.on_killed(), Some(TaskState::Timeout));
  }

  #[test]
  fn test_timeout_warn_strategy_warns_once() {
    let mut exec = TaskExecutor::new("i1", &node(Some((10, TimeoutStrategy::Warn))), 1, false);
    exec.mark_dispatched();
    exec.on_running();

    let later = Instant::now() + Duration::from_millis(50);
    assert_eq!(exec.check_timeout(later), TimeoutCheck::Warn);
    assert_eq!(exec.check_timeout(later), TimeoutCheck::WithinLimit);
    assert_eq!(exec.on_result(0, HashMap::new(), None), Some(TaskState::Success));
  }

  #[test]
  fn test_not_running_never_times_out() {
    let mut exec = TaskExecutor::new("i1", &node(Some((10, TimeoutStrategy::Failed))), 1, false);
    exec.mark_dispatched();
    let later = Instant::now() + Duration::from_secs(5);
    assert_eq!(exec.check_timeout(later), TimeoutCheck::WithinLimit);
  }
}
