//! Execution events and notifiers for observability.
//!
//! Events are emitted as instances move through their lifecycle so that
//! consumers can alert on completion, stream progress to a UI, or assert
//! ordering in tests.

use kestrel_store::{TaskState, WorkflowState};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

/// Events emitted during workflow execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ExecutionEvent {
  /// An instance entered `RUNNING`, either fresh or after recovery.
  WorkflowStarted {
    instance_id: String,
    workflow_id: String,
    recovered: bool,
  },

  /// An instance drained its in-flight tasks and entered `PAUSE`.
  WorkflowPaused { instance_id: String },

  /// An instance reached a terminal state and it was persisted.
  WorkflowFinished {
    instance_id: String,
    workflow_id: String,
    state: WorkflowState,
  },

  /// An instance was halted after an internal invariant violation.
  WorkflowHalted { instance_id: String, reason: String },

  /// A terminal state could not be persisted; the instance stays registered.
  PersistenceFailed { instance_id: String, error: String },

  /// An attempt was handed to a worker (or started in the master).
  TaskDispatched {
    instance_id: String,
    node_id: String,
    task_instance_id: String,
    attempt: u32,
  },

  /// An attempt reached a terminal state.
  TaskFinished {
    instance_id: String,
    node_id: String,
    task_instance_id: String,
    state: TaskState,
  },

  /// A failed attempt will be retried after the node's interval.
  TaskRetrying {
    instance_id: String,
    node_id: String,
    next_attempt: u32,
  },

  /// An attempt ran past its timeout under the `warn` strategy.
  TaskTimeoutWarning {
    instance_id: String,
    node_id: String,
    task_instance_id: String,
  },

  /// A node was pruned and will never run.
  NodeSkipped { instance_id: String, node_id: String },
}

/// Trait for receiving execution events.
///
/// The engine calls `notify` for each event - implementations decide
/// what to do with them (alert, broadcast, log, ignore, etc.).
pub trait ExecutionNotifier: Send + Sync {
  /// Called when an execution event occurs.
  fn notify(&self, event: ExecutionEvent);
}

/// A no-op notifier that discards all events.
#[derive(Debug, Clone, Default)]
pub struct NoopNotifier;

impl ExecutionNotifier for NoopNotifier {
  fn notify(&self, _event: ExecutionEvent) {}
}

/// A notifier that sends events to an unbounded channel.
///
/// Unbounded so that a slow consumer never stalls an instance's event loop.
#[derive(Debug, Clone)]
pub struct ChannelNotifier {
  sender: mpsc::UnboundedSender<ExecutionEvent>,
}

impl ChannelNotifier {
  /// Create a new channel notifier.
  pub fn new(sender: mpsc::UnboundedSender<ExecutionEvent>) -> Self {
    Self { sender }
  }
}

impl ExecutionNotifier for ChannelNotifier {
  fn notify(&self, event: ExecutionEvent) {
    // Ignore send errors - receiver may have been dropped
    let _ = self.sender.send(event);
  }
}
