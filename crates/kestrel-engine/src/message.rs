use kestrel_task::TaskEvent;

use crate::logic::LogicOutcome;

/// Control commands accepted by an instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
  Pause,
  Stop,
  /// Resume from `PAUSE`.
  Recover,
}

/// Everything an instance's event loop consumes.
#[derive(Debug)]
pub(crate) enum WorkflowEvent {
  Task(TaskEvent),
  Command(Command),
  /// A node's retry interval elapsed.
  RetryDue { node_id: String },
  LogicFinished {
    task_instance_id: String,
    outcome: LogicOutcome,
  },
  /// The kill wait of an attempt elapsed.
  KillDeadline { task_instance_id: String },
  TimeoutSweep,
  /// An attempt reached a terminal state inside the loop itself.
  AttemptEnded { task_instance_id: String },
}
