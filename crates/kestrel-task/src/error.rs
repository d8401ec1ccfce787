use thiserror::Error;

/// Errors raised by a task plugin while running an attempt.
#[derive(Debug, Error)]
pub enum TaskError {
  /// Missing required parameter.
  #[error("missing required parameter: {field}")]
  MissingParam { field: String },

  /// Invalid parameter value.
  #[error("invalid parameter '{field}': {message}")]
  InvalidParam { field: String, message: String },

  /// The plugin was driven out of order.
  #[error("task not submitted")]
  NotSubmitted,

  #[error("io error: {0}")]
  Io(#[from] std::io::Error),

  #[error("task failed: {message}")]
  Failed { message: String },
}

/// Errors raised while handing an attempt to a worker.
#[derive(Debug, Clone, Error)]
pub enum DispatchError {
  #[error("no plugin registered for task type '{task_type}'")]
  UnknownTaskType { task_type: String },

  #[error("worker unavailable: {message}")]
  WorkerUnavailable { message: String },

  #[error("task instance '{task_instance_id}' already dispatched")]
  AlreadyDispatched { task_instance_id: String },
}
