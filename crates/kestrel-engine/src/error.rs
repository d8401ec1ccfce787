use kestrel_config::ConfigError;
use kestrel_store::StoreError;
use kestrel_task::DispatchError;
use kestrel_workflow::WorkflowError;
use thiserror::Error;

/// Errors raised by the engine.
#[derive(Debug, Error)]
pub enum EngineError {
  /// The workflow definition was rejected; no instance was created.
  #[error("invalid workflow definition: {0}")]
  Definition(#[from] WorkflowError),

  #[error(transparent)]
  Config(#[from] ConfigError),

  #[error("store error: {0}")]
  Store(#[from] StoreError),

  #[error("dispatch error: {0}")]
  Dispatch(#[from] DispatchError),

  /// A logic task could not be built for its instance.
  #[error("failed to initialize logic task for instance '{instance_id}': {message}")]
  LogicTaskInitialize {
    instance_id: String,
    message: String,
  },

  /// A logic task failed while evaluating.
  #[error("logic task '{node_id}' failed: {message}")]
  Logic { node_id: String, message: String },

  /// An internal invariant broke; the instance must be halted.
  #[error("invariant violated in instance '{instance_id}': {message}")]
  InvariantViolation {
    instance_id: String,
    message: String,
  },

  #[error("workflow instance '{instance_id}' not found")]
  InstanceNotFound { instance_id: String },

  #[error("workflow instance '{instance_id}' is already registered")]
  AlreadyRegistered { instance_id: String },

  #[error("workflow instance '{instance_id}' was claimed by another master")]
  ClaimLost { instance_id: String },

  #[error("engine is shutting down")]
  Shutdown,
}
