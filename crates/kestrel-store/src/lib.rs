//! Kestrel Store
//!
//! This crate provides the storage contract for workflow instances and task
//! instances. Every state transition of an instance is written through a
//! [`Store`] before the engine considers it committed, and recovery after a
//! master failure is driven entirely by what the store returns.
//!
//! The [`Store`] trait defines operations for:
//! - Creating, updating and claiming workflow instances
//! - Creating and updating task instances (one per attempt)
//! - Querying unfinished instances and the latest instance of a workflow

mod memory;
mod types;

pub use memory::MemoryStore;
pub use types::{ParentRef, TaskInstance, TaskState, WorkflowInstance, WorkflowState};

use async_trait::async_trait;

/// Error type for storage operations.
#[derive(Debug, Clone, thiserror::Error)]
pub enum StoreError {
  /// The requested record was not found.
  #[error("not found: {0}")]
  NotFound(String),

  /// A record with the same id already exists.
  #[error("already exists: {0}")]
  AlreadyExists(String),

  /// The backend could not serve the request.
  #[error("store unavailable: {message}")]
  Unavailable { message: String },
}

/// Storage trait for workflow instances and task instances.
#[async_trait]
pub trait Store: Send + Sync {
  /// Create a new workflow instance.
  async fn create_instance(&self, instance: &WorkflowInstance) -> Result<(), StoreError>;

  /// Get a workflow instance by ID.
  async fn get_instance(&self, instance_id: &str) -> Result<WorkflowInstance, StoreError>;

  /// Replace a workflow instance.
  async fn update_instance(&self, instance: &WorkflowInstance) -> Result<(), StoreError>;

  /// List instances of a workflow, oldest first.
  async fn list_instances(&self, workflow_id: &str) -> Result<Vec<WorkflowInstance>, StoreError>;

  /// List instances that have not reached a terminal state.
  async fn list_unfinished_instances(&self) -> Result<Vec<WorkflowInstance>, StoreError>;

  /// Move ownership of an instance from `expected_owner` to `new_owner`.
  ///
  /// Returns `false` when the instance is owned by someone else, which
  /// means another master already claimed it.
  async fn claim_instance(
    &self,
    instance_id: &str,
    expected_owner: &str,
    new_owner: &str,
  ) -> Result<bool, StoreError>;

  /// Find the child instance started by a sub-workflow task instance.
  async fn find_child_instance(
    &self,
    parent_task_instance_id: &str,
  ) -> Result<Option<WorkflowInstance>, StoreError>;

  /// Create a new task instance.
  async fn create_task_instance(&self, task: &TaskInstance) -> Result<(), StoreError>;

  /// Get a task instance by ID.
  async fn get_task_instance(&self, task_instance_id: &str) -> Result<TaskInstance, StoreError>;

  /// Replace a task instance.
  async fn update_task_instance(&self, task: &TaskInstance) -> Result<(), StoreError>;

  /// List task instances of a workflow instance in creation order.
  async fn list_task_instances(&self, instance_id: &str) -> Result<Vec<TaskInstance>, StoreError>;
}
