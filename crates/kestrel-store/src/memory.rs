use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::types::{TaskInstance, WorkflowInstance};
use crate::{Store, StoreError};

#[derive(Default)]
struct Tables {
  instances: HashMap<String, (u64, WorkflowInstance)>,
  tasks: HashMap<String, (u64, TaskInstance)>,
  next_seq: u64,
}

impl Tables {
  fn seq(&mut self) -> u64 {
    self.next_seq += 1;
    self.next_seq
  }
}

/// In-process [`Store`] backed by hash maps.
///
/// Shared between engines in the same process it stands in for a database,
/// which is how failover is exercised in tests.
#[derive(Default)]
pub struct MemoryStore {
  tables: RwLock<Tables>,
  failing_writes: AtomicU32,
}

impl MemoryStore {
  pub fn new() -> Self {
    Self::default()
  }

  /// Make the next `count` writes fail with [`StoreError::Unavailable`].
  pub fn fail_next_writes(&self, count: u32) {
    self.failing_writes.store(count, Ordering::SeqCst);
  }

  fn check_write(&self) -> Result<(), StoreError> {
    let failed = self
      .failing_writes
      .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
    match failed {
      Ok(_) => Err(StoreError::Unavailable {
        message: "injected write failure".to_string(),
      }),
      Err(_) => Ok(()),
    }
  }
}

fn sorted<T: Clone>(mut rows: Vec<&(u64, T)>) -> Vec<T> {
  rows.sort_by_key(|(seq, _)| *seq);
  rows.into_iter().map(|(_, row)| row.clone()).collect()
}

#[async_trait]
impl Store for MemoryStore {
  async fn create_instance(&self, instance: &WorkflowInstance) -> Result<(), StoreError> {
    self.check_write()?;
    let mut tables = self.tables.write().await;
    if tables.instances.contains_key(&instance.instance_id) {
      return Err(StoreError::AlreadyExists(instance.instance_id.clone()));
    }
    let seq = tables.seq();
    tables
      .instances
      .insert(instance.instance_id.clone(), (seq, instance.clone()));
    Ok(())
  }

  async fn get_instance(&self, instance_id: &str) -> Result<WorkflowInstance, StoreError> {
    let tables = self.tables.read().await;
    tables
      .instances
      .get(instance_id)
      .map(|(_, instance)| instance.clone())
      .ok_or_else(|| StoreError::NotFound(format!("workflow instance {instance_id}")))
  }

  async fn update_instance(&self, instance: &WorkflowInstance) -> Result<(), StoreError> {
    self.check_write()?;
    let mut tables = self.tables.write().await;
    let entry = tables
      .instances
      .get_mut(&instance.instance_id)
      .ok_or_else(|| StoreError::NotFound(format!("workflow instance {}", instance.instance_id)))?;
    entry.1 = instance.clone();
    Ok(())
  }

  async fn list_instances(&self, workflow_id: &str) -> Result<Vec<WorkflowInstance>, StoreError> {
    let tables = self.tables.read().await;
    Ok(sorted(
      tables
        .instances
        .values()
        .filter(|(_, instance)| instance.workflow_id == workflow_id)
        .collect(),
    ))
  }

  async fn list_unfinished_instances(&self) -> Result<Vec<WorkflowInstance>, StoreError> {
    let tables = self.tables.read().await;
    Ok(sorted(
      tables
        .instances
        .values()
        .filter(|(_, instance)| !instance.state.is_terminal())
        .collect(),
    ))
  }

  async fn claim_instance(
    &self,
    instance_id: &str,
    expected_owner: &str,
    new_owner: &str,
  ) -> Result<bool, StoreError> {
    self.check_write()?;
    let mut tables = self.tables.write().await;
    let (_, instance) = tables
      .instances
      .get_mut(instance_id)
      .ok_or_else(|| StoreError::NotFound(format!("workflow instance {instance_id}")))?;
    if instance.owner != expected_owner {
      return Ok(false);
    }
    instance.owner = new_owner.to_string();
    Ok(true)
  }

  async fn find_child_instance(
    &self,
    parent_task_instance_id: &str,
  ) -> Result<Option<WorkflowInstance>, StoreError> {
    let tables = self.tables.read().await;
    Ok(
      tables
        .instances
        .values()
        .map(|(_, instance)| instance)
        .find(|instance| {
          instance
            .parent
            .as_ref()
            .is_some_and(|parent| parent.task_instance_id == parent_task_instance_id)
        })
        .cloned(),
    )
  }

  async fn create_task_instance(&self, task: &TaskInstance) -> Result<(), StoreError> {
    self.check_write()?;
    let mut tables = self.tables.write().await;
    if tables.tasks.contains_key(&task.task_instance_id) {
      return Err(StoreError::AlreadyExists(task.task_instance_id.clone()));
    }
    let seq = tables.seq();
    tables
      .tasks
      .insert(task.task_instance_id.clone(), (seq, task.clone()));
    Ok(())
  }

  async fn get_task_instance(&self, task_instance_id: &str) -> Result<TaskInstance, StoreError> {
    let tables = self.tables.read().await;
    tables
      .tasks
      .get(task_instance_id)
      .map(|(_, task)| task.clone())
      .ok_or_else(|| StoreError::NotFound(format!("task instance {task_instance_id}")))
  }

  async fn update_task_instance(&self, task: &TaskInstance) -> Result<(), StoreError> {
    self.check_write()?;
    let mut tables = self.tables.write().await;
    let entry = tables
      .tasks
      .get_mut(&task.task_instance_id)
      .ok_or_else(|| StoreError::NotFound(format!("task instance {}", task.task_instance_id)))?;
    entry.1 = task.clone();
    Ok(())
  }

  async fn list_task_instances(&self, instance_id: &str) -> Result<Vec<TaskInstance>, StoreError> {
    let tables = self.tables.read().await;
    Ok(sorted(
      tables
        .tasks
        .values()
        .filter(|(_, task)| task.instance_id == instance_id)
        .collect(),
    ))
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::types::{ParentRef, TaskState, WorkflowState};
  use chrono::Utc;
  use kestrel_config::{FailureStrategy, RunMode, TaskDef, WorkflowDef};
  use kestrel_workflow::Workflow;

  fn instance(id: &str, owner: &str) -> WorkflowInstance {
    let workflow = Workflow::lock(WorkflowDef {
      workflow_id: "wf".to_string(),
      name: "wf".to_string(),
      global_params: HashMap::new(),
      tasks: vec![TaskDef::new("a", "shell")],
      edges: vec![],
    })
    .unwrap();
    WorkflowInstance {
      instance_id: id.to_string(),
      workflow_id: "wf".to_string(),
      workflow,
      global_params: HashMap::new(),
      var_pool: HashMap::new(),
      state: WorkflowState::Running,
      failure_strategy: FailureStrategy::EndOnFailure,
      run_mode: RunMode::Serial,
      owner: owner.to_string(),
      parent: None,
      halted_reason: None,
      created_at: Utc::now(),
      started_at: None,
      ended_at: None,
    }
  }

  fn task(id: &str, instance_id: &str, attempt: u32) -> TaskInstance {
    TaskInstance {
      task_instance_id: id.to_string(),
      instance_id: instance_id.to_string(),
      node_id: "a".to_string(),
      task_type: "shell".to_string(),
      attempt,
      state: TaskState::Submitted,
      worker: None,
      submitted_at: Utc::now(),
      started_at: None,
      ended_at: None,
      exit_code: None,
      outputs: HashMap::new(),
      error: None,
      pruned: vec![],
    }
  }

  #[tokio::test]
  async fn test_instance_lifecycle() {
    let store = MemoryStore::new();
    let mut inst = instance("i1", "m1");
    store.create_instance(&inst).await.unwrap();
    assert!(matches!(
      store.create_instance(&inst).await,
      Err(StoreError::AlreadyExists(_))
    ));

    assert_eq!(store.list_unfinished_instances().await.unwrap().len(), 1);

    inst.state = WorkflowState::Success;
    store.update_instance(&inst).await.unwrap();
    assert_eq!(
      store.get_instance("i1").await.unwrap().state,
      WorkflowState::Success
    );
    assert!(store.list_unfinished_instances().await.unwrap().is_empty());
  }

  #[tokio::test]
  async fn test_claim_is_compare_and_set() {
    let store = MemoryStore::new();
    store.create_instance(&instance("i1", "dead")).await.unwrap();

    assert!(store.claim_instance("i1", "dead", "m2").await.unwrap());
    assert!(!store.claim_instance("i1", "dead", "m3").await.unwrap());
    assert_eq!(store.get_instance("i1").await.unwrap().owner, "m2");
  }

  #[tokio::test]
  async fn test_task_instances_keep_creation_order() {
    let store = MemoryStore::new();
    for (id, attempt) in [("t2", 1), ("t1", 2), ("t3", 3)] {
      store.create_task_instance(&task(id, "i1", attempt)).await.unwrap();
    }
    store.create_task_instance(&task("other", "i2", 1)).await.unwrap();

    let attempts: Vec<u32> = store
      .list_task_instances("i1")
      .await
      .unwrap()
      .iter()
      .map(|t| t.attempt)
      .collect();
    assert_eq!(attempts, [1, 2, 3]);
  }

  #[tokio::test]
  async fn test_find_child_instance() {
    let store = MemoryStore::new();
    let mut child = instance("child", "m1");
    child.parent = Some(ParentRef {
      instance_id: "parent".to_string(),
      task_instance_id: "t-sub".to_string(),
      node_id: "sub".to_string(),
    });
    store.create_instance(&child).await.unwrap();

    let found = store.find_child_instance("t-sub").await.unwrap();
    assert_eq!(found.map(|i| i.instance_id), Some("child".to_string()));
    assert!(store.find_child_instance("t-other").await.unwrap().is_none());
  }

  #[tokio::test]
  async fn test_injected_write_failures() {
    let store = MemoryStore::new();
    store.fail_next_writes(1);
    assert!(matches!(
      store.create_instance(&instance("i1", "m1")).await,
      Err(StoreError::Unavailable { .. })
    ));
    store.create_instance(&instance("i1", "m1")).await.unwrap();
  }
}
