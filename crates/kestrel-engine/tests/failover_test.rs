//! Taking over instances left behind by a dead master.

mod common;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use common::{Harness, WAIT, outputs, shell, test_config, workflow};
use kestrel_config::{FailureStrategy, RunMode, TaskDef, WorkflowDef};
use kestrel_engine::{FailoverCoordinator, StaticMasterRegistry};
use kestrel_store::{
  MemoryStore, ParentRef, Store, TaskInstance, TaskState, WorkflowInstance, WorkflowState,
};
use kestrel_task::WorkerTaskStatus;
use kestrel_workflow::Workflow;
use serde_json::json;

const DEAD: &str = "dead-master";

fn orphan(instance_id: &str, def: WorkflowDef, owner: &str) -> WorkflowInstance {
  let workflow = Workflow::lock(def).unwrap();
  WorkflowInstance {
    instance_id: instance_id.to_string(),
    workflow_id: workflow.workflow_id.clone(),
    global_params: workflow.global_params.clone(),
    workflow,
    var_pool: HashMap::new(),
    state: WorkflowState::Running,
    failure_strategy: FailureStrategy::EndOnFailure,
    run_mode: RunMode::Serial,
    owner: owner.to_string(),
    parent: None,
    halted_reason: None,
    created_at: Utc::now(),
    started_at: Some(Utc::now()),
    ended_at: None,
  }
}

fn attempt(
  instance_id: &str,
  node_id: &str,
  task_type: &str,
  attempt: u32,
  state: TaskState,
) -> TaskInstance {
  TaskInstance {
    task_instance_id: format!("{instance_id}-{node_id}-{attempt}"),
    instance_id: instance_id.to_string(),
    node_id: node_id.to_string(),
    task_type: task_type.to_string(),
    attempt,
    state,
    worker: Some("worker-1".to_string()),
    submitted_at: Utc::now(),
    started_at: Some(Utc::now()),
    ended_at: state.is_terminal().then(Utc::now),
    exit_code: (state == TaskState::Success).then_some(0),
    outputs: HashMap::new(),
    error: None,
    pruned: Vec::new(),
  }
}

async fn seed(store: &MemoryStore, instance: &WorkflowInstance, tasks: &[TaskInstance]) {
  store.create_instance(instance).await.unwrap();
  for task in tasks {
    store.create_task_instance(task).await.unwrap();
  }
}

fn coordinator(h: &Harness, alive: &[&str]) -> FailoverCoordinator {
  let masters = StaticMasterRegistry::new(alive.iter().copied());
  FailoverCoordinator::new(&h.engine, Arc::new(masters))
}

fn etl() -> WorkflowDef {
  workflow("etl", vec![shell("a"), shell("b")], &[("a", "b")])
}

#[tokio::test]
async fn test_running_attempt_is_adopted_without_redispatch() {
  let store = Arc::new(MemoryStore::new());
  let h = Harness::with_store(test_config("m1"), store.clone());

  let instance = orphan("wf-1", etl(), DEAD);
  let running = attempt("wf-1", "a", "shell", 1, TaskState::Running);
  seed(&store, &instance, std::slice::from_ref(&running)).await;
  h.worker.set_status(
    &running.task_instance_id,
    WorkerTaskStatus::Running {
      worker: "worker-1".to_string(),
    },
  );

  let recovered = coordinator(&h, &["m1"]).recover_orphans().await.unwrap();
  assert_eq!(recovered, vec!["wf-1"]);
  assert_eq!(store.get_instance("wf-1").await.unwrap().owner, "m1");

  h.worker
    .complete("wf-1", &running.task_instance_id, 0)
    .await;
  assert_eq!(h.wait("wf-1").await, WorkflowState::Success);
  assert_eq!(h.worker.dispatch_count("a"), 0);
  assert_eq!(h.worker.dispatch_count("b"), 1);

  let tasks = store.list_task_instances("wf-1").await.unwrap();
  let a = tasks.iter().find(|t| t.node_id == "a").unwrap();
  assert_eq!(a.attempt, 1);
  assert_eq!(a.state, TaskState::Success);
}

#[tokio::test]
async fn test_result_reported_during_failover_is_applied() {
  let store = Arc::new(MemoryStore::new());
  let h = Harness::with_store(test_config("m1"), store.clone());

  let instance = orphan("wf-1", etl(), DEAD);
  let dispatched = attempt("wf-1", "a", "shell", 1, TaskState::Dispatched);
  seed(&store, &instance, std::slice::from_ref(&dispatched)).await;
  h.worker.set_status(
    &dispatched.task_instance_id,
    WorkerTaskStatus::Finished {
      exit_code: 0,
      outputs: outputs(&[("rows", json!(7))]),
    },
  );

  coordinator(&h, &[]).recover_orphans().await.unwrap();

  assert_eq!(h.wait("wf-1").await, WorkflowState::Success);
  assert_eq!(h.worker.dispatch_count("a"), 0);
  let b = h.worker.last_dispatch("b").unwrap();
  assert_eq!(b.variables["rows"], json!(7));
}

#[tokio::test]
async fn test_attempt_on_dead_worker_is_retried() {
  let store = Arc::new(MemoryStore::new());
  let h = Harness::with_store(test_config("m1"), store.clone());

  let def = workflow("etl", vec![shell("a").with_retry(1, 10)], &[]);
  let instance = orphan("wf-1", def, DEAD);
  let lost = attempt("wf-1", "a", "shell", 1, TaskState::Running);
  seed(&store, &instance, std::slice::from_ref(&lost)).await;
  h.worker
    .set_status(&lost.task_instance_id, WorkerTaskStatus::WorkerDead);

  coordinator(&h, &[]).recover_orphans().await.unwrap();

  assert_eq!(h.wait("wf-1").await, WorkflowState::Success);
  assert_eq!(h.worker.last_dispatch("a").unwrap().attempt, 2);

  let mut tasks = store.list_task_instances("wf-1").await.unwrap();
  tasks.sort_by_key(|t| t.attempt);
  assert_eq!(tasks[0].state, TaskState::Failure);
  assert!(tasks[0].error.as_deref().unwrap().contains("worker died"));
  assert_eq!(tasks[1].state, TaskState::Success);
}

#[tokio::test]
async fn test_finished_nodes_are_not_rerun() {
  let store = Arc::new(MemoryStore::new());
  let h = Harness::with_store(test_config("m1"), store.clone());

  // Left over from a previous run of this same master.
  let instance = orphan("wf-1", etl(), "m1");
  let mut done = attempt("wf-1", "a", "shell", 1, TaskState::Success);
  done.outputs = outputs(&[("day", json!("2024-01-01"))]);
  seed(&store, &instance, &[done]).await;

  let recovered = coordinator(&h, &["m1"]).recover_orphans().await.unwrap();
  assert_eq!(recovered, vec!["wf-1"]);

  assert_eq!(h.wait("wf-1").await, WorkflowState::Success);
  assert_eq!(h.worker.dispatched_nodes(), vec!["b"]);
  assert_eq!(
    h.worker.last_dispatch("b").unwrap().variables["day"],
    json!("2024-01-01")
  );
}

#[tokio::test]
async fn test_instances_of_alive_masters_are_left_alone() {
  let store = Arc::new(MemoryStore::new());
  let h = Harness::with_store(test_config("m1"), store.clone());

  let instance = orphan("wf-1", etl(), "m2");
  seed(&store, &instance, &[]).await;

  let recovered = coordinator(&h, &["m1", "m2"]).recover_orphans().await.unwrap();
  assert!(recovered.is_empty());
  assert!(h.engine.handle("wf-1").is_none());
  assert_eq!(store.get_instance("wf-1").await.unwrap().owner, "m2");
}

#[tokio::test]
async fn test_running_instances_of_this_master_are_not_orphans() {
  let h = Harness::new(test_config("m1"));
  h.worker.script("a", common::Behavior::Hang);

  let id = h.run(etl(), FailureStrategy::EndOnFailure).await;
  h.worker.wait_for_dispatch("a", 1).await;

  let recovered = coordinator(&h, &["m1"]).recover_orphans().await.unwrap();
  assert!(recovered.is_empty());

  h.worker.finish("a", 0).await;
  assert_eq!(h.wait(&id).await, WorkflowState::Success);
  assert_eq!(h.worker.dispatch_count("a"), 1);
}

#[tokio::test]
async fn test_child_is_recovered_through_its_parent() {
  let store = Arc::new(MemoryStore::new());
  let h = Harness::with_store(test_config("m1"), store.clone());

  let child_def = workflow("child", vec![shell("c1")], &[]);
  let parent_def = workflow(
    "parent",
    vec![
      TaskDef::new("sub", "sub_workflow").with_params(json!({ "workflow": child_def.clone() })),
      shell("after"),
    ],
    &[("sub", "after")],
  );

  let parent = orphan("parent-1", parent_def, DEAD);
  let sub = attempt("parent-1", "sub", "sub_workflow", 1, TaskState::Running);
  seed(&store, &parent, std::slice::from_ref(&sub)).await;

  let mut child = orphan("child-1", child_def, DEAD);
  child.parent = Some(ParentRef {
    instance_id: "parent-1".to_string(),
    task_instance_id: sub.task_instance_id.clone(),
    node_id: "sub".to_string(),
  });
  let c1 = attempt("child-1", "c1", "shell", 1, TaskState::Running);
  seed(&store, &child, std::slice::from_ref(&c1)).await;
  h.worker.set_status(
    &c1.task_instance_id,
    WorkerTaskStatus::Running {
      worker: "worker-1".to_string(),
    },
  );

  let recovered = coordinator(&h, &["m1"]).recover_orphans().await.unwrap();
  assert_eq!(recovered, vec!["parent-1"]);

  tokio::time::timeout(WAIT, async {
    while h.engine.handle("child-1").is_none() {
      tokio::time::sleep(Duration::from_millis(5)).await;
    }
  })
  .await
  .expect("parent did not reattach to its child");
  assert_eq!(store.get_instance("child-1").await.unwrap().owner, "m1");

  h.worker.complete("child-1", &c1.task_instance_id, 0).await;

  assert_eq!(h.wait("parent-1").await, WorkflowState::Success);
  assert_eq!(h.wait("child-1").await, WorkflowState::Success);
  assert_eq!(h.worker.dispatch_count("c1"), 0);
  assert_eq!(h.worker.dispatch_count("after"), 1);
  assert_eq!(store.list_instances("child").await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_paused_instance_is_recovered_paused() {
  let store = Arc::new(MemoryStore::new());
  let h = Harness::with_store(test_config("m1"), store.clone());

  let mut instance = orphan("wf-1", etl(), DEAD);
  instance.state = WorkflowState::Pause;
  seed(&store, &instance, &[]).await;

  let recovered = coordinator(&h, &[]).recover_orphans().await.unwrap();
  assert_eq!(recovered, vec!["wf-1"]);
  tokio::time::sleep(Duration::from_millis(50)).await;

  assert!(h.worker.dispatched_nodes().is_empty());
  assert_eq!(h.engine.handle("wf-1").unwrap().state(), WorkflowState::Pause);
  let paused = store.get_instance("wf-1").await.unwrap();
  assert_eq!(paused.state, WorkflowState::Pause);
  assert_eq!(paused.owner, "m1");

  h.engine.recover("wf-1").await.unwrap();
  assert_eq!(h.wait("wf-1").await, WorkflowState::Success);
  assert_eq!(h.worker.dispatched_nodes(), vec!["a", "b"]);
}

#[tokio::test]
async fn test_stop_before_admission_kills_recovered_attempts() {
  let store = Arc::new(MemoryStore::new());
  let config = kestrel_config::MasterConfig {
    max_concurrent_workflows: 1,
    ..test_config("m1")
  };
  let h = Harness::with_store(config, store.clone());
  h.worker.script("hold", common::Behavior::Hang);

  let holder = h
    .run(workflow("holder", vec![shell("hold")], &[]), FailureStrategy::EndOnFailure)
    .await;
  h.worker.wait_for_dispatch("hold", 1).await;

  let instance = orphan("wf-1", etl(), DEAD);
  let running = attempt("wf-1", "a", "shell", 1, TaskState::Running);
  seed(&store, &instance, std::slice::from_ref(&running)).await;
  h.worker.set_status(
    &running.task_instance_id,
    WorkerTaskStatus::Running {
      worker: "worker-1".to_string(),
    },
  );

  let recovered = coordinator(&h, &["m1"]).recover_orphans().await.unwrap();
  assert_eq!(recovered, vec!["wf-1"]);
  h.engine.stop("wf-1").await.unwrap();

  assert_eq!(h.wait("wf-1").await, WorkflowState::Stop);
  assert!(h.worker.kills().contains(&running.task_instance_id));
  assert_eq!(h.worker.dispatch_count("a"), 0);
  assert_eq!(h.worker.dispatch_count("b"), 0);

  let tasks = store.list_task_instances("wf-1").await.unwrap();
  assert_eq!(tasks.len(), 1);
  assert_eq!(tasks[0].state, TaskState::Killed);

  h.worker.finish("hold", 0).await;
  assert_eq!(h.wait(&holder).await, WorkflowState::Success);
}
