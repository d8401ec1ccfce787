//! DAG scheduler.
//!
//! Pure bookkeeping over a locked workflow's graph: pending-upstream counts,
//! live and dead edges, and the priority-ordered ready queue. The scheduler
//! never performs I/O; the runnable asks it which node to dispatch next and
//! reports completions back.
//!
//! Pruning rule: when a node's last pending upstream resolves, it becomes
//! ready if at least one incoming edge is live and is skipped otherwise. A
//! skipped node kills all its outgoing edges, so pruning propagates through
//! every node whose only way forward was a pruned branch.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};

use kestrel_workflow::{Graph, Workflow};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Scheduling state of one node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeState {
  /// Some upstream nodes have not resolved yet.
  Waiting,
  /// Eligible for dispatch, waiting for a slot.
  Ready,
  /// Holds a slot: an attempt is in flight or in retry backoff.
  Active,
  Succeeded,
  Failed,
  /// Pruned by a branch decision; never dispatched.
  Skipped,
}

impl NodeState {
  pub fn is_resolved(self) -> bool {
    matches!(
      self,
      NodeState::Succeeded | NodeState::Failed | NodeState::Skipped
    )
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Completion {
  Success,
  Failure,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SchedulerError {
  #[error("node '{0}' is not part of the graph")]
  UnknownNode(String),

  #[error("node '{node_id}' cannot move from {from:?} to {to:?}")]
  IllegalTransition {
    node_id: String,
    from: NodeState,
    to: NodeState,
  },

  #[error("pending upstream count of node '{0}' went negative")]
  NegativePendingCount(String),

  #[error("node '{from}' pruned '{to}' which is not one of its downstream nodes")]
  PrunedNotDownstream { from: String, to: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct ReadyEntry {
  priority: i32,
  node_id: String,
}

impl Ord for ReadyEntry {
  fn cmp(&self, other: &Self) -> Ordering {
    // Max-heap: higher priority first, then the smaller node id.
    self
      .priority
      .cmp(&other.priority)
      .then_with(|| other.node_id.cmp(&self.node_id))
  }
}

impl PartialOrd for ReadyEntry {
  fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
    Some(self.cmp(other))
  }
}

/// What a completion changed beyond the completed node itself.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Released {
  /// Nodes that became ready.
  pub ready: Vec<String>,
  /// Nodes that were skipped, transitively.
  pub skipped: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct DagScheduler {
  graph: Graph,
  priorities: HashMap<String, i32>,
  pending: HashMap<String, i64>,
  live_inbound: HashMap<String, usize>,
  states: HashMap<String, NodeState>,
  ready: BinaryHeap<ReadyEntry>,
  active: usize,
  max_parallel: usize,
}

impl DagScheduler {
  /// Build the scheduler with every entry point ready.
  pub fn new(workflow: &Workflow, max_parallel: usize) -> Self {
    let graph = workflow.graph();
    let priorities = workflow
      .nodes
      .values()
      .map(|node| (node.node_id.clone(), node.priority))
      .collect();

    let mut scheduler = Self {
      pending: graph
        .node_ids()
        .map(|id| (id.clone(), graph.upstream(id).len() as i64))
        .collect(),
      live_inbound: graph.node_ids().map(|id| (id.clone(), 0)).collect(),
      states: graph
        .node_ids()
        .map(|id| (id.clone(), NodeState::Waiting))
        .collect(),
      graph,
      priorities,
      ready: BinaryHeap::new(),
      active: 0,
      max_parallel: max_parallel.max(1),
    };

    let entry_points = scheduler.graph.entry_points().to_vec();
    for node_id in entry_points {
      scheduler.make_ready(&node_id);
    }
    scheduler
  }

  pub fn graph(&self) -> &Graph {
    &self.graph
  }

  pub fn state(&self, node_id: &str) -> Option<NodeState> {
    self.states.get(node_id).copied()
  }

  pub fn states(&self) -> &HashMap<String, NodeState> {
    &self.states
  }

  /// Number of nodes holding a slot.
  pub fn active(&self) -> usize {
    self.active
  }

  pub fn max_parallel(&self) -> usize {
    self.max_parallel
  }

  pub fn has_free_slot(&self) -> bool {
    self.active < self.max_parallel
  }

  /// Ready nodes in dispatch order.
  pub fn ready_nodes(&self) -> Vec<String> {
    let mut entries: Vec<&ReadyEntry> = self
      .ready
      .iter()
      .filter(|entry| self.states.get(&entry.node_id) == Some(&NodeState::Ready))
      .collect();
    entries.sort_by(|a, b| b.cmp(a));
    entries.into_iter().map(|e| e.node_id.clone()).collect()
  }

  /// Take the next ready node if a slot is free, marking it active.
  pub fn next_dispatchable(&mut self) -> Option<String> {
    if !self.has_free_slot() {
      return None;
    }
    while let Some(entry) = self.ready.pop() {
      if self.states.get(&entry.node_id) == Some(&NodeState::Ready) {
        self.states.insert(entry.node_id.clone(), NodeState::Active);
        self.active += 1;
        return Some(entry.node_id);
      }
    }
    None
  }

  /// Mark a specific ready node active regardless of queue order or slots.
  ///
  /// Used when rebuilding state for attempts that are already in flight.
  pub fn activate(&mut self, node_id: &str) -> Result<(), SchedulerError> {
    self.transition(node_id, NodeState::Ready, NodeState::Active)?;
    self.active += 1;
    Ok(())
  }

  /// Resolve an active node and release its downstream edges.
  ///
  /// Edges to nodes in `pruned` become dead; every other edge is live. A
  /// failed node still releases its downstream nodes; whether they get
  /// dispatched is the caller's decision.
  pub fn complete(
    &mut self,
    node_id: &str,
    completion: Completion,
    pruned: &[String],
  ) -> Result<Released, SchedulerError> {
    let downstream = self.graph.downstream(node_id).to_vec();
    if let Some(to) = pruned.iter().find(|p| !downstream.contains(p)) {
      return Err(SchedulerError::PrunedNotDownstream {
        from: node_id.to_string(),
        to: to.clone(),
      });
    }

    let resolved = match completion {
      Completion::Success => NodeState::Succeeded,
      Completion::Failure => NodeState::Failed,
    };
    self.transition(node_id, NodeState::Active, resolved)?;
    self.active -= 1;

    let mut released = Released::default();
    let mut edges: Vec<(String, bool)> = downstream
      .into_iter()
      .map(|next| {
        let live = !pruned.contains(&next);
        (next, live)
      })
      .collect();
    // Stack of edges to release; skipping a node pushes its outgoing edges.
    edges.reverse();
    while let Some((next, live)) = edges.pop() {
      let pending = self
        .pending
        .get_mut(&next)
        .ok_or_else(|| SchedulerError::UnknownNode(next.clone()))?;
      *pending -= 1;
      if *pending < 0 {
        return Err(SchedulerError::NegativePendingCount(next));
      }
      let remaining = *pending;
      if live {
        *self.live_inbound.entry(next.clone()).or_default() += 1;
      }
      if remaining > 0 {
        continue;
      }

      if self.live_inbound.get(&next).copied().unwrap_or(0) > 0 {
        self.make_ready(&next);
        released.ready.push(next);
      } else {
        self.transition(&next, NodeState::Waiting, NodeState::Skipped)?;
        for after in self.graph.downstream(&next).iter().rev() {
          edges.push((after.clone(), false));
        }
        released.skipped.push(next);
      }
    }
    Ok(released)
  }

  /// Drop an active node without releasing its downstream nodes.
  ///
  /// Used when an attempt is killed by stop or halt; the instance is ending.
  pub fn abort(&mut self, node_id: &str) -> Result<(), SchedulerError> {
    self.transition(node_id, NodeState::Active, NodeState::Failed)?;
    self.active -= 1;
    Ok(())
  }

  /// Every node is resolved.
  pub fn is_complete(&self) -> bool {
    self.states.values().all(|state| state.is_resolved())
  }

  pub fn has_failures(&self) -> bool {
    self.states.values().any(|state| *state == NodeState::Failed)
  }

  pub fn has_ready(&self) -> bool {
    self
      .states
      .values()
      .any(|state| *state == NodeState::Ready)
  }

  fn make_ready(&mut self, node_id: &str) {
    self.states.insert(node_id.to_string(), NodeState::Ready);
    self.ready.push(ReadyEntry {
      priority: self.priorities.get(node_id).copied().unwrap_or_default(),
      node_id: node_id.to_string(),
    });
  }

  fn transition(
    &mut self,
    node_id: &str,
    from: NodeState,
    to: NodeState,
  ) -> Result<(), SchedulerError> {
    let state = self
      .states
      .get_mut(node_id)
      .ok_or_else(|| SchedulerError::UnknownNode(node_id.to_string()))?;
    if *state != from {
      return Err(SchedulerError::IllegalTransition {
        node_id: node_id.to_string(),
        from: *state,
        to,
      });
    }
    *state = to;
    Ok(())
  }
}
