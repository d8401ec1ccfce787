use std::collections::{HashMap, HashSet};

use kestrel_config::WorkflowDef;
use serde::{Deserialize, Serialize};

use crate::error::WorkflowError;
use crate::graph::Graph;
use crate::node::TaskNode;

/// A locked workflow ready for execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Workflow {
  pub workflow_id: String,
  pub name: String,
  pub global_params: HashMap<String, serde_json::Value>,
  pub nodes: HashMap<String, TaskNode>,
  pub edges: Vec<(String, String)>,
}

impl Workflow {
  /// Validate a definition and lock it.
  ///
  /// Rejects empty workflows, duplicate node ids, edges to unknown nodes,
  /// duplicate edges, graphs without an entry point and cycles.
  pub fn lock(def: WorkflowDef) -> Result<Self, WorkflowError> {
    if def.tasks.is_empty() {
      return Err(WorkflowError::Empty {
        workflow_id: def.workflow_id,
      });
    }

    let mut nodes: HashMap<String, TaskNode> = HashMap::with_capacity(def.tasks.len());
    for task in def.tasks {
      if nodes.contains_key(&task.node_id) {
        return Err(WorkflowError::DuplicateNode(task.node_id));
      }
      nodes.insert(task.node_id.clone(), TaskNode::from_def(task));
    }

    let mut seen: HashSet<(&str, &str)> = HashSet::new();
    for edge in &def.edges {
      if !nodes.contains_key(&edge.from) || !nodes.contains_key(&edge.to) {
        return Err(WorkflowError::InvalidEdge {
          from: edge.from.clone(),
          to: edge.to.clone(),
        });
      }
      if !seen.insert((edge.from.as_str(), edge.to.as_str())) {
        return Err(WorkflowError::DuplicateEdge {
          from: edge.from.clone(),
          to: edge.to.clone(),
        });
      }
    }

    let edges: Vec<(String, String)> = def
      .edges
      .into_iter()
      .map(|edge| (edge.from, edge.to))
      .collect();

    for (from, to) in &edges {
      if let Some(node) = nodes.get_mut(from) {
        node.downstream.insert(to.clone());
      }
      if let Some(node) = nodes.get_mut(to) {
        node.upstream.insert(from.clone());
      }
    }

    let workflow = Self {
      workflow_id: def.workflow_id,
      name: def.name,
      global_params: def.global_params,
      nodes,
      edges,
    };
    workflow.validate()?;
    Ok(workflow)
  }

  /// Check graph-level invariants of an already locked workflow.
  pub fn validate(&self) -> Result<(), WorkflowError> {
    for (from, to) in &self.edges {
      if !self.nodes.contains_key(from) || !self.nodes.contains_key(to) {
        return Err(WorkflowError::InvalidEdge {
          from: from.clone(),
          to: to.clone(),
        });
      }
    }
    let graph = self.graph();
    if graph.entry_points().is_empty() {
      return Err(WorkflowError::NoEntryPoints);
    }
    graph
      .topological_order()
      .map_err(|nodes| WorkflowError::CycleDetected { nodes })?;
    Ok(())
  }

  /// Build the graph structure for traversal.
  pub fn graph(&self) -> Graph {
    Graph::new(self.nodes.keys(), &self.edges)
  }

  /// Get a node by ID.
  pub fn get_node(&self, node_id: &str) -> Option<&TaskNode> {
    self.nodes.get(node_id)
  }

  pub fn node(&self, node_id: &str) -> Result<&TaskNode, WorkflowError> {
    self
      .nodes
      .get(node_id)
      .ok_or_else(|| WorkflowError::NodeNotFound(node_id.to_string()))
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use kestrel_config::{Edge, TaskDef};

  fn def(tasks: &[&str], edges: &[(&str, &str)]) -> WorkflowDef {
    WorkflowDef {
      workflow_id: "wf".to_string(),
      name: "wf".to_string(),
      global_params: HashMap::new(),
      tasks: tasks.iter().map(|id| TaskDef::new(*id, "shell")).collect(),
      edges: edges.iter().map(|(a, b)| Edge::new(*a, *b)).collect(),
    }
  }

  #[test]
  fn test_lock_derives_neighbour_sets() {
    let workflow = Workflow::lock(def(&["a", "b", "c"], &[("a", "b"), ("a", "c")])).unwrap();
    let a = workflow.node("a").unwrap();
    assert_eq!(a.downstream.iter().collect::<Vec<_>>(), ["b", "c"]);
    assert_eq!(a.name, "a");
    assert!(workflow.node("b").unwrap().upstream.contains("a"));
  }

  #[test]
  fn test_lock_rejects_duplicate_node() {
    let err = Workflow::lock(def(&["a", "a"], &[])).unwrap_err();
    assert_eq!(err, WorkflowError::DuplicateNode("a".to_string()));
  }

  #[test]
  fn test_lock_rejects_unknown_edge_target() {
    let err = Workflow::lock(def(&["a"], &[("a", "ghost")])).unwrap_err();
    assert!(matches!(err, WorkflowError::InvalidEdge { to, .. } if to == "ghost"));
  }

  #[test]
  fn test_lock_rejects_duplicate_edge() {
    let err = Workflow::lock(def(&["a", "b"], &[("a", "b"), ("a", "b")])).unwrap_err();
    assert!(matches!(err, WorkflowError::DuplicateEdge { .. }));
  }

  #[test]
  fn test_lock_rejects_cycle_without_entry() {
    let err = Workflow::lock(def(&["a", "b"], &[("a", "b"), ("b", "a")])).unwrap_err();
    assert_eq!(err, WorkflowError::NoEntryPoints);
  }

  #[test]
  fn test_lock_rejects_cycle_behind_entry() {
    let err = Workflow::lock(def(
      &["a", "b", "c"],
      &[("a", "b"), ("b", "c"), ("c", "b")],
    ))
    .unwrap_err();
    assert_eq!(
      err,
      WorkflowError::CycleDetected {
        nodes: vec!["b".to_string(), "c".to_string()]
      }
    );
  }

  #[test]
  fn test_lock_rejects_empty() {
    let err = Workflow::lock(def(&[], &[])).unwrap_err();
    assert!(matches!(err, WorkflowError::Empty { .. }));
  }
}
