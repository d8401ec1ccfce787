use std::collections::{BTreeMap, BTreeSet, HashSet};

/// Graph structure for traversal and analysis.
///
/// Every list is sorted by node id so that traversal is reproducible.
#[derive(Debug, Clone)]
pub struct Graph {
  /// Adjacency list: node_id -> list of downstream node_ids.
  adjacency: BTreeMap<String, Vec<String>>,
  /// Reverse adjacency: node_id -> list of upstream node_ids.
  reverse_adjacency: BTreeMap<String, Vec<String>>,
  /// Nodes with no incoming edges.
  entry_points: Vec<String>,
  /// Nodes with multiple incoming edges (join points).
  join_points: HashSet<String>,
}

impl Graph {
  /// Build a graph from nodes and edges.
  ///
  /// Edges are assumed to reference known nodes; `Workflow::lock` checks that.
  pub fn new<'a>(
    node_ids: impl IntoIterator<Item = &'a String>,
    edges: &[(String, String)],
  ) -> Self {
    let mut adjacency: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
    let mut reverse_adjacency: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();

    for node_id in node_ids {
      adjacency.entry(node_id.clone()).or_default();
      reverse_adjacency.entry(node_id.clone()).or_default();
    }

    for (from, to) in edges {
      adjacency.entry(from.clone()).or_default().insert(to.clone());
      reverse_adjacency
        .entry(to.clone())
        .or_default()
        .insert(from.clone());
    }

    let entry_points: Vec<String> = reverse_adjacency
      .iter()
      .filter(|(_, incoming)| incoming.is_empty())
      .map(|(id, _)| id.clone())
      .collect();

    let join_points: HashSet<String> = reverse_adjacency
      .iter()
      .filter(|(_, incoming)| incoming.len() > 1)
      .map(|(id, _)| id.clone())
      .collect();

    let flatten = |map: BTreeMap<String, BTreeSet<String>>| {
      map
        .into_iter()
        .map(|(id, set)| (id, set.into_iter().collect()))
        .collect()
    };

    Self {
      adjacency: flatten(adjacency),
      reverse_adjacency: flatten(reverse_adjacency),
      entry_points,
      join_points,
    }
  }

  /// Get entry points (nodes with no incoming edges).
  pub fn entry_points(&self) -> &[String] {
    &self.entry_points
  }

  /// All node ids in ascending order.
  pub fn node_ids(&self) -> impl Iterator<Item = &String> {
    self.adjacency.keys()
  }

  pub fn len(&self) -> usize {
    self.adjacency.len()
  }

  pub fn is_empty(&self) -> bool {
    self.adjacency.is_empty()
  }

  pub fn contains(&self, node_id: &str) -> bool {
    self.adjacency.contains_key(node_id)
  }

  /// Get downstream nodes for a given node.
  pub fn downstream(&self, node_id: &str) -> &[String] {
    self
      .adjacency
      .get(node_id)
      .map(|v| v.as_slice())
      .unwrap_or(&[])
  }

  /// Get upstream nodes for a given node.
  pub fn upstream(&self, node_id: &str) -> &[String] {
    self
      .reverse_adjacency
      .get(node_id)
      .map(|v| v.as_slice())
      .unwrap_or(&[])
  }

  /// Check if a node is a join point (has multiple incoming edges).
  pub fn is_join_point(&self, node_id: &str) -> bool {
    self.join_points.contains(node_id)
  }

  /// Topological order using Kahn's algorithm, smallest ready id first.
  ///
  /// Returns the nodes left on a cycle as the error value.
  pub fn topological_order(&self) -> Result<Vec<String>, Vec<String>> {
    let mut in_degree: BTreeMap<&str, usize> = self
      .reverse_adjacency
      .iter()
      .map(|(id, upstream)| (id.as_str(), upstream.len()))
      .collect();

    let mut ready: BTreeSet<&str> = in_degree
      .iter()
      .filter(|(_, degree)| **degree == 0)
      .map(|(id, _)| *id)
      .collect();

    let mut sorted = Vec::with_capacity(self.len());
    while let Some(node_id) = ready.pop_first() {
      sorted.push(node_id.to_string());
      for next in self.downstream(node_id) {
        if let Some(degree) = in_degree.get_mut(next.as_str()) {
          *degree -= 1;
          if *degree == 0 {
            ready.insert(next.as_str());
          }
        }
      }
    }

    if sorted.len() == self.len() {
      Ok(sorted)
    } else {
      Err(
        in_degree
          .into_iter()
          .filter(|(_, degree)| *degree > 0)
          .map(|(id, _)| id.to_string())
          .collect(),
      )
    }
  }
}
