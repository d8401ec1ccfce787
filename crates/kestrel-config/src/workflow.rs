use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::edge::Edge;
use crate::task::TaskDef;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowDef {
  pub workflow_id: String,
  pub name: String,
  /// Defaults merged under the parameters supplied at trigger time.
  #[serde(default, skip_serializing_if = "HashMap::is_empty")]
  pub global_params: HashMap<String, serde_json::Value>,
  pub tasks: Vec<TaskDef>,
  #[serde(default)]
  pub edges: Vec<Edge>,
}

impl WorkflowDef {
  pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
    serde_json::from_str(json)
  }
}
