use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use crate::error::TaskError;
use crate::types::TaskExecutionContext;

/// One task type as run on a worker.
///
/// The worker drives a plugin through `init`, `submit` and `track_status`,
/// then reads `outputs`. `cancel` may be called at any point after `init`.
#[async_trait]
pub trait TaskPlugin: Send {
  async fn init(&mut self, ctx: &TaskExecutionContext) -> Result<(), TaskError>;

  /// Start the payload without waiting for it.
  async fn submit(&mut self) -> Result<(), TaskError>;

  /// Wait for the payload and return its exit code.
  async fn track_status(&mut self) -> Result<i32, TaskError>;

  async fn cancel(&mut self) -> Result<(), TaskError>;

  /// Variables published for downstream tasks.
  fn outputs(&self) -> HashMap<String, serde_json::Value>;
}

/// Builds a fresh plugin for each attempt.
pub trait TaskPluginFactory: Send + Sync {
  fn task_type(&self) -> &str;

  fn create(&self) -> Box<dyn TaskPlugin>;
}

/// Task type key to plugin factory.
#[derive(Clone, Default)]
pub struct PluginRegistry {
  factories: HashMap<String, Arc<dyn TaskPluginFactory>>,
}

impl PluginRegistry {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn register(&mut self, factory: Arc<dyn TaskPluginFactory>) {
    self
      .factories
      .insert(factory.task_type().to_string(), factory);
  }

  pub fn with(mut self, factory: Arc<dyn TaskPluginFactory>) -> Self {
    self.register(factory);
    self
  }

  pub fn get(&self, task_type: &str) -> Option<Arc<dyn TaskPluginFactory>> {
    self.factories.get(task_type).cloned()
  }

  pub fn contains(&self, task_type: &str) -> bool {
    self.factories.contains_key(task_type)
  }
}
