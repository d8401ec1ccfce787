//! Failover: take over instances whose master died.
//!
//! An instance is an orphan when it is unfinished and either its owner is
//! not among the alive masters, or it is owned by this master but not
//! running here (left over from a previous incarnation). Children of
//! sub-workflow nodes are skipped while their parent is unfinished; the
//! parent's re-executed node reattaches to them.

use std::collections::HashSet;
use std::sync::{Arc, PoisonError, RwLock};

use async_trait::async_trait;
use kestrel_store::WorkflowInstance;
use tracing::{info, instrument, warn};

use crate::engine::{EngineContext, WorkflowEngine};
use crate::error::EngineError;

/// Membership view of the master fleet.
#[async_trait]
pub trait MasterRegistry: Send + Sync {
  async fn alive_masters(&self) -> Result<HashSet<String>, EngineError>;
}

/// A fixed, manually maintained set of alive masters.
#[derive(Debug, Default)]
pub struct StaticMasterRegistry {
  alive: RwLock<HashSet<String>>,
}

impl StaticMasterRegistry {
  pub fn new(alive: impl IntoIterator<Item = impl Into<String>>) -> Self {
    Self {
      alive: RwLock::new(alive.into_iter().map(Into::into).collect()),
    }
  }

  pub fn set_alive(&self, master_id: impl Into<String>) {
    self
      .alive
      .write()
      .unwrap_or_else(PoisonError::into_inner)
      .insert(master_id.into());
  }

  pub fn remove(&self, master_id: &str) {
    self
      .alive
      .write()
      .unwrap_or_else(PoisonError::into_inner)
      .remove(master_id);
  }
}

#[async_trait]
impl MasterRegistry for StaticMasterRegistry {
  async fn alive_masters(&self) -> Result<HashSet<String>, EngineError> {
    Ok(
      self
        .alive
        .read()
        .unwrap_or_else(PoisonError::into_inner)
        .clone(),
    )
  }
}

pub struct FailoverCoordinator {
  ctx: Arc<EngineContext>,
  masters: Arc<dyn MasterRegistry>,
}

impl FailoverCoordinator {
  pub fn new(engine: &WorkflowEngine, masters: Arc<dyn MasterRegistry>) -> Self {
    Self {
      ctx: engine.context().clone(),
      masters,
    }
  }

  /// Claim and restart every orphaned instance. Returns the recovered ids.
  ///
  /// An instance another master claimed first is skipped.
  #[instrument(name = "recover_orphans", skip(self), fields(master_id = %self.ctx.master_id()))]
  pub async fn recover_orphans(&self) -> Result<Vec<String>, EngineError> {
    let alive = self.masters.alive_masters().await?;
    let unfinished = self.ctx.store.list_unfinished_instances().await?;
    let unfinished_ids: HashSet<String> = unfinished
      .iter()
      .map(|i| i.instance_id.clone())
      .collect();

    let mut recovered = Vec::new();
    for instance in unfinished {
      if !self.is_orphan(&instance, &alive) {
        continue;
      }
      if let Some(parent) = &instance.parent {
        if unfinished_ids.contains(&parent.instance_id) {
          info!(
            instance_id = %instance.instance_id,
            parent_instance_id = %parent.instance_id,
            "child_left_to_parent"
          );
          continue;
        }
      }

      let instance_id = instance.instance_id.clone();
      match self.ctx.recover_instance(instance).await {
        Ok(_) => {
          info!(instance_id = %instance_id, "workflow_recovered");
          recovered.push(instance_id);
        }
        Err(EngineError::ClaimLost { .. }) => {
          warn!(instance_id = %instance_id, "workflow_claimed_elsewhere");
        }
        Err(e) => return Err(e),
      }
    }
    Ok(recovered)
  }

  fn is_orphan(&self, instance: &WorkflowInstance, alive: &HashSet<String>) -> bool {
    if instance.owner == self.ctx.master_id() {
      !self.ctx.repository.contains(&instance.instance_id)
    } else {
      !alive.contains(&instance.owner)
    }
  }
}
