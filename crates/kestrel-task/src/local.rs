use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument, warn};

use crate::error::{DispatchError, TaskError};
use crate::event::{TaskEvent, TaskEventKind};
use crate::plugin::{PluginRegistry, TaskPlugin};
use crate::types::{EXIT_CODE_FAILURE, EXIT_CODE_KILL, TaskExecutionContext};
use crate::worker::{WorkerClient, WorkerTaskStatus};

enum LocalTask {
  Running(CancellationToken),
  Finished {
    exit_code: i32,
    outputs: HashMap<String, serde_json::Value>,
  },
}

/// A worker that runs plugins on the local tokio runtime.
///
/// Events for every attempt are sent to the channel given at construction.
pub struct LocalWorker {
  worker_id: String,
  plugins: PluginRegistry,
  events: mpsc::Sender<TaskEvent>,
  tasks: Arc<Mutex<HashMap<String, LocalTask>>>,
}

impl LocalWorker {
  pub fn new(plugins: PluginRegistry, events: mpsc::Sender<TaskEvent>) -> Self {
    Self::with_worker_id("local", plugins, events)
  }

  pub fn with_worker_id(
    worker_id: impl Into<String>,
    plugins: PluginRegistry,
    events: mpsc::Sender<TaskEvent>,
  ) -> Self {
    Self {
      worker_id: worker_id.into(),
      plugins,
      events,
      tasks: Arc::new(Mutex::new(HashMap::new())),
    }
  }

  pub fn worker_id(&self) -> &str {
    &self.worker_id
  }
}

#[async_trait]
impl WorkerClient for LocalWorker {
  #[instrument(
    name = "local_dispatch",
    skip(self, ctx),
    fields(
      instance_id = %ctx.instance_id,
      task_instance_id = %ctx.task_instance_id,
      node_id = %ctx.node_id,
    )
  )]
  async fn dispatch(&self, ctx: TaskExecutionContext) -> Result<String, DispatchError> {
    let factory = self
      .plugins
      .get(&ctx.task_type)
      .ok_or_else(|| DispatchError::UnknownTaskType {
        task_type: ctx.task_type.clone(),
      })?;

    let cancel = CancellationToken::new();
    {
      let mut tasks = self.tasks.lock().unwrap_or_else(PoisonError::into_inner);
      if tasks.contains_key(&ctx.task_instance_id) {
        return Err(DispatchError::AlreadyDispatched {
          task_instance_id: ctx.task_instance_id.clone(),
        });
      }
      tasks.insert(
        ctx.task_instance_id.clone(),
        LocalTask::Running(cancel.clone()),
      );
    }

    let run = LocalRun {
      worker_id: self.worker_id.clone(),
      plugin: factory.create(),
      events: self.events.clone(),
      tasks: Arc::clone(&self.tasks),
    };
    tokio::spawn(run.run(ctx, cancel));

    Ok(self.worker_id.clone())
  }

  async fn kill(&self, _worker: Option<&str>, task_instance_id: &str) -> Result<(), DispatchError> {
    let tasks = self.tasks.lock().unwrap_or_else(PoisonError::into_inner);
    if let Some(LocalTask::Running(cancel)) = tasks.get(task_instance_id) {
      info!(task_instance_id, "cancelling local task");
      cancel.cancel();
    }
    Ok(())
  }

  async fn query(
    &self,
    worker: Option<&str>,
    task_instance_id: &str,
  ) -> Result<WorkerTaskStatus, DispatchError> {
    if worker.is_some_and(|w| w != self.worker_id) {
      return Ok(WorkerTaskStatus::WorkerDead);
    }
    let tasks = self.tasks.lock().unwrap_or_else(PoisonError::into_inner);
    Ok(match tasks.get(task_instance_id) {
      Some(LocalTask::Running(_)) => WorkerTaskStatus::Running {
        worker: self.worker_id.clone(),
      },
      Some(LocalTask::Finished { exit_code, outputs }) => WorkerTaskStatus::Finished {
        exit_code: *exit_code,
        outputs: outputs.clone(),
      },
      None => WorkerTaskStatus::Unknown,
    })
  }
}

struct LocalRun {
  worker_id: String,
  plugin: Box<dyn TaskPlugin>,
  events: mpsc::Sender<TaskEvent>,
  tasks: Arc<Mutex<HashMap<String, LocalTask>>>,
}

enum RunOutcome {
  Exited(i32),
  Cancelled,
  Errored(TaskError),
}

impl LocalRun {
  async fn run(mut self, ctx: TaskExecutionContext, cancel: CancellationToken) {
    let instance_id = ctx.instance_id.clone();
    let task_instance_id = ctx.task_instance_id.clone();

    send(
      &self.events,
      &ctx,
      TaskEventKind::Ack {
        worker: self.worker_id.clone(),
      },
    )
    .await;

    let outcome = self.drive(&ctx, &cancel).await;

    let (exit_code, kind) = match outcome {
      RunOutcome::Exited(exit_code) => {
        info!(%instance_id, %task_instance_id, exit_code, "local task finished");
        let outputs = self.plugin.outputs();
        (
          exit_code,
          TaskEventKind::Result {
            exit_code,
            outputs,
            error: None,
          },
        )
      }
      RunOutcome::Cancelled => {
        if let Err(e) = self.plugin.cancel().await {
          warn!(%instance_id, %task_instance_id, error = %e, "plugin cancel failed");
        }
        (EXIT_CODE_KILL, TaskEventKind::Killed)
      }
      RunOutcome::Errored(e) => {
        error!(%instance_id, %task_instance_id, error = %e, "local task errored");
        (
          EXIT_CODE_FAILURE,
          TaskEventKind::Result {
            exit_code: EXIT_CODE_FAILURE,
            outputs: HashMap::new(),
            error: Some(e.to_string()),
          },
        )
      }
    };

    let outputs = match &kind {
      TaskEventKind::Result { outputs, .. } => outputs.clone(),
      _ => HashMap::new(),
    };
    self
      .tasks
      .lock()
      .unwrap_or_else(PoisonError::into_inner)
      .insert(
        task_instance_id,
        LocalTask::Finished { exit_code, outputs },
      );

    send(&self.events, &ctx, kind).await;
  }

  async fn drive(&mut self, ctx: &TaskExecutionContext, cancel: &CancellationToken) -> RunOutcome {
    if cancel.is_cancelled() {
      return RunOutcome::Cancelled;
    }
    if let Err(e) = self.plugin.init(ctx).await {
      return RunOutcome::Errored(e);
    }
    if let Err(e) = self.plugin.submit().await {
      return RunOutcome::Errored(e);
    }
    send(&self.events, ctx, TaskEventKind::Running).await;

    tokio::select! {
      _ = cancel.cancelled() => RunOutcome::Cancelled,
      result = self.plugin.track_status() => match result {
        Ok(exit_code) => RunOutcome::Exited(exit_code),
        Err(e) => RunOutcome::Errored(e),
      },
    }
  }

}

async fn send(events: &mpsc::Sender<TaskEvent>, ctx: &TaskExecutionContext, kind: TaskEventKind) {
  // Receiver may have been dropped
  let _ = events
    .send(TaskEvent::new(&ctx.instance_id, &ctx.task_instance_id, kind))
    .await;
}
