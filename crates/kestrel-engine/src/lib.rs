//! Kestrel Engine
//!
//! This crate runs workflow instances on a master: it schedules each
//! instance's DAG, dispatches attempts to workers, executes logic tasks
//! in-process, persists every transition and takes over instances from dead
//! masters.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      WorkflowEngine                         │
//! │  - create / create_backfill / pause / stop / recover        │
//! │  - router: worker events → owning instance queue            │
//! │  - sweeper: periodic timeout tick to every instance         │
//! └─────────────────────────────────────────────────────────────┘
//!                               │
//!                               ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │              WorkflowExecutionRunnable (one task each)      │
//! │  - DagScheduler: ready set, pruning, priorities             │
//! │  - TaskExecutor per attempt: retries, timeouts, kills       │
//! │  - logic tasks: switch, conditions, dependent, sub_workflow │
//! └─────────────────────────────────────────────────────────────┘
//!                               │
//!                               ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │            Store            │         WorkerClient          │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Usage
//!
//! ```ignore
//! let (events_tx, events_rx) = task_event_channel(100);
//! let worker = Arc::new(LocalWorker::new(plugins, events_tx));
//! let engine = EngineBuilder::new(config, Arc::new(MemoryStore::new()), worker)
//!   .build(events_rx)?;
//!
//! let id = engine
//!   .create(def, params, FailureStrategy::ContinueOnFailure, RunMode::Serial)
//!   .await?;
//! let state = engine.wait(&id).await?;
//! ```

mod engine;
mod error;
mod events;
mod executor;
mod failover;
mod logic;
mod message;
mod params;
mod repository;
mod runnable;
mod scheduler;

pub use engine::{EngineBuilder, EngineContext, WorkflowEngine};
pub use error::EngineError;
pub use events::{ChannelNotifier, ExecutionEvent, ExecutionNotifier, NoopNotifier};
pub use executor::{KillAction, KillReason, TaskExecutor, TimeoutCheck};
pub use failover::{FailoverCoordinator, MasterRegistry, StaticMasterRegistry};
pub use logic::{
  ConditionsFactory, DependentFactory, LogicOutcome, LogicTask, LogicTaskContext,
  LogicTaskPluginFactory, LogicTaskRegistry, SubWorkflowFactory, SwitchFactory,
};
pub use message::Command;
pub use params::resolve_params;
pub use repository::{InstanceView, WorkflowHandle, WorkflowRepository};
pub use scheduler::{Completion, DagScheduler, NodeState, Released, SchedulerError};
