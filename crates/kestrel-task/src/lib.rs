//! Kestrel Task
//!
//! Contracts between the master and the things that actually run user
//! payloads:
//!
//! - [`TaskPlugin`]: one task type (shell, SQL, ...) driven through
//!   `init -> submit -> track_status -> outputs`, or `cancel`.
//! - [`WorkerClient`]: the master's view of the worker fleet. `dispatch`
//!   returns as soon as a worker accepted the attempt; progress comes back
//!   as [`TaskEvent`]s on a channel.
//! - [`LocalWorker`]: an in-process worker that runs registered plugins on
//!   the tokio runtime.

mod error;
mod event;
mod local;
mod plugin;
mod shell;
mod types;
mod worker;

pub use error::{DispatchError, TaskError};
pub use event::{TaskEvent, TaskEventKind, task_event_channel};
pub use local::LocalWorker;
pub use plugin::{PluginRegistry, TaskPlugin, TaskPluginFactory};
pub use shell::{ShellTask, ShellTaskFactory};
pub use types::{EXIT_CODE_FAILURE, EXIT_CODE_KILL, EXIT_CODE_SUCCESS, TaskExecutionContext};
pub use worker::{WorkerClient, WorkerTaskStatus};
