pub mod context;

use std::fmt;
use std::sync::Arc;

use futures::future::BoxFuture;
use parking_lot::RwLock;
use thiserror::Error;
use tracing::info;

use crate::error::BoxError;

// --- Public Type Aliases ---

/// Identifier assigned once per logical run of a task (on STARTING).
pub type ExecutionId = i32;

/// Identifier the controller assigns to a registered producer.
pub type TaskId = i32;

/// Returned by `TaskController::start_task` when registration fails.
pub const INVALID_TASK_ID: TaskId = TaskId::MIN;

/// Future returned by [`Task::run`].
pub type TaskFuture<'a> = BoxFuture<'a, Result<(), TaskError>>;

/// The form in which tasks travel through the queue and the worker pool.
pub type SharedTask = Arc<dyn Task>;

/// Closure type backing an [`FnTask`].
pub type BoxedTaskFn = Box<dyn Fn() -> TaskFuture<'static> + Send + Sync + 'static>;

// --- Lifecycle ---

/// Lifecycle state of a task run.
///
/// `Starting -> Started -> Stopping -> {Completed | Failed | Abandoned} -> Stopped`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "SCREAMING_SNAKE_CASE"))]
pub enum TaskState {
  /// Pulled off the queue; an execution id has been assigned.
  Starting,
  /// Body is about to run.
  Started,
  /// Body returned or raised; outcome not yet classified.
  Stopping,
  Completed,
  Failed,
  Abandoned,
  /// Terminal, always entered after the outcome.
  Stopped,
}

impl TaskState {
  /// True for the three mutually exclusive outcome states.
  pub fn is_outcome(self) -> bool {
    matches!(
      self,
      TaskState::Completed | TaskState::Failed | TaskState::Abandoned
    )
  }

  pub fn as_str(self) -> &'static str {
    match self {
      TaskState::Starting => "STARTING",
      TaskState::Started => "STARTED",
      TaskState::Stopping => "STOPPING",
      TaskState::Completed => "COMPLETED",
      TaskState::Failed => "FAILED",
      TaskState::Abandoned => "ABANDONED",
      TaskState::Stopped => "STOPPED",
    }
  }
}

impl fmt::Display for TaskState {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

/// Error raised by a task body.
#[derive(Error, Debug)]
pub enum TaskError {
  /// The run observed a cancellation request and gave up. Classified ABANDONED.
  #[error("Task run was cancelled")]
  Cancelled,
  /// Ordinary failure of the task logic. Classified FAILED.
  #[error("Task failed: {0}")]
  Failed(BoxError),
  /// The body panicked. Classified FAILED.
  #[error("Task panicked: {0}")]
  Panicked(String),
}

impl TaskError {
  pub fn failed(error: impl Into<BoxError>) -> Self {
    TaskError::Failed(error.into())
  }

  pub fn is_cancellation(&self) -> bool {
    matches!(self, TaskError::Cancelled)
  }
}

// --- Task metadata ---

#[derive(Debug, Default, Clone)]
struct MetaInner {
  name: String,
  execution_id: Option<ExecutionId>,
  state: Option<TaskState>,
}

/// Mutable per-task metadata: name, current execution id and lifecycle state.
///
/// Interior mutability lets every holder of a `SharedTask` observe the same
/// state progression. Only the instrumentation layer and sinks should write
/// the execution id and state.
#[derive(Debug, Default)]
pub struct TaskMeta {
  inner: RwLock<MetaInner>,
}

impl TaskMeta {
  pub fn new(name: &str) -> Self {
    Self {
      inner: RwLock::new(MetaInner {
        name: name.to_string(),
        ..Default::default()
      }),
    }
  }

  pub fn name(&self) -> String {
    self.inner.read().name.clone()
  }

  pub fn set_name(&self, name: &str) {
    self.inner.write().name = name.to_string();
  }

  pub fn execution_id(&self) -> Option<ExecutionId> {
    self.inner.read().execution_id
  }

  pub fn set_execution_id(&self, id: ExecutionId) {
    self.inner.write().execution_id = Some(id);
  }

  pub fn state(&self) -> Option<TaskState> {
    self.inner.read().state
  }

  pub fn set_state(&self, state: TaskState) {
    self.inner.write().state = Some(state);
  }
}

// --- Task capability ---

/// A named, stateful unit of executable work.
///
/// Implementors supply [`meta`](Task::meta) and [`run`](Task::run); the
/// accessors are provided in terms of `meta`. Wrappers such as
/// [`InstrumentedTask`](crate::instrument::InstrumentedTask) delegate `meta`
/// to the wrapped task so both views share one state.
pub trait Task: Send + Sync + 'static {
  fn meta(&self) -> &TaskMeta;

  /// Executes the task body once.
  fn run(&self) -> TaskFuture<'_>;

  /// Executes one run whose identity (execution id, state) is carried by
  /// `run` rather than by this task. Wrappers that report transitions report
  /// them against `run`; plain tasks just run.
  fn run_as<'a>(&'a self, run: &'a dyn Task) -> TaskFuture<'a> {
    let _ = run;
    self.run()
  }

  fn name(&self) -> String {
    self.meta().name()
  }

  fn set_name(&self, name: &str) {
    self.meta().set_name(name)
  }

  fn execution_id(&self) -> Option<ExecutionId> {
    self.meta().execution_id()
  }

  fn set_execution_id(&self, id: ExecutionId) {
    self.meta().set_execution_id(id)
  }

  fn state(&self) -> Option<TaskState> {
    self.meta().state()
  }

  fn set_state(&self, state: TaskState) {
    self.meta().set_state(state)
  }
}

impl fmt::Debug for dyn Task {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("Task")
      .field("name", &self.name())
      .field("execution_id", &self.execution_id())
      .field("state", &self.state())
      .finish()
  }
}

// --- Built-in task types ---

/// Task whose body is a closure returning a boxed future.
///
/// The closure is invoked once per run; use [`task_fn!`](crate::task_fn) to
/// build one without writing the boxing by hand.
pub struct FnTask {
  meta: TaskMeta,
  body: BoxedTaskFn,
}

impl FnTask {
  pub fn new<F>(name: &str, body: F) -> Self
  where
    F: Fn() -> TaskFuture<'static> + Send + Sync + 'static,
  {
    Self {
      meta: TaskMeta::new(name),
      body: Box::new(body),
    }
  }
}

impl fmt::Debug for FnTask {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("FnTask")
      .field("meta", &self.meta)
      .field("body", &format_args!("<Fn>"))
      .finish()
  }
}

impl Task for FnTask {
  fn meta(&self) -> &TaskMeta {
    &self.meta
  }

  fn run(&self) -> TaskFuture<'_> {
    (self.body)()
  }
}

/// Task that only logs that it ran. Registered as the `"logging"` task type.
#[derive(Debug, Default)]
pub struct LoggingTask {
  meta: TaskMeta,
}

impl LoggingTask {
  pub fn new() -> Self {
    Self::default()
  }
}

impl Task for LoggingTask {
  fn meta(&self) -> &TaskMeta {
    &self.meta
  }

  fn run(&self) -> TaskFuture<'_> {
    Box::pin(async move {
      info!(task = %self.name(), execution_id = ?self.execution_id(), "Executing task.");
      Ok(())
    })
  }
}
