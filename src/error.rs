use crate::service::ServiceState;
use crate::task::TaskId;

use thiserror::Error;

/// Boxed error type accepted from user task bodies and task factories.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Errors that can occur while building a [`QueueKeeper`](crate::QueueKeeper)
/// or one of its services.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BuildError {
  #[error("Worker concurrency must be greater than zero")]
  ZeroConcurrency,
  #[error("Task queue capacity must be greater than zero")]
  ZeroQueueCapacity,
  #[error("Failed to start the execution service: {0}")]
  ExecutionService(ServiceError),
}

/// Errors returned by the shared task queue.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueError {
  #[error("Task queue is full, task was not accepted.")]
  Full,
  #[error("Task queue is closed.")]
  Closed,
}

/// Errors raised by a service's own start/stop bookkeeping.
///
/// Any of these moves the affected service to [`ServiceState::Failed`]
/// except `AlreadyStarted` and `StopTimeout`, which leave it untouched.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ServiceError {
  #[error("Service cannot be started from state {0:?}")]
  AlreadyStarted(ServiceState),
  #[error("Schedule interval must be greater than zero")]
  InvalidSchedule,
  #[error("Shared task queue was closed")]
  QueueClosed,
  #[error("Service task panicked: {0}")]
  Panicked(String),
  #[error("Timed out waiting for the service to stop")]
  StopTimeout,
}

/// Errors surfaced by [`TaskController::try_start_task`](crate::TaskController::try_start_task).
#[derive(Error, Debug)]
pub enum ControllerError {
  #[error("Unknown task type '{0}'")]
  UnknownTaskType(String),
  #[error("Could not construct task of type '{task_type}': {source}")]
  Construction {
    task_type: String,
    #[source]
    source: BoxError,
  },
  #[error("A task named '{0}' is already registered")]
  DuplicateName(String),
  #[error("Task id sequence produced an unusable id {0}")]
  UnusableId(TaskId),
  #[error("Invalid time unit '{0}'")]
  InvalidTimeUnit(String),
  #[error("Scheduling service failed to start: {0}")]
  Service(#[from] ServiceError),
}

/// Errors produced while reading the static task table.
#[derive(Error, Debug)]
pub enum ConfigError {
  #[error("Could not read task table: {0}")]
  Io(#[from] std::io::Error),
  #[error("Task '{task}' is missing required key '{key}'")]
  MissingKey { task: String, key: String },
  #[error("Task '{task}' has a non-numeric value '{value}' for '{key}'")]
  InvalidNumber {
    task: String,
    key: String,
    value: String,
  },
  #[error("Task '{task}' has an unknown time unit '{value}'")]
  InvalidTimeUnit { task: String, value: String },
}

/// Error reported by a [`StateTransition`](crate::sink::StateTransition) sink.
/// Never propagated past the instrumentation layer.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("State transition sink failed: {message}")]
pub struct SinkError {
  pub message: String,
}

impl SinkError {
  pub fn new(message: impl Into<String>) -> Self {
    Self {
      message: message.into(),
    }
  }
}

/// Errors related to the facade shutdown ([`QueueKeeper::shutdown`](crate::QueueKeeper::shutdown)).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ShutdownError {
  #[error("Timed out waiting for the execution service to stop.")]
  Timeout,
  #[error("Execution service failed while stopping: {0}")]
  Service(ServiceError),
}
