//! Recording sinks for task lifecycle transitions.
//!
//! The instrumentation layer updates a task's own state before calling the
//! sink, so a failing sink can never corrupt in-memory task state. Sink errors
//! are logged and dropped by the caller.

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tracing::debug;

use crate::error::SinkError;
use crate::task::{ExecutionId, Task, TaskState};

/// Shared handle to a sink.
pub type SharedSink = Arc<dyn StateTransition>;

/// Records each of the seven lifecycle transitions of a task.
///
/// Only [`record`](StateTransition::record) is required; the per-transition
/// methods delegate to it by default and may be overridden individually (a
/// durable sink typically overrides `starting` to allocate its own execution
/// id and write it back with `task.set_execution_id`).
pub trait StateTransition: Send + Sync + 'static {
  fn record(&self, task: &dyn Task, state: TaskState) -> Result<(), SinkError>;

  fn starting(&self, task: &dyn Task) -> Result<(), SinkError> {
    self.record(task, TaskState::Starting)
  }

  fn started(&self, task: &dyn Task) -> Result<(), SinkError> {
    self.record(task, TaskState::Started)
  }

  fn stopping(&self, task: &dyn Task) -> Result<(), SinkError> {
    self.record(task, TaskState::Stopping)
  }

  fn completed(&self, task: &dyn Task) -> Result<(), SinkError> {
    self.record(task, TaskState::Completed)
  }

  fn failed(&self, task: &dyn Task) -> Result<(), SinkError> {
    self.record(task, TaskState::Failed)
  }

  fn abandoned(&self, task: &dyn Task) -> Result<(), SinkError> {
    self.record(task, TaskState::Abandoned)
  }

  fn stopped(&self, task: &dyn Task) -> Result<(), SinkError> {
    self.record(task, TaskState::Stopped)
  }
}

/// Dispatches `state` to the matching per-transition method of `sink`.
pub(crate) fn report(
  sink: &dyn StateTransition,
  task: &dyn Task,
  state: TaskState,
) -> Result<(), SinkError> {
  match state {
    TaskState::Starting => sink.starting(task),
    TaskState::Started => sink.started(task),
    TaskState::Stopping => sink.stopping(task),
    TaskState::Completed => sink.completed(task),
    TaskState::Failed => sink.failed(task),
    TaskState::Abandoned => sink.abandoned(task),
    TaskState::Stopped => sink.stopped(task),
  }
}

/// Logs every transition through `tracing` at debug level.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingSink;

impl StateTransition for LoggingSink {
  fn record(&self, task: &dyn Task, state: TaskState) -> Result<(), SinkError> {
    debug!(
      task = %task.name(),
      execution_id = ?task.execution_id(),
      %state,
      "Task state transition."
    );
    Ok(())
  }
}

/// Discards every transition.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopSink;

impl StateTransition for NoopSink {
  fn record(&self, _task: &dyn Task, _state: TaskState) -> Result<(), SinkError> {
    Ok(())
  }
}

/// One recorded transition.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct TransitionRecord {
  pub task_name: String,
  pub execution_id: Option<ExecutionId>,
  pub state: TaskState,
  pub at: DateTime<Utc>,
}

/// Keeps every transition in memory, in the order reported.
#[derive(Debug, Default)]
pub struct MemorySink {
  records: Mutex<Vec<TransitionRecord>>,
}

impl MemorySink {
  pub fn new() -> Self {
    Self::default()
  }

  /// Snapshot of all records so far.
  pub fn records(&self) -> Vec<TransitionRecord> {
    self.records.lock().clone()
  }

  /// States reported for one execution id, in order.
  pub fn states_for(&self, execution_id: ExecutionId) -> Vec<TaskState> {
    self
      .records
      .lock()
      .iter()
      .filter(|r| r.execution_id == Some(execution_id))
      .map(|r| r.state)
      .collect()
  }

  /// Distinct execution ids seen for a task name, in first-seen order.
  pub fn execution_ids_for(&self, task_name: &str) -> Vec<ExecutionId> {
    let mut ids = Vec::new();
    for record in self.records.lock().iter() {
      if record.task_name != task_name {
        continue;
      }
      if let Some(id) = record.execution_id {
        if !ids.contains(&id) {
          ids.push(id);
        }
      }
    }
    ids
  }

  pub fn len(&self) -> usize {
    self.records.lock().len()
  }

  pub fn is_empty(&self) -> bool {
    self.records.lock().is_empty()
  }

  pub fn clear(&self) {
    self.records.lock().clear();
  }
}

impl StateTransition for MemorySink {
  fn record(&self, task: &dyn Task, state: TaskState) -> Result<(), SinkError> {
    self.records.lock().push(TransitionRecord {
      task_name: task.name(),
      execution_id: task.execution_id(),
      state,
      at: Utc::now(),
    });
    Ok(())
  }
}

/// Forwards each transition to every member sink.
///
/// A failing member does not stop delivery to the remaining members; the
/// first error is returned once all have been called.
#[derive(Default, Clone)]
pub struct CompositeSink {
  sinks: Vec<SharedSink>,
}

impl CompositeSink {
  pub fn new(sinks: Vec<SharedSink>) -> Self {
    Self { sinks }
  }

  pub fn with(mut self, sink: SharedSink) -> Self {
    self.sinks.push(sink);
    self
  }

  pub fn len(&self) -> usize {
    self.sinks.len()
  }

  pub fn is_empty(&self) -> bool {
    self.sinks.is_empty()
  }
}

impl fmt::Debug for CompositeSink {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("CompositeSink")
      .field("sinks", &self.sinks.len())
      .finish()
  }
}

impl StateTransition for CompositeSink {
  fn record(&self, task: &dyn Task, state: TaskState) -> Result<(), SinkError> {
    let mut first_error = None;
    for sink in &self.sinks {
      if let Err(e) = report(sink.as_ref(), task, state) {
        first_error.get_or_insert(e);
      }
    }
    first_error.map_or(Ok(()), Err)
  }
}
