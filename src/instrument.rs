//! Lifecycle instrumentation.
//!
//! [`InstrumentedTask`] wraps a raw task so that running it drives the task
//! through `STARTED -> STOPPING -> outcome -> STOPPED`, and
//! [`InstrumentedQueue`] wraps the shared queue so that dequeuing a task
//! starts a [`TaskRun`], assigns its execution id and reports `STARTING`.
//! Together they produce the full ordered sequence for each run even though
//! two layers report it.
//!
//! The same task instance may be dequeued again while an earlier run is
//! still going. Each run therefore reports through its own [`TaskRun`], whose
//! execution id and state belong to that run alone.

use std::any::Any;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use tracing::{error, warn};

use crate::error::QueueError;
use crate::queue::TaskQueue;
use crate::sequence::SequenceGenerator;
use crate::sink::{self, SharedSink};
use crate::task::context::try_get_current_task_context;
use crate::task::{ExecutionId, SharedTask, Task, TaskError, TaskFuture, TaskMeta, TaskState};

/// Updates the task's own state, then reports to the sink. Sink failures are
/// logged and otherwise ignored.
fn transition(sink: &SharedSink, task: &dyn Task, state: TaskState) {
  task.set_state(state);
  if let Err(e) = sink::report(sink.as_ref(), task, state) {
    warn!(
      task = %task.name(),
      execution_id = ?task.execution_id(),
      %state,
      error = %e,
      "State transition was not recorded by the sink."
    );
  }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
  if let Some(s) = payload.downcast_ref::<&str>() {
    (*s).to_string()
  } else if let Some(s) = payload.downcast_ref::<String>() {
    s.clone()
  } else {
    "non-string panic payload".to_string()
  }
}

/// Decorator that reports every lifecycle transition of the wrapped task.
///
/// Substitutable anywhere a [`Task`] is expected; `meta` is delegated, so the
/// wrapped task observes the same state progression.
pub struct InstrumentedTask {
  task: SharedTask,
  sink: SharedSink,
}

impl InstrumentedTask {
  pub fn new(task: SharedTask, sink: SharedSink) -> Self {
    Self { task, sink }
  }

  /// Convenience for wrapping straight into a `SharedTask`.
  pub fn shared(task: SharedTask, sink: SharedSink) -> SharedTask {
    Arc::new(Self::new(task, sink))
  }

  pub fn inner(&self) -> &SharedTask {
    &self.task
  }

  /// Drives one run. Transitions are reported against `task`, which is
  /// either the wrapped task itself or a per-run view of it.
  async fn run_instrumented(&self, task: &dyn Task) -> Result<(), TaskError> {
    transition(&self.sink, task, TaskState::Started);

    // A run cancelled before its body began is abandoned without invoking it.
    let cancelled_early = try_get_current_task_context().is_some_and(|ctx| ctx.is_cancelled());
    let result = if cancelled_early {
      Err(TaskError::Cancelled)
    } else {
      match AssertUnwindSafe(self.task.run_as(task)).catch_unwind().await {
        Ok(result) => result,
        Err(payload) => {
          let message = panic_message(&*payload);
          error!(
            task = %task.name(),
            execution_id = ?task.execution_id(),
            panic = %message,
            "Task body panicked!"
          );
          Err(TaskError::Panicked(message))
        }
      }
    };

    transition(&self.sink, task, TaskState::Stopping);
    let outcome = match &result {
      Ok(()) => TaskState::Completed,
      Err(e) if e.is_cancellation() => TaskState::Abandoned,
      Err(_) => TaskState::Failed,
    };
    transition(&self.sink, task, outcome);
    transition(&self.sink, task, TaskState::Stopped);

    // The error still propagates so the pool sees the failure.
    result
  }
}

impl Task for InstrumentedTask {
  fn meta(&self) -> &TaskMeta {
    self.task.meta()
  }

  fn run(&self) -> TaskFuture<'_> {
    Box::pin(self.run_instrumented(self.task.as_ref()))
  }

  fn run_as<'a>(&'a self, run: &'a dyn Task) -> TaskFuture<'a> {
    Box::pin(self.run_instrumented(run))
  }
}

impl fmt::Debug for InstrumentedTask {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("InstrumentedTask")
      .field("task", &self.task)
      .field("sink", &format_args!("<StateTransition>"))
      .finish()
  }
}

/// One logical run of a task, created when the task is dequeued.
///
/// Holds the run's own execution id and state; name and body come from the
/// wrapped task. Writes are mirrored onto the wrapped task's metadata so
/// other holders still observe the latest run, but everything reported for
/// this run reads its own values.
pub struct TaskRun {
  task: SharedTask,
  meta: TaskMeta,
}

impl TaskRun {
  pub fn new(task: SharedTask) -> Self {
    let meta = TaskMeta::new(&task.name());
    Self { task, meta }
  }

  /// The task this run executes.
  pub fn task(&self) -> &SharedTask {
    &self.task
  }
}

impl Task for TaskRun {
  fn meta(&self) -> &TaskMeta {
    &self.meta
  }

  fn run(&self) -> TaskFuture<'_> {
    self.task.run_as(self)
  }

  fn set_execution_id(&self, id: ExecutionId) {
    self.meta.set_execution_id(id);
    self.task.set_execution_id(id);
  }

  fn set_state(&self, state: TaskState) {
    self.meta.set_state(state);
    self.task.set_state(state);
  }
}

impl fmt::Debug for TaskRun {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("TaskRun")
      .field("name", &self.meta.name())
      .field("execution_id", &self.meta.execution_id())
      .field("state", &self.meta.state())
      .finish()
  }
}

/// Queue adapter whose `poll` starts a new logical run for each task it
/// hands out.
#[derive(Clone)]
pub struct InstrumentedQueue {
  queue: TaskQueue,
  sink: SharedSink,
  execution_ids: Arc<SequenceGenerator>,
}

impl InstrumentedQueue {
  pub fn new(queue: TaskQueue, sink: SharedSink) -> Self {
    Self::with_sequence(queue, sink, Arc::new(SequenceGenerator::default()))
  }

  pub fn with_sequence(
    queue: TaskQueue,
    sink: SharedSink,
    execution_ids: Arc<SequenceGenerator>,
  ) -> Self {
    Self {
      queue,
      sink,
      execution_ids,
    }
  }

  /// Dequeues a task and returns a fresh [`TaskRun`] of it, with its own
  /// execution id, after reporting `STARTING`.
  pub async fn poll(&self, wait: Duration) -> Option<SharedTask> {
    let run = TaskRun::new(self.queue.poll(wait).await?);
    run.set_execution_id(self.execution_ids.next());
    transition(&self.sink, &run, TaskState::Starting);
    Some(Arc::new(run))
  }

  pub async fn offer(&self, task: SharedTask, wait: Duration) -> Result<(), QueueError> {
    self.queue.offer(task, wait).await
  }

  pub fn try_add(&self, task: SharedTask) -> Result<(), QueueError> {
    self.queue.try_add(task)
  }

  pub fn len(&self) -> usize {
    self.queue.len()
  }

  pub fn is_empty(&self) -> bool {
    self.queue.is_empty()
  }

  pub fn queue(&self) -> &TaskQueue {
    &self.queue
  }
}

impl fmt::Debug for InstrumentedQueue {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("InstrumentedQueue")
      .field("queue", &self.queue)
      .field("next_execution_id", &self.execution_ids.peek_next())
      .finish()
  }
}
