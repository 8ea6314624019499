use super::ExecutionId;

use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Contextual information available to a running task body via task-locals.
/// Accessible using `try_get_current_task_context()` or the `task_context!()`
/// macro.
#[derive(Clone, Debug)]
pub struct TaskContext {
  /// Name of the task being executed.
  pub name: String,
  /// Execution id assigned when the task was dequeued, if any.
  pub execution_id: Option<ExecutionId>,
  /// Identifier of the unit of work inside the execution service.
  pub work_id: Uuid,
  cancel: CancellationToken,
}

impl TaskContext {
  pub(crate) fn new(
    name: String,
    execution_id: Option<ExecutionId>,
    work_id: Uuid,
    cancel: CancellationToken,
  ) -> Self {
    Self {
      name,
      execution_id,
      work_id,
      cancel,
    }
  }

  /// Whether cancellation of this run has been requested.
  ///
  /// Cancellation is advisory: a body that never checks keeps running to
  /// completion. A body that observes it should return `TaskError::Cancelled`.
  pub fn is_cancelled(&self) -> bool {
    self.cancel.is_cancelled()
  }

  /// Resolves once cancellation of this run has been requested.
  pub async fn cancelled(&self) {
    self.cancel.cancelled().await
  }
}

tokio::task_local! {
    /// Provides access to the current `TaskContext` within a task's execution scope.
    /// Set by the worker pool before the task is awaited.
    pub static CURRENT_TASK_CONTEXT: TaskContext;
}

/// Attempts to retrieve the current `TaskContext` for the executing task.
///
/// Returns `None` if called outside a task run driven by the worker pool.
pub fn try_get_current_task_context() -> Option<TaskContext> {
  CURRENT_TASK_CONTEXT.try_with(|ctx| ctx.clone()).ok()
}

/// Retrieves the current `TaskContext`, panicking if called outside a
/// pool-driven task run.
///
/// # Panics
/// Panics if the `CURRENT_TASK_CONTEXT` task local has not been set.
#[macro_export]
macro_rules! task_context {
  () => {
    $crate::task::context::CURRENT_TASK_CONTEXT.with(|ctx| ctx.clone())
  };
}
