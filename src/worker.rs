use crate::metrics::SchedulerMetrics;
use crate::task::context::{TaskContext, CURRENT_TASK_CONTEXT};
use crate::task::{SharedTask, TaskError};

use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::time::Instant;

use futures::FutureExt;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn, Instrument};
use uuid::Uuid;

/// Handle to one unit of work submitted to the [`WorkerPool`].
///
/// Cancelling is advisory: the token is visible to the running body through
/// its `TaskContext`, and a run that has not started yet is abandoned without
/// invoking its body.
#[derive(Debug)]
pub(crate) struct WorkHandle {
  id: Uuid,
  task_name: String,
  cancel: CancellationToken,
  join: JoinHandle<()>,
}

impl WorkHandle {
  pub fn id(&self) -> Uuid {
    self.id
  }

  pub fn task_name(&self) -> &str {
    &self.task_name
  }

  pub fn is_finished(&self) -> bool {
    self.join.is_finished()
  }

  pub fn cancel(&self) {
    self.cancel.cancel();
  }
}

/// Bounded pool executing submitted tasks.
///
/// Every submission becomes its own tokio task; at most `size` of them run a
/// task body at any time, the rest wait for a permit.
#[derive(Debug)]
pub(crate) struct WorkerPool {
  size: usize,
  permits: Arc<Semaphore>,
  active: Arc<AtomicUsize>,
  metrics: SchedulerMetrics,
}

impl WorkerPool {
  pub fn new(size: usize, metrics: SchedulerMetrics) -> Self {
    Self {
      size,
      permits: Arc::new(Semaphore::new(size)),
      active: Arc::new(AtomicUsize::new(0)),
      metrics,
    }
  }

  pub fn size(&self) -> usize {
    self.size
  }

  /// Number of workers currently running a task body.
  pub fn active_count(&self) -> usize {
    self.active.load(AtomicOrdering::Relaxed)
  }

  /// Submits a task without waiting for a free worker.
  pub fn submit(&self, task: SharedTask) -> WorkHandle {
    let id = Uuid::new_v4();
    let task_name = task.name();
    let cancel = CancellationToken::new();
    let context = TaskContext::new(task_name.clone(), task.execution_id(), id, cancel.clone());

    self
      .metrics
      .tasks_submitted
      .fetch_add(1, AtomicOrdering::Relaxed);

    let span = tracing::info_span!(
      "task_exec",
      work_id = %id,
      task = %task_name,
      execution_id = ?task.execution_id()
    );
    let join = tokio::spawn(
      run_work(
        task,
        context,
        cancel.clone(),
        self.permits.clone(),
        self.active.clone(),
        self.metrics.clone(),
      )
      .instrument(span),
    );

    WorkHandle {
      id,
      task_name,
      cancel,
      join,
    }
  }

  /// Closes the pool. Work still waiting for a permit is abandoned.
  pub fn shutdown(&self) {
    if !self.permits.is_closed() {
      info!(size = self.size, "Worker pool shutting down.");
      self.permits.close();
    }
  }
}

async fn run_work(
  task: SharedTask,
  context: TaskContext,
  cancel: CancellationToken,
  permits: Arc<Semaphore>,
  active: Arc<AtomicUsize>,
  metrics: SchedulerMetrics,
) {
  // Wait for a worker slot. Either a cancel or a closed pool still drives the
  // run through its lifecycle so the abandonment gets reported.
  let permit = tokio::select! {
    biased;
    _ = cancel.cancelled() => None,
    permit = permits.acquire_owned() => permit.ok(),
  };
  if permit.is_none() && !cancel.is_cancelled() {
    debug!("Worker pool closed before the run began.");
    cancel.cancel();
  }

  let prev_active = active.fetch_add(1, AtomicOrdering::Relaxed);
  metrics
    .workers_active_current
    .store(prev_active + 1, AtomicOrdering::Relaxed);

  trace!("Starting task execution.");
  let start = Instant::now();
  let result = AssertUnwindSafe(CURRENT_TASK_CONTEXT.scope(context, task.run()))
    .catch_unwind()
    .await;
  let duration = start.elapsed();
  metrics.task_execution_duration.record(duration);

  let outcome = match result {
    Ok(Ok(())) => {
      metrics.runs_completed.fetch_add(1, AtomicOrdering::Relaxed);
      "completed"
    }
    Ok(Err(TaskError::Cancelled)) => {
      metrics.runs_abandoned.fetch_add(1, AtomicOrdering::Relaxed);
      "abandoned"
    }
    Ok(Err(e)) => {
      metrics.runs_failed.fetch_add(1, AtomicOrdering::Relaxed);
      warn!(error = %e, "Task run failed.");
      "failed"
    }
    Err(_) => {
      metrics.runs_failed.fetch_add(1, AtomicOrdering::Relaxed);
      error!("Task run panicked outside the instrumentation layer!");
      "panicked"
    }
  };
  debug!(
    duration_ms = duration.as_millis(),
    outcome,
    "Finished task execution."
  );

  let prev_active = active.fetch_sub(1, AtomicOrdering::Relaxed);
  metrics
    .workers_active_current
    .store(prev_active.saturating_sub(1), AtomicOrdering::Relaxed);
  drop(permit);
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::task::FnTask;
  use std::time::Duration;

  #[tokio::test]
  async fn runs_submitted_work_and_counts_outcomes() {
    let metrics = SchedulerMetrics::new();
    let pool = WorkerPool::new(2, metrics.clone());

    let ok = pool.submit(Arc::new(FnTask::new("ok", || Box::pin(async { Ok(()) }))));
    let bad = pool.submit(Arc::new(FnTask::new("bad", || {
      Box::pin(async { Err(TaskError::failed("boom")) })
    })));

    tokio::time::timeout(Duration::from_secs(1), async {
      while !(ok.is_finished() && bad.is_finished()) {
        tokio::time::sleep(Duration::from_millis(5)).await;
      }
    })
    .await
    .unwrap();

    let snapshot = metrics.snapshot();
    assert_eq!(snapshot.tasks_submitted, 2);
    assert_eq!(snapshot.runs_completed, 1);
    assert_eq!(snapshot.runs_failed, 1);
    assert_eq!(pool.active_count(), 0);
  }

  #[tokio::test]
  async fn body_sees_its_context() {
    let pool = WorkerPool::new(1, SchedulerMetrics::new());
    let (tx, rx) = tokio::sync::oneshot::channel();
    let tx = Arc::new(parking_lot::Mutex::new(Some(tx)));

    let handle = pool.submit(Arc::new(FnTask::new("ctx", move || {
      let tx = tx.clone();
      Box::pin(async move {
        let ctx = crate::task_context!();
        if let Some(tx) = tx.lock().take() {
          let _ = tx.send((ctx.name.clone(), ctx.work_id));
        }
        Ok(())
      })
    })));

    let (name, work_id) = rx.await.unwrap();
    assert_eq!(name, "ctx");
    assert_eq!(work_id, handle.id());
  }
}
