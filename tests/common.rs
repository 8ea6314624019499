//! tests/common.rs
//! Shared helper functions for integration tests.
#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration as StdDuration;

use queuekeeper::error::BoxError;
use queuekeeper::{
  task_fn, try_get_current_task_context, FnTask, MemorySink, QueueKeeper, SharedTask, TaskError,
  TaskState, TaskTypes,
};
use tracing_subscriber::fmt::TestWriter;

// Initializes tracing subscriber for test output.
pub fn setup_tracing() {
  // try_init: several tests in one binary call this
  let _ = tracing_subscriber::fmt()
    .with_max_level(tracing::Level::DEBUG)
    .with_writer(TestWriter::new())
    .with_test_writer()
    .try_init();
}

// Builds a scheduler recording every transition into `sink`, with a short
// reclamation period so tests do not wait 10s.
pub fn build_keeper(workers: usize, types: TaskTypes, sink: Arc<MemorySink>) -> QueueKeeper {
  QueueKeeper::builder()
    .concurrency(workers)
    .reclaim_period(StdDuration::from_millis(100))
    .poll_timeout(StdDuration::from_millis(50))
    .task_types(types)
    .sink(sink)
    .build()
    .expect("Failed to build scheduler")
}

// Polls `condition` every 10ms until it holds or `timeout` elapses.
pub async fn wait_until(timeout: StdDuration, mut condition: impl FnMut() -> bool) -> bool {
  let deadline = tokio::time::Instant::now() + timeout;
  loop {
    if condition() {
      return true;
    }
    if tokio::time::Instant::now() >= deadline {
      return false;
    }
    tokio::time::sleep(StdDuration::from_millis(10)).await;
  }
}

// Waits until the sink saw a STOPPED transition for `task_name` `runs` times.
pub async fn wait_for_stopped_runs(sink: &MemorySink, task_name: &str, runs: usize) -> bool {
  wait_until(StdDuration::from_secs(3), || {
    sink
      .records()
      .iter()
      .filter(|r| r.task_name == task_name && r.state == TaskState::Stopped)
      .count()
      >= runs
  })
  .await
}

pub fn boxed(task: FnTask) -> Result<SharedTask, BoxError> {
  Ok(Arc::new(task) as SharedTask)
}

// Task that increments a counter, optionally after a delay.
pub fn counter_task(name: &str, counter: Arc<AtomicUsize>, delay: StdDuration) -> FnTask {
  FnTask::new(
    name,
    task_fn! {
      { let counter = counter.clone(); }
      {
        let count = counter.fetch_add(1, Ordering::SeqCst) + 1;
        tracing::debug!(count, "Counter task executing");
        if delay > StdDuration::ZERO {
          tokio::time::sleep(delay).await;
        }
        Ok(())
      }
    },
  )
}

// Task that sets a flag when its body runs.
pub fn flag_task(name: &str, flag: Arc<AtomicBool>) -> FnTask {
  FnTask::new(
    name,
    task_fn! {
      { let flag = flag.clone(); }
      {
        flag.store(true, Ordering::SeqCst);
        Ok(())
      }
    },
  )
}

// Task whose body always returns an ordinary error.
pub fn failing_task(name: &str) -> FnTask {
  FnTask::new(
    name,
    task_fn! {{
      tracing::debug!("Failing task executing");
      Err(TaskError::failed("forced failure"))
    }},
  )
}

// Task whose body panics.
pub fn panicking_task(name: &str) -> FnTask {
  FnTask::new(
    name,
    task_fn! {{
      tokio::task::yield_now().await;
      panic!("Task forced panic!")
    }},
  )
}

// Task that marks `started` and then waits for its cancellation signal,
// returning `Cancelled` once it arrives (or completing after 30s).
pub fn cancellable_task(name: &str, started: Arc<AtomicBool>) -> FnTask {
  FnTask::new(
    name,
    task_fn! {
      { let started = started.clone(); }
      {
        started.store(true, Ordering::SeqCst);
        let Some(ctx) = try_get_current_task_context() else {
          return Ok(());
        };
        tokio::select! {
          _ = ctx.cancelled() => Err(TaskError::Cancelled),
          _ = tokio::time::sleep(StdDuration::from_secs(30)) => Ok(()),
        }
      }
    },
  )
}

// Registry with a counter type and the failure helpers.
pub fn test_types(counter: Arc<AtomicUsize>) -> TaskTypes {
  TaskTypes::new()
    .with("counter", move || {
      boxed(counter_task("counter", counter.clone(), StdDuration::ZERO))
    })
    .with("failing", || boxed(failing_task("failing")))
    .with("panicking", || boxed(panicking_task("panicking")))
    .with("broken", || Err("factory refused".into()))
}
