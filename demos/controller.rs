//! demos/controller.rs
//!
//! Drives the controller the way a management console would: tasks come from
//! a static table at boot and from ad-hoc calls, one is queued out of band,
//! another is stopped, and every transition is both logged and recorded.

use queuekeeper::{
  task_fn, CompositeSink, FnTask, LoggingSink, MemorySink, QueueKeeper, SharedTask, TaskError,
  TaskTable, TaskTypes, TimeUnit, INVALID_TASK_ID,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration as StdDuration;
use tracing::{info, warn};

const TASK_TABLE: &str = "
# Started at boot
tasks = heartbeat, flaky
heartbeat.runnable = counter
heartbeat.execution.interval = 300
heartbeat.execution.timeunit = MILLISECONDS
flaky.runnable = flaky
flaky.execution.initialDelay = 1
flaky.execution.interval = 1
flaky.execution.timeunit = SECONDS
";

fn task_types(runs: Arc<AtomicUsize>) -> TaskTypes {
  TaskTypes::new()
    .with("counter", move || {
      let runs = runs.clone();
      let task = FnTask::new(
        "counter",
        task_fn! {
          { let runs = runs.clone(); }
          {
            let count = runs.fetch_add(1, Ordering::Relaxed) + 1;
            info!(count, "Counter task ran.");
            Ok(())
          }
        },
      );
      Ok(Arc::new(task) as SharedTask)
    })
    .with("flaky", || {
      let task = FnTask::new(
        "flaky",
        task_fn! {{
          Err(TaskError::failed("upstream unavailable"))
        }},
      );
      Ok(Arc::new(task) as SharedTask)
    })
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
  let filter = tracing_subscriber::EnvFilter::try_new("warn,queuekeeper=debug,controller=info")
    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
  tracing_subscriber::fmt().with_env_filter(filter).init();

  let runs = Arc::new(AtomicUsize::new(0));
  let history = Arc::new(MemorySink::new());
  let sink = CompositeSink::new(Vec::new())
    .with(Arc::new(LoggingSink))
    .with(history.clone());

  let keeper = QueueKeeper::builder()
    .concurrency(2)
    .queue_capacity(64)
    .task_types(task_types(runs.clone()))
    .task_table(TaskTable::parse(TASK_TABLE))
    .sink(Arc::new(sink))
    .build()?;
  info!(tasks = ?keeper.tasks(), "Scheduler started from table.");

  // Ad-hoc registration, first run an hour from now.
  let report = keeper.start_task_str("report", "logging", 1, 1, "hours");
  if report == INVALID_TASK_ID {
    warn!("Report task was not registered.");
  }
  // Rejected: the name is taken.
  let duplicate = keeper.start_task("heartbeat", "logging", 0, 1, TimeUnit::Seconds);
  info!(duplicate, "Duplicate registration returned the sentinel id.");

  // Run the hourly report right away instead of waiting.
  keeper.queue_immediately("report")?;

  tokio::time::sleep(StdDuration::from_millis(2500)).await;

  if keeper.stop_task("flaky").await {
    info!("Stopped 'flaky'.");
  }
  info!(tasks = ?keeper.tasks(), "Registered tasks after stop.");

  tokio::time::sleep(StdDuration::from_millis(500)).await;
  keeper.shutdown(Some(StdDuration::from_secs(5))).await?;

  info!(
    heartbeat_runs = runs.load(Ordering::Relaxed),
    recorded_transitions = history.len(),
    "Demo finished."
  );
  info!("{:#?}", keeper.metrics());
  Ok(())
}
