//! tests/controller.rs
//! Registry operations: start / list / stop / queue-now, duplicates and
//! registration failures.

mod common;

use crate::common::{build_keeper, setup_tracing, test_types, wait_for_stopped_runs, wait_until};
use queuekeeper::{
  ControllerError, MemorySink, QueueKeeper, SequenceGenerator, ServiceError, ServiceState,
  SharedSink, TaskController, TaskQueue, TaskSummary, TaskTable, TimeUnit, INVALID_TASK_ID,
};
use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration as StdDuration;

fn keeper_with_sink() -> (QueueKeeper, Arc<MemorySink>, Arc<AtomicUsize>) {
  setup_tracing();
  let sink = Arc::new(MemorySink::new());
  let counter = Arc::new(AtomicUsize::new(0));
  let keeper = build_keeper(2, test_types(counter.clone()), sink.clone());
  (keeper, sink, counter)
}

#[tokio::test]
async fn test_start_list_stop_round_trip() {
  let (keeper, _sink, _counter) = keeper_with_sink();

  let id = keeper.start_task("report", "logging", 1, 1, TimeUnit::Hours);
  assert_ne!(id, INVALID_TASK_ID);
  assert!(keeper.tasks().contains(&TaskSummary {
    id,
    name: "report".to_string()
  }));
  assert_eq!(keeper.controller().task_id("report"), Some(id));

  assert!(keeper.stop_task_by_id(id).await);
  assert!(keeper.tasks().is_empty());
  assert_eq!(keeper.controller().task_id("report"), None);

  keeper.shutdown(None).await.unwrap();
}

#[tokio::test]
async fn test_stop_is_idempotent() {
  let (keeper, sink, counter) = keeper_with_sink();

  keeper.start_task("counter", "counter", 0, 1, TimeUnit::Hours);
  assert!(wait_for_stopped_runs(&sink, "counter", 1).await);
  let service = keeper.controller().service("counter").unwrap();

  assert!(keeper.stop_task("counter").await);
  let reported = sink.len();
  assert_eq!(service.state(), ServiceState::Terminated);

  assert!(!keeper.stop_task("counter").await, "Second stop is a no-op");
  assert_eq!(service.stop().await, ServiceState::Terminated);
  assert_eq!(sink.len(), reported, "No duplicate transitions");
  assert_eq!(counter.load(Ordering::SeqCst), 1);

  keeper.shutdown(None).await.unwrap();
}

#[tokio::test]
async fn test_duplicate_name_keeps_existing_registration() {
  let (keeper, _sink, _counter) = keeper_with_sink();

  let first = keeper.start_task("nightly", "logging", 1, 1, TimeUnit::Days);
  let second = keeper.start_task("nightly", "counter", 1, 1, TimeUnit::Days);
  assert_ne!(first, INVALID_TASK_ID);
  assert_eq!(second, INVALID_TASK_ID);

  let err = keeper
    .try_start_task("nightly", "logging", 1, 1, TimeUnit::Days)
    .unwrap_err();
  assert!(matches!(err, ControllerError::DuplicateName(name) if name == "nightly"));

  assert_eq!(
    keeper.tasks(),
    vec![TaskSummary {
      id: first,
      name: "nightly".to_string()
    }]
  );
  keeper.shutdown(None).await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_registrations_get_distinct_ids() {
  let (keeper, _sink, _counter) = keeper_with_sink();
  let keeper = Arc::new(keeper);

  let mut handles = Vec::new();
  for i in 0..16 {
    let keeper = keeper.clone();
    handles.push(tokio::spawn(async move {
      keeper.start_task(&format!("task-{i}"), "logging", 1, 1, TimeUnit::Hours)
    }));
  }
  // Eight racers for one name: exactly one may win.
  for _ in 0..8 {
    let keeper = keeper.clone();
    handles.push(tokio::spawn(async move {
      keeper.start_task("contended", "logging", 1, 1, TimeUnit::Hours)
    }));
  }

  let mut ids = Vec::new();
  for handle in handles {
    ids.push(handle.await.unwrap());
  }
  let accepted: Vec<_> = ids.iter().copied().filter(|id| *id != INVALID_TASK_ID).collect();
  let unique: HashSet<_> = accepted.iter().copied().collect();

  assert_eq!(accepted.len(), 17);
  assert_eq!(unique.len(), 17, "Ids must be distinct");
  assert_eq!(keeper.tasks().len(), 17);
  assert_eq!(keeper.metrics().tasks_registered, 17);
  assert_eq!(keeper.metrics().registrations_failed, 7);

  keeper.shutdown(None).await.unwrap();
}

#[tokio::test]
async fn test_registration_failures_return_sentinel() {
  let (keeper, _sink, _counter) = keeper_with_sink();

  assert_eq!(
    keeper.start_task("a", "no-such-type", 0, 1, TimeUnit::Seconds),
    INVALID_TASK_ID
  );
  assert_eq!(
    keeper.start_task("b", "broken", 0, 1, TimeUnit::Seconds),
    INVALID_TASK_ID
  );
  assert_eq!(
    keeper.start_task("c", "logging", 0, 0, TimeUnit::Seconds),
    INVALID_TASK_ID
  );
  assert_eq!(
    keeper.start_task_str("d", "logging", 0, 1, "fortnights"),
    INVALID_TASK_ID
  );

  assert!(matches!(
    keeper.try_start_task("a", "no-such-type", 0, 1, TimeUnit::Seconds),
    Err(ControllerError::UnknownTaskType(_))
  ));
  assert!(matches!(
    keeper.try_start_task("b", "broken", 0, 1, TimeUnit::Seconds),
    Err(ControllerError::Construction { .. })
  ));
  assert!(matches!(
    keeper.try_start_task("c", "logging", 0, 0, TimeUnit::Seconds),
    Err(ControllerError::Service(ServiceError::InvalidSchedule))
  ));

  assert!(keeper.tasks().is_empty(), "Failed registrations never enter the registry");
  assert_eq!(keeper.metrics().registrations_failed, 7);
  keeper.shutdown(None).await.unwrap();
}

#[tokio::test]
async fn test_start_task_str_accepts_any_case() {
  let (keeper, _sink, _counter) = keeper_with_sink();

  let id = keeper.start_task_str("lower", "logging", 1, 1, "minutes");
  assert_ne!(id, INVALID_TASK_ID);
  let service = keeper.controller().service("lower").unwrap();
  assert_eq!(service.schedule().unit(), TimeUnit::Minutes);

  keeper.shutdown(None).await.unwrap();
}

#[tokio::test]
async fn test_queue_immediately_unknown_name_is_noop() {
  let (keeper, sink, _counter) = keeper_with_sink();

  assert_eq!(keeper.queue_immediately("X"), Ok(false));
  tokio::time::sleep(StdDuration::from_millis(100)).await;

  assert!(sink.is_empty(), "No transition may be reported");
  assert_eq!(keeper.metrics().tasks_queued_immediately, 0);
  keeper.shutdown(None).await.unwrap();
}

#[tokio::test]
async fn test_queue_immediately_bypasses_schedule() {
  let (keeper, sink, counter) = keeper_with_sink();

  // First tick an hour away.
  keeper.start_task("counter", "counter", 1, 1, TimeUnit::Hours);
  assert_eq!(keeper.queue_immediately("counter"), Ok(true));

  assert!(wait_for_stopped_runs(&sink, "counter", 1).await);
  assert_eq!(counter.load(Ordering::SeqCst), 1);
  assert_eq!(keeper.metrics().tasks_queued_immediately, 1);
  assert_eq!(keeper.metrics().producer_ticks, 0);

  keeper.shutdown(None).await.unwrap();
}

#[tokio::test]
async fn test_auto_start_skips_bad_entries() {
  setup_tracing();
  let sink = Arc::new(MemorySink::new());
  let counter = Arc::new(AtomicUsize::new(0));
  let table = TaskTable::parse(
    "tasks = heartbeat, typo, unknown
heartbeat.runnable = counter
heartbeat.execution.interval = 1
heartbeat.execution.timeunit = HOURS
typo.runnable = logging
typo.execution.interval = 1
typo.execution.timeunit = HOURZ
unknown.runnable = mystery
unknown.execution.interval = 1
unknown.execution.timeunit = SECONDS",
  );

  let keeper = QueueKeeper::builder()
    .concurrency(1)
    .task_types(test_types(counter.clone()))
    .sink(sink.clone())
    .task_table(table)
    .build()
    .unwrap();

  let names: Vec<String> = keeper.tasks().into_iter().map(|t| t.name).collect();
  assert_eq!(names, vec!["heartbeat".to_string()]);
  assert_eq!(keeper.metrics().registrations_failed, 2);

  // initialDelay defaults to 0, so the first run happens right away.
  assert!(wait_until(StdDuration::from_secs(2), || counter.load(Ordering::SeqCst) == 1).await);
  keeper.shutdown(None).await.unwrap();
}

#[tokio::test]
async fn test_shutdown_clears_registry() {
  let (keeper, _sink, _counter) = keeper_with_sink();

  keeper.start_task("one", "logging", 1, 1, TimeUnit::Hours);
  keeper.start_task("two", "logging", 1, 1, TimeUnit::Hours);
  let one = keeper.controller().service("one").unwrap();
  assert_eq!(keeper.tasks().len(), 2);

  keeper.shutdown(Some(StdDuration::from_secs(2))).await.unwrap();

  assert!(keeper.tasks().is_empty());
  assert_eq!(one.state(), ServiceState::Terminated);
  assert_eq!(keeper.execution().state(), ServiceState::Terminated);
  assert!(keeper.queue().is_closed());
  assert_eq!(keeper.queue_immediately("one"), Ok(false));
}

fn controller_with_ids(ids: SequenceGenerator) -> TaskController {
  setup_tracing();
  let sink: SharedSink = Arc::new(MemorySink::new());
  TaskController::builder(TaskQueue::bounded(8), sink)
    .id_sequence(Arc::new(ids))
    .build()
}

#[tokio::test]
async fn test_repeated_id_is_refused_without_replacing_the_holder() {
  // A zero increment hands out the same id forever.
  let controller = controller_with_ids(SequenceGenerator::new(5, 0));

  assert_eq!(controller.try_start_task("first", "logging", 1, 1, TimeUnit::Hours).unwrap(), 5);
  let err = controller
    .try_start_task("second", "logging", 1, 1, TimeUnit::Hours)
    .unwrap_err();
  assert!(matches!(err, ControllerError::UnusableId(5)));

  assert_eq!(controller.task_id("first"), Some(5));
  assert_eq!(controller.task_id("second"), None);
  assert!(controller.service("second").is_none());
  assert!(controller.stop_task_by_id(5).await);
  assert!(controller.is_empty());
  controller.shutdown().await;
}

#[tokio::test]
async fn test_wrapped_sequence_never_yields_the_invalid_id() {
  let controller = controller_with_ids(SequenceGenerator::new(i32::MAX - 1, 1));

  assert_eq!(
    controller.start_task("last", "logging", 1, 1, TimeUnit::Hours),
    i32::MAX
  );
  let err = controller
    .try_start_task("wrapped", "logging", 1, 1, TimeUnit::Hours)
    .unwrap_err();
  assert!(matches!(err, ControllerError::UnusableId(INVALID_TASK_ID)));
  assert_eq!(controller.len(), 1);

  // Past the sentinel the sequence is usable again.
  assert_eq!(
    controller.start_task("after", "logging", 1, 1, TimeUnit::Hours),
    i32::MIN + 1
  );
  controller.shutdown().await;
}
