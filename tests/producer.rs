//! tests/producer.rs
//! Scheduling loop behavior: fixed-rate ticks, backpressure and lifecycle.

mod common;

use crate::common::{build_keeper, counter_task, setup_tracing, test_types, wait_until};
use queuekeeper::{
  MemorySink, ProducerService, Schedule, SchedulerMetrics, ServiceError, ServiceState, SharedTask,
  Task, TaskQueue, TimeUnit,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration as StdDuration;

fn noop_task(name: &str) -> SharedTask {
  Arc::new(counter_task(
    name,
    Arc::new(AtomicUsize::new(0)),
    StdDuration::ZERO,
  ))
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_fixed_rate_counter() {
  setup_tracing();
  let sink = Arc::new(MemorySink::new());
  let counter = Arc::new(AtomicUsize::new(0));
  let keeper = build_keeper(2, test_types(counter.clone()), sink);

  keeper.start_task("counter", "counter", 0, 100, TimeUnit::Milliseconds);
  tokio::time::sleep(StdDuration::from_millis(350)).await;
  let runs = counter.load(Ordering::SeqCst);

  assert!(
    (3..=4).contains(&runs),
    "Expected 3-4 runs after 350ms at 100ms fixed rate, got {}",
    runs
  );
  keeper.shutdown(None).await.unwrap();
}

#[tokio::test]
async fn test_full_queue_skips_tick_without_error() {
  setup_tracing();
  let queue = TaskQueue::bounded(1);
  queue.try_add(noop_task("occupant")).unwrap();
  let metrics = SchedulerMetrics::new();

  let producer = ProducerService::builder(
    "blocked",
    Schedule::new(0, 1, TimeUnit::Hours),
    noop_task("blocked"),
    queue.clone(),
  )
  .retry_budget(3)
  .offer_timeout(StdDuration::from_millis(20))
  .metrics(metrics.clone())
  .build();
  producer.start().unwrap();

  assert!(
    wait_until(StdDuration::from_secs(2), || metrics.snapshot().ticks_skipped == 1).await,
    "Tick should have been skipped"
  );
  let snapshot = metrics.snapshot();
  assert_eq!(snapshot.producer_ticks, 1);
  assert_eq!(snapshot.enqueue_retries, 3);
  assert_eq!(snapshot.tasks_enqueued, 0);

  // Queue untouched: still only the occupant.
  assert_eq!(queue.len(), 1);
  let head = queue.poll(StdDuration::from_millis(10)).await.unwrap();
  assert_eq!(head.name(), "occupant");

  assert_eq!(producer.state(), ServiceState::Running);
  assert_eq!(producer.failure(), None);
  assert_eq!(producer.stop().await, ServiceState::Terminated);
}

#[tokio::test]
async fn test_stop_halts_future_ticks_but_keeps_queued_task() {
  setup_tracing();
  let queue = TaskQueue::bounded(8);
  let metrics = SchedulerMetrics::new();
  let producer = ProducerService::builder(
    "ticker",
    Schedule::new(0, 20, TimeUnit::Milliseconds),
    noop_task("ticker"),
    queue.clone(),
  )
  .metrics(metrics.clone())
  .build();
  producer.start().unwrap();

  assert!(wait_until(StdDuration::from_secs(1), || queue.len() >= 2).await);
  assert_eq!(producer.stop().await, ServiceState::Terminated);
  let queued = queue.len();
  let ticks = metrics.snapshot().producer_ticks;

  tokio::time::sleep(StdDuration::from_millis(100)).await;
  assert_eq!(queue.len(), queued, "Stopped producer must not enqueue");
  assert_eq!(metrics.snapshot().producer_ticks, ticks);
  assert!(queued >= 2, "Already queued tasks stay queued");
}

#[tokio::test]
async fn test_stopped_producer_cannot_restart() {
  setup_tracing();
  let producer = ProducerService::new(
    "once",
    Schedule::new(1, 1, TimeUnit::Hours),
    noop_task("once"),
    TaskQueue::default(),
  );
  producer.start().unwrap();
  assert!(producer.is_running());
  assert_eq!(
    producer.start(),
    Err(ServiceError::AlreadyStarted(ServiceState::Running))
  );

  assert_eq!(producer.stop().await, ServiceState::Terminated);
  assert_eq!(
    producer.start(),
    Err(ServiceError::AlreadyStarted(ServiceState::Terminated))
  );
}

#[tokio::test]
async fn test_stopping_unstarted_producer_terminates_it() {
  setup_tracing();
  let producer = ProducerService::new(
    "never",
    Schedule::new(0, 1, TimeUnit::Seconds),
    noop_task("never"),
    TaskQueue::default(),
  );
  assert_eq!(producer.state(), ServiceState::New);
  assert_eq!(producer.stop().await, ServiceState::Terminated);
}

#[tokio::test]
async fn test_zero_interval_fails_the_service() {
  setup_tracing();
  let producer = ProducerService::new(
    "zero",
    Schedule::new(0, 0, TimeUnit::Milliseconds),
    noop_task("zero"),
    TaskQueue::default(),
  );
  assert_eq!(producer.start(), Err(ServiceError::InvalidSchedule));
  assert_eq!(producer.state(), ServiceState::Failed);
  assert_eq!(producer.failure(), Some(ServiceError::InvalidSchedule));
  assert_eq!(producer.stop().await, ServiceState::Failed);
}

#[tokio::test]
async fn test_closed_queue_fails_only_that_producer() {
  setup_tracing();
  let closed = TaskQueue::bounded(4);
  closed.close().await;
  let open = TaskQueue::bounded(4);

  let broken = ProducerService::new(
    "broken",
    Schedule::new(0, 10, TimeUnit::Milliseconds),
    noop_task("broken"),
    closed,
  );
  let healthy = ProducerService::new(
    "healthy",
    Schedule::new(0, 10, TimeUnit::Milliseconds),
    noop_task("healthy"),
    open.clone(),
  );
  broken.start().unwrap();
  healthy.start().unwrap();

  assert!(wait_until(StdDuration::from_secs(1), || broken.state() == ServiceState::Failed).await);
  assert_eq!(broken.failure(), Some(ServiceError::QueueClosed));

  assert!(wait_until(StdDuration::from_secs(1), || open.len() >= 2).await);
  assert_eq!(healthy.state(), ServiceState::Running);
  healthy.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_overrun_ticks_are_caught_up_not_merged() {
  setup_tracing();
  let queue = TaskQueue::bounded(1);
  queue.try_add(noop_task("occupant")).unwrap();
  let metrics = SchedulerMetrics::new();

  // Every 50ms; the first tick blocks on the full queue until it is drained at 200ms.
  let producer = ProducerService::builder(
    "catch-up",
    Schedule::new(0, 50, TimeUnit::Milliseconds),
    noop_task("catch-up"),
    queue.clone(),
  )
  .retry_budget(1)
  .offer_timeout(StdDuration::from_millis(400))
  .metrics(metrics.clone())
  .build();
  producer.start().unwrap();

  tokio::time::sleep(StdDuration::from_millis(200)).await;
  assert_eq!(metrics.snapshot().producer_ticks, 1, "First tick still blocked");

  // Drain continuously until 500ms after start.
  let until = tokio::time::Instant::now() + StdDuration::from_millis(300);
  while tokio::time::Instant::now() < until {
    let _ = queue.poll(StdDuration::from_millis(5)).await;
  }
  producer.stop().await;

  // Deadlines at 0, 50, ..., 500ms: the ones missed while blocked still fire.
  let snapshot = metrics.snapshot();
  assert!(
    snapshot.producer_ticks >= 10,
    "Expected missed ticks to be caught up, got {}",
    snapshot.producer_ticks
  );
  assert_eq!(snapshot.ticks_skipped, 0);
}
