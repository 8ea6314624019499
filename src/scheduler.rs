use crate::config::TaskTable;
use crate::controller::{TaskController, TaskSummary, TaskTypes, DEFAULT_STOP_TIMEOUT};
use crate::error::{BuildError, ControllerError, QueueError, ServiceError, ShutdownError};
use crate::execution::{ExecutionService, DEFAULT_POLL_TIMEOUT, DEFAULT_RECLAIM_PERIOD};
use crate::metrics::{MetricsSnapshot, SchedulerMetrics};
use crate::producer::{DEFAULT_OFFER_TIMEOUT, DEFAULT_RETRY_BUDGET};
use crate::queue::{TaskQueue, DEFAULT_QUEUE_CAPACITY};
use crate::schedule::TimeUnit;
use crate::service::{LoggingServiceListener, ServiceListener, ServiceState};
use crate::sink::{LoggingSink, SharedSink};
use crate::task::TaskId;

use std::sync::Arc;
use std::time::Duration;

use tracing::{error, info, warn};

/// Builder for configuring and creating a [`QueueKeeper`].
///
/// Every setting has a default; `build()` on a fresh builder gives a queue of
/// 1024 slots, one worker per available core and a [`LoggingSink`].
///
/// # Example
///
/// ```no_run
/// use queuekeeper::{QueueKeeper, TaskTable};
/// use std::time::Duration;
///
/// # async fn run() -> Result<(), Box<dyn std::error::Error>> {
/// let keeper = QueueKeeper::builder()
///     .concurrency(4)
///     .queue_capacity(256)
///     .reclaim_period(Duration::from_secs(5))
///     .task_table(TaskTable::load("tasks.properties")?)
///     .build()?;
/// # Ok(())
/// # }
/// ```
pub struct QueueKeeperBuilder {
  queue_capacity: usize,
  concurrency: Option<usize>,
  poll_timeout: Duration,
  reclaim_period: Duration,
  retry_budget: u32,
  offer_timeout: Duration,
  stop_timeout: Duration,
  sink: Option<SharedSink>,
  task_types: TaskTypes,
  task_table: Option<TaskTable>,
  listeners: Vec<Arc<dyn ServiceListener>>,
  log_service_transitions: bool,
}

impl Default for QueueKeeperBuilder {
  fn default() -> Self {
    Self {
      queue_capacity: DEFAULT_QUEUE_CAPACITY,
      concurrency: None,
      poll_timeout: DEFAULT_POLL_TIMEOUT,
      reclaim_period: DEFAULT_RECLAIM_PERIOD,
      retry_budget: DEFAULT_RETRY_BUDGET,
      offer_timeout: DEFAULT_OFFER_TIMEOUT,
      stop_timeout: DEFAULT_STOP_TIMEOUT,
      sink: None,
      task_types: TaskTypes::new(),
      task_table: None,
      listeners: Vec::new(),
      log_service_transitions: true,
    }
  }
}

impl QueueKeeperBuilder {
  pub fn new() -> Self {
    Self::default()
  }

  /// Capacity of the shared task queue. Must be greater than 0.
  pub fn queue_capacity(mut self, capacity: usize) -> Self {
    self.queue_capacity = capacity;
    self
  }

  /// Size of the worker pool. Defaults to the host's available parallelism.
  pub fn concurrency(mut self, workers: usize) -> Self {
    self.concurrency = Some(workers);
    self
  }

  pub fn poll_timeout(mut self, timeout: Duration) -> Self {
    self.poll_timeout = timeout;
    self
  }

  /// How often finished work is dropped from the in-flight set.
  pub fn reclaim_period(mut self, period: Duration) -> Self {
    self.reclaim_period = period;
    self
  }

  /// Offer attempts per scheduled tick before the tick is skipped.
  pub fn retry_budget(mut self, attempts: u32) -> Self {
    self.retry_budget = attempts;
    self
  }

  pub fn offer_timeout(mut self, timeout: Duration) -> Self {
    self.offer_timeout = timeout;
    self
  }

  /// Bounded wait for each producer when it is stopped.
  pub fn stop_timeout(mut self, timeout: Duration) -> Self {
    self.stop_timeout = timeout;
    self
  }

  /// Sink receiving every task lifecycle transition.
  pub fn sink(mut self, sink: SharedSink) -> Self {
    self.sink = Some(sink);
    self
  }

  pub fn task_types(mut self, types: TaskTypes) -> Self {
    self.task_types = types;
    self
  }

  /// Tasks to start as soon as the scheduler is built.
  pub fn task_table(mut self, table: TaskTable) -> Self {
    self.task_table = Some(table);
    self
  }

  /// Listener attached to the execution service and to every producer.
  pub fn listener(mut self, listener: Arc<dyn ServiceListener>) -> Self {
    self.listeners.push(listener);
    self
  }

  /// Whether to attach a [`LoggingServiceListener`] to every service (default `true`).
  pub fn log_service_transitions(mut self, enabled: bool) -> Self {
    self.log_service_transitions = enabled;
    self
  }

  /// Builds the scheduler and starts the execution service (and the task
  /// table, if one was given). Must be called within a Tokio runtime.
  ///
  /// # Errors
  ///
  /// - [`BuildError::ZeroQueueCapacity`] / [`BuildError::ZeroConcurrency`]: invalid sizing.
  /// - [`BuildError::ExecutionService`]: the execution service failed to start.
  pub fn build(self) -> Result<QueueKeeper, BuildError> {
    if self.queue_capacity == 0 {
      return Err(BuildError::ZeroQueueCapacity);
    }

    let mut listeners = self.listeners;
    if self.log_service_transitions {
      listeners.push(Arc::new(LoggingServiceListener));
    }

    let metrics = SchedulerMetrics::new();
    let queue = TaskQueue::bounded(self.queue_capacity);
    let sink = self.sink.unwrap_or_else(|| Arc::new(LoggingSink));

    let mut execution = ExecutionService::builder(queue.clone(), sink.clone())
      .poll_timeout(self.poll_timeout)
      .reclaim_period(self.reclaim_period)
      .metrics(metrics.clone());
    if let Some(workers) = self.concurrency {
      execution = execution.concurrency(workers);
    }
    for listener in &listeners {
      execution = execution.listener(listener.clone());
    }
    let execution = execution.build()?;
    execution.start().map_err(BuildError::ExecutionService)?;

    let mut controller = TaskController::builder(queue.clone(), sink)
      .task_types(self.task_types)
      .retry_budget(self.retry_budget)
      .offer_timeout(self.offer_timeout)
      .stop_timeout(self.stop_timeout)
      .metrics(metrics.clone());
    for listener in listeners {
      controller = controller.listener(listener);
    }
    if let Some(table) = self.task_table {
      controller = controller.auto_start(table);
    }
    let controller = controller.build();

    info!(
      queue_capacity = queue.capacity(),
      concurrency = execution.concurrency(),
      registered = controller.len(),
      "QueueKeeper started."
    );

    Ok(QueueKeeper {
      queue,
      metrics,
      controller,
      execution,
    })
  }
}

/// In-process job scheduler: producers offer tasks onto one bounded queue on
/// their schedules, and a single execution service runs them on a worker pool.
///
/// Use [`QueueKeeper::builder()`] to create and configure an instance.
#[derive(Debug)]
pub struct QueueKeeper {
  queue: TaskQueue,
  metrics: SchedulerMetrics,
  controller: TaskController,
  execution: ExecutionService,
}

impl QueueKeeper {
  pub fn builder() -> QueueKeeperBuilder {
    QueueKeeperBuilder::new()
  }

  /// See [`TaskController::start_task`]. Returns
  /// [`INVALID_TASK_ID`](crate::INVALID_TASK_ID) on failure.
  pub fn start_task(
    &self,
    name: &str,
    task_type: &str,
    initial_delay: u64,
    interval: u64,
    unit: TimeUnit,
  ) -> TaskId {
    self
      .controller
      .start_task(name, task_type, initial_delay, interval, unit)
  }

  pub fn start_task_str(
    &self,
    name: &str,
    task_type: &str,
    initial_delay: u64,
    interval: u64,
    unit: &str,
  ) -> TaskId {
    self
      .controller
      .start_task_str(name, task_type, initial_delay, interval, unit)
  }

  /// See [`TaskController::try_start_task`].
  pub fn try_start_task(
    &self,
    name: &str,
    task_type: &str,
    initial_delay: u64,
    interval: u64,
    unit: TimeUnit,
  ) -> Result<TaskId, ControllerError> {
    self
      .controller
      .try_start_task(name, task_type, initial_delay, interval, unit)
  }

  pub async fn stop_task(&self, name: &str) -> bool {
    self.controller.stop_task(name).await
  }

  pub async fn stop_task_by_id(&self, id: TaskId) -> bool {
    self.controller.stop_task_by_id(id).await
  }

  pub fn queue_immediately(&self, name: &str) -> Result<bool, QueueError> {
    self.controller.queue_immediately(name)
  }

  pub fn tasks(&self) -> Vec<TaskSummary> {
    self.controller.tasks()
  }

  pub fn controller(&self) -> &TaskController {
    &self.controller
  }

  pub fn execution(&self) -> &ExecutionService {
    &self.execution
  }

  pub fn queue(&self) -> &TaskQueue {
    &self.queue
  }

  /// Point-in-time copy of the scheduler's counters.
  pub fn metrics(&self) -> MetricsSnapshot {
    self.metrics.snapshot()
  }

  /// Stops every producer, then the execution service, then closes the queue.
  /// The queue is closed even when the wait for the execution service times
  /// out; its teardown then finishes in the background.
  ///
  /// Producers are each given the configured stop timeout; `timeout` bounds
  /// the wait for the execution service.
  ///
  /// # Errors
  ///
  /// - [`ShutdownError::Timeout`]: the execution service did not stop in time.
  /// - [`ShutdownError::Service`]: the execution service ended up `Failed`.
  pub async fn shutdown(&self, timeout: Option<Duration>) -> Result<(), ShutdownError> {
    info!("Initiating shutdown...");
    self.controller.shutdown().await;

    let stop = self.execution.stop();
    let state = match timeout {
      Some(limit) => tokio::time::timeout(limit, stop).await.ok(),
      None => Some(stop.await),
    };

    // Closed either way, so no new producer can register after this call.
    self.queue.close().await;
    let Some(state) = state else {
      error!(timeout = ?timeout, "Shutdown timed out waiting for the execution service.");
      return Err(ShutdownError::Timeout);
    };
    match state {
      ServiceState::Failed => {
        let failure = self
          .execution
          .failure()
          .unwrap_or_else(|| ServiceError::Panicked("unknown failure".to_string()));
        warn!(error = %failure, "Execution service failed while stopping.");
        Err(ShutdownError::Service(failure))
      }
      _ => {
        info!("Shutdown complete.");
        Ok(())
      }
    }
  }
}
