//! The task execution service: drains the shared queue into a bounded
//! worker pool and keeps track of outstanding work.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::Ordering as AtomicOrdering;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, Instrument};
use uuid::Uuid;

use crate::error::{BuildError, ServiceError};
use crate::instrument::InstrumentedQueue;
use crate::metrics::SchedulerMetrics;
use crate::queue::TaskQueue;
use crate::sequence::SequenceGenerator;
use crate::service::{Lifecycle, ServiceListener, ServiceState};
use crate::sink::SharedSink;
use crate::task::SharedTask;
use crate::worker::{WorkHandle, WorkerPool};

/// Bounded wait of each queue poll.
pub const DEFAULT_POLL_TIMEOUT: Duration = Duration::from_millis(500);
/// Period of the sweep dropping finished work handles.
pub const DEFAULT_RECLAIM_PERIOD: Duration = Duration::from_secs(10);

/// Host parallelism, or 1 when it cannot be determined.
pub fn default_concurrency() -> usize {
  std::thread::available_parallelism()
    .map(|n| n.get())
    .unwrap_or(1)
}

/// Builder for an [`ExecutionService`].
pub struct ExecutionServiceBuilder {
  name: String,
  queue: TaskQueue,
  sink: SharedSink,
  concurrency: Option<usize>,
  poll_timeout: Duration,
  reclaim_period: Duration,
  execution_ids: Option<Arc<SequenceGenerator>>,
  metrics: Option<SchedulerMetrics>,
  listeners: Vec<Arc<dyn ServiceListener>>,
}

impl ExecutionServiceBuilder {
  pub fn name(mut self, name: &str) -> Self {
    self.name = name.to_string();
    self
  }

  /// Worker pool size. Defaults to the host's available parallelism.
  pub fn concurrency(mut self, workers: usize) -> Self {
    self.concurrency = Some(workers);
    self
  }

  pub fn poll_timeout(mut self, timeout: Duration) -> Self {
    self.poll_timeout = timeout;
    self
  }

  pub fn reclaim_period(mut self, period: Duration) -> Self {
    self.reclaim_period = period;
    self
  }

  /// Sequence used to number runs. Defaults to a private generator whose first id is 1.
  pub fn execution_ids(mut self, sequence: Arc<SequenceGenerator>) -> Self {
    self.execution_ids = Some(sequence);
    self
  }

  pub fn metrics(mut self, metrics: SchedulerMetrics) -> Self {
    self.metrics = Some(metrics);
    self
  }

  pub fn listener(mut self, listener: Arc<dyn ServiceListener>) -> Self {
    self.listeners.push(listener);
    self
  }

  pub fn build(self) -> Result<ExecutionService, BuildError> {
    let concurrency = self.concurrency.unwrap_or_else(default_concurrency);
    if concurrency == 0 {
      return Err(BuildError::ZeroConcurrency);
    }

    let metrics = self.metrics.unwrap_or_default();
    let queue = match self.execution_ids {
      Some(ids) => InstrumentedQueue::with_sequence(self.queue, self.sink, ids),
      None => InstrumentedQueue::new(self.queue, self.sink),
    };

    let lifecycle = Arc::new(Lifecycle::new(&self.name));
    for listener in self.listeners {
      lifecycle.add_listener(listener);
    }

    Ok(ExecutionService {
      inner: Arc::new(Inner {
        queue,
        pool: WorkerPool::new(concurrency, metrics.clone()),
        in_flight: Mutex::new(HashMap::new()),
        metrics,
        poll_timeout: self.poll_timeout,
        reclaim_period: self.reclaim_period.max(Duration::from_millis(1)),
      }),
      lifecycle,
      cancel: CancellationToken::new(),
      loops: Mutex::new(Vec::new()),
    })
  }
}

/// State shared between the service handle, the poll loop and the sweep.
struct Inner {
  queue: InstrumentedQueue,
  pool: WorkerPool,
  /// Outstanding work. Submission, the sweep and shutdown all go through this lock.
  in_flight: Mutex<HashMap<Uuid, WorkHandle>>,
  metrics: SchedulerMetrics,
  poll_timeout: Duration,
  reclaim_period: Duration,
}

impl Inner {
  fn submit(&self, task: SharedTask) {
    let handle = self.pool.submit(task);
    trace!(work_id = %handle.id(), task = %handle.task_name(), "Submitted task to the worker pool.");

    let mut in_flight = self.in_flight.lock();
    in_flight.insert(handle.id(), handle);
    self
      .metrics
      .in_flight_current
      .store(in_flight.len(), AtomicOrdering::Relaxed);
  }

  fn reclaim_finished(&self) -> usize {
    let mut in_flight = self.in_flight.lock();
    let before = in_flight.len();
    in_flight.retain(|_, handle| !handle.is_finished());
    let removed = before - in_flight.len();
    self
      .metrics
      .in_flight_current
      .store(in_flight.len(), AtomicOrdering::Relaxed);
    drop(in_flight);

    if removed > 0 {
      self
        .metrics
        .handles_reclaimed
        .fetch_add(removed, AtomicOrdering::Relaxed);
      debug!(removed, "Reclaimed finished work handles.");
    }
    removed
  }

  /// Cancels unfinished work and empties the set. Returns the number cancelled.
  fn cancel_in_flight(&self) -> usize {
    let drained: Vec<WorkHandle> = {
      let mut in_flight = self.in_flight.lock();
      let drained = in_flight.drain().map(|(_, handle)| handle).collect();
      self
        .metrics
        .in_flight_current
        .store(0, AtomicOrdering::Relaxed);
      drained
    };

    let mut cancelled = 0;
    for handle in drained.iter().filter(|h| !h.is_finished()) {
      debug!(work_id = %handle.id(), task = %handle.task_name(), "Cancelling in-flight work.");
      handle.cancel();
      cancelled += 1;
    }
    self
      .metrics
      .handles_cancelled
      .fetch_add(cancelled, AtomicOrdering::Relaxed);
    cancelled
  }
}

/// Singleton consumer of the shared queue.
///
/// While running, a poll loop takes tasks off the queue (assigning each run
/// its execution id and reporting `STARTING` to the sink) and submits them to
/// the worker pool. A second loop periodically drops handles of finished work.
/// Tasks are expected to arrive already wrapped in an
/// [`InstrumentedTask`](crate::instrument::InstrumentedTask) bound to the same
/// sink; the pool itself never needs to know. Errors raised by a task stay
/// within that task's run.
pub struct ExecutionService {
  inner: Arc<Inner>,
  lifecycle: Arc<Lifecycle>,
  cancel: CancellationToken,
  loops: Mutex<Vec<JoinHandle<()>>>,
}

impl ExecutionService {
  pub fn builder(queue: TaskQueue, sink: SharedSink) -> ExecutionServiceBuilder {
    ExecutionServiceBuilder {
      name: "task-execution".to_string(),
      queue,
      sink,
      concurrency: None,
      poll_timeout: DEFAULT_POLL_TIMEOUT,
      reclaim_period: DEFAULT_RECLAIM_PERIOD,
      execution_ids: None,
      metrics: None,
      listeners: Vec::new(),
    }
  }

  pub fn name(&self) -> &str {
    self.lifecycle.name()
  }

  pub fn state(&self) -> ServiceState {
    self.lifecycle.state()
  }

  pub fn failure(&self) -> Option<ServiceError> {
    self.lifecycle.failure()
  }

  pub fn add_listener(&self, listener: Arc<dyn ServiceListener>) {
    self.lifecycle.add_listener(listener);
  }

  pub fn concurrency(&self) -> usize {
    self.inner.pool.size()
  }

  /// Workers currently running a task body.
  pub fn active_workers(&self) -> usize {
    self.inner.pool.active_count()
  }

  /// Size of the in-flight tracking set, finished-but-unreclaimed work included.
  pub fn in_flight_count(&self) -> usize {
    self.inner.in_flight.lock().len()
  }

  pub fn queue(&self) -> &InstrumentedQueue {
    &self.inner.queue
  }

  /// Runs one reclamation sweep now. Returns the number of handles dropped.
  pub fn reclaim_finished(&self) -> usize {
    self.inner.reclaim_finished()
  }

  /// Starts the poll and reclamation loops. Must be called within a Tokio runtime.
  pub fn start(&self) -> Result<(), ServiceError> {
    self.lifecycle.begin_start()?;
    self.lifecycle.mark_running();

    info!(
      service = %self.name(),
      concurrency = self.concurrency(),
      "Task execution service starting loops."
    );
    let poller = tokio::spawn(
      poll_loop(self.inner.clone(), self.cancel.clone())
        .instrument(tracing::info_span!("execution_poll", service = %self.name())),
    );
    let reclaimer = tokio::spawn(
      reclaim_loop(self.inner.clone(), self.cancel.clone())
        .instrument(tracing::info_span!("execution_reclaim", service = %self.name())),
    );
    self.loops.lock().extend([poller, reclaimer]);
    Ok(())
  }

  /// Stops polling, cancels unfinished work, clears the in-flight set and
  /// shuts down the pool. Does not wait for running bodies. Idempotent.
  ///
  /// The teardown runs on its own Tokio task, so it completes even if the
  /// caller stops waiting (for instance under a timeout).
  pub async fn stop(&self) -> ServiceState {
    if self.lifecycle.begin_stop() {
      self.cancel.cancel();
      let loops: Vec<JoinHandle<()>> = self.loops.lock().drain(..).collect();
      tokio::spawn(
        teardown(self.inner.clone(), self.lifecycle.clone(), loops)
          .instrument(tracing::info_span!("execution_stop", service = %self.name())),
      );
    }
    self.lifecycle.await_terminal().await
  }
}

impl Drop for ExecutionService {
  fn drop(&mut self) {
    self.cancel.cancel();
  }
}

impl fmt::Debug for ExecutionService {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("ExecutionService")
      .field("name", &self.name())
      .field("state", &self.state())
      .field("concurrency", &self.concurrency())
      .field("in_flight", &self.in_flight_count())
      .field("poll_timeout", &self.inner.poll_timeout)
      .field("reclaim_period", &self.inner.reclaim_period)
      .finish()
  }
}

async fn teardown(inner: Arc<Inner>, lifecycle: Arc<Lifecycle>, loops: Vec<JoinHandle<()>>) {
  let mut panicked = None;
  for handle in loops {
    if let Err(e) = handle.await {
      if e.is_panic() {
        panicked = Some(format!("{}", e));
      }
    }
  }

  let cancelled = inner.cancel_in_flight();
  inner.pool.shutdown();
  info!(cancelled, "Task execution service stopped.");

  match panicked {
    Some(message) => lifecycle.fail(ServiceError::Panicked(message)),
    None => lifecycle.mark_terminated(),
  }
}

async fn poll_loop(inner: Arc<Inner>, cancel: CancellationToken) {
  debug!("Poll loop started.");
  loop {
    let polled = tokio::select! {
      biased;
      _ = cancel.cancelled() => break,
      polled = inner.queue.poll(inner.poll_timeout) => polled,
    };

    match polled {
      Some(task) => {
        inner
          .metrics
          .tasks_dequeued
          .fetch_add(1, AtomicOrdering::Relaxed);
        inner.submit(task);
      }
      None if inner.queue.queue().is_closed() && inner.queue.is_empty() => {
        info!("Task queue closed and drained; idling until stopped.");
        cancel.cancelled().await;
        break;
      }
      None => {}
    }
  }
  debug!("Poll loop exited.");
}

async fn reclaim_loop(inner: Arc<Inner>, cancel: CancellationToken) {
  let period = inner.reclaim_period;
  let Some(first) = Instant::now().checked_add(period) else {
    cancel.cancelled().await;
    return;
  };
  let mut ticker = interval_at(first, period);
  ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
  loop {
    tokio::select! {
      biased;
      _ = cancel.cancelled() => break,
      _ = ticker.tick() => {
        inner.reclaim_finished();
      }
    }
  }
  debug!("Reclamation loop exited.");
}
