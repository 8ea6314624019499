//! Scheduled queuing service: one per registered task.
//!
//! Each producer owns a private fixed-rate loop that offers its task onto the
//! shared queue at every tick. A tick that cannot enqueue within the retry
//! budget is dropped (counted in `ticks_skipped`), never raised.

use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn, Instrument};

use crate::error::{QueueError, ServiceError};
use crate::metrics::SchedulerMetrics;
use crate::queue::TaskQueue;
use crate::schedule::Schedule;
use crate::service::{Lifecycle, ServiceListener, ServiceState};
use crate::task::SharedTask;

use std::sync::atomic::Ordering as AtomicOrdering;

/// Offer attempts per tick.
pub const DEFAULT_RETRY_BUDGET: u32 = 3;
/// Bounded wait for each offer attempt.
pub const DEFAULT_OFFER_TIMEOUT: Duration = Duration::from_millis(500);

/// Builder for a [`ProducerService`].
pub struct ProducerServiceBuilder {
  name: String,
  schedule: Schedule,
  task: SharedTask,
  queue: TaskQueue,
  retry_budget: u32,
  offer_timeout: Duration,
  metrics: Option<SchedulerMetrics>,
  listeners: Vec<Arc<dyn ServiceListener>>,
}

impl ProducerServiceBuilder {
  /// Number of offer attempts per tick before the tick is skipped.
  pub fn retry_budget(mut self, attempts: u32) -> Self {
    self.retry_budget = attempts;
    self
  }

  /// Maximum wait for each individual offer attempt.
  pub fn offer_timeout(mut self, timeout: Duration) -> Self {
    self.offer_timeout = timeout;
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

  pub fn build(self) -> ProducerService {
    let lifecycle = Arc::new(Lifecycle::new(&self.name));
    for listener in self.listeners {
      lifecycle.add_listener(listener);
    }
    ProducerService {
      schedule: self.schedule,
      enqueuer: Arc::new(Enqueuer {
        name: self.name,
        task: self.task,
        queue: self.queue,
        retry_budget: self.retry_budget,
        offer_timeout: self.offer_timeout,
        metrics: self.metrics.unwrap_or_default(),
      }),
      lifecycle,
      cancel: CancellationToken::new(),
      handle: Mutex::new(None),
    }
  }
}

/// The per-tick enqueue logic, shared with the spawned loop.
struct Enqueuer {
  name: String,
  task: SharedTask,
  queue: TaskQueue,
  retry_budget: u32,
  offer_timeout: Duration,
  metrics: SchedulerMetrics,
}

impl Enqueuer {
  async fn run_one_iteration(&self) -> Result<(), ServiceError> {
    self
      .metrics
      .producer_ticks
      .fetch_add(1, AtomicOrdering::Relaxed);
    trace!("Queuing task.");

    for attempt in 1..=self.retry_budget {
      match self.queue.offer(self.task.clone(), self.offer_timeout).await {
        Ok(()) => {
          self
            .metrics
            .tasks_enqueued
            .fetch_add(1, AtomicOrdering::Relaxed);
          return Ok(());
        }
        Err(QueueError::Full) => {
          self
            .metrics
            .enqueue_retries
            .fetch_add(1, AtomicOrdering::Relaxed);
          info!(
            attempt,
            budget = self.retry_budget,
            "Failed to put task into the queue, retrying."
          );
        }
        Err(QueueError::Closed) => return Err(ServiceError::QueueClosed),
      }
    }

    self
      .metrics
      .ticks_skipped
      .fetch_add(1, AtomicOrdering::Relaxed);
    warn!("Task was not queued for execution. Skipping run.");
    Ok(())
  }
}

/// Periodically offers one task onto the shared queue according to its
/// [`Schedule`].
///
/// Lifecycle: `New -> Starting -> Running -> Stopping -> Terminated`, or
/// `Failed` if a tick hits a non-retryable error. A stopped producer cannot be
/// restarted. Stopping only halts future ticks; a task already queued stays
/// queued.
pub struct ProducerService {
  schedule: Schedule,
  enqueuer: Arc<Enqueuer>,
  lifecycle: Arc<Lifecycle>,
  cancel: CancellationToken,
  handle: Mutex<Option<JoinHandle<()>>>,
}

impl ProducerService {
  pub fn builder(
    name: &str,
    schedule: Schedule,
    task: SharedTask,
    queue: TaskQueue,
  ) -> ProducerServiceBuilder {
    ProducerServiceBuilder {
      name: name.to_string(),
      schedule,
      task,
      queue,
      retry_budget: DEFAULT_RETRY_BUDGET,
      offer_timeout: DEFAULT_OFFER_TIMEOUT,
      metrics: None,
      listeners: Vec::new(),
    }
  }

  /// Producer with default retry budget and offer timeout.
  pub fn new(name: &str, schedule: Schedule, task: SharedTask, queue: TaskQueue) -> Self {
    Self::builder(name, schedule, task, queue).build()
  }

  pub fn name(&self) -> &str {
    self.lifecycle.name()
  }

  pub fn schedule(&self) -> &Schedule {
    &self.schedule
  }

  pub fn task(&self) -> &SharedTask {
    &self.enqueuer.task
  }

  pub fn state(&self) -> ServiceState {
    self.lifecycle.state()
  }

  pub fn is_running(&self) -> bool {
    self.state() == ServiceState::Running
  }

  /// Error that moved the service to `Failed`, if any.
  pub fn failure(&self) -> Option<ServiceError> {
    self.lifecycle.failure()
  }

  pub fn add_listener(&self, listener: Arc<dyn ServiceListener>) {
    self.lifecycle.add_listener(listener);
  }

  /// Starts the scheduling loop. Must be called within a Tokio runtime.
  ///
  /// # Errors
  ///
  /// - [`ServiceError::AlreadyStarted`]: the service is not `New`.
  /// - [`ServiceError::InvalidSchedule`]: the interval is zero; the service is now `Failed`.
  pub fn start(&self) -> Result<(), ServiceError> {
    self.lifecycle.begin_start()?;

    if self.schedule.interval() == 0 {
      let error = ServiceError::InvalidSchedule;
      self.lifecycle.fail(error.clone());
      return Err(error);
    }

    self.lifecycle.mark_running();

    let span = tracing::info_span!("producer", service = %self.enqueuer.name);
    let handle = tokio::spawn(
      run_loop(
        self.enqueuer.clone(),
        self.schedule,
        self.lifecycle.clone(),
        self.cancel.clone(),
      )
      .instrument(span),
    );
    *self.handle.lock() = Some(handle);
    Ok(())
  }

  /// Stops future ticks and waits for the loop to exit. Idempotent; returns
  /// the final state (`Terminated`, or `Failed` if the loop had failed).
  pub async fn stop(&self) -> ServiceState {
    if self.lifecycle.begin_stop() {
      self.cancel.cancel();
      let handle = self.handle.lock().take();
      if let Some(handle) = handle {
        if let Err(e) = handle.await {
          if e.is_panic() {
            self
              .lifecycle
              .fail(ServiceError::Panicked(format!("{}", e)));
          }
        }
      }
      self.lifecycle.mark_terminated();
    }
    self.lifecycle.await_terminal().await
  }
}

impl Drop for ProducerService {
  fn drop(&mut self) {
    self.cancel.cancel();
  }
}

impl fmt::Debug for ProducerService {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("ProducerService")
      .field("name", &self.enqueuer.name)
      .field("schedule", &self.schedule)
      .field("state", &self.state())
      .field("retry_budget", &self.enqueuer.retry_budget)
      .field("offer_timeout", &self.enqueuer.offer_timeout)
      .finish()
  }
}

/// Fixed-rate loop: first tick after the initial delay, then every interval
/// measured from the previous tick's deadline. Overrunning ticks are caught up,
/// not merged.
async fn run_loop(
  enqueuer: Arc<Enqueuer>,
  schedule: Schedule,
  lifecycle: Arc<Lifecycle>,
  cancel: CancellationToken,
) {
  let period = schedule.interval_duration();
  let mut next_tick = match Instant::now().checked_add(schedule.initial_delay_duration()) {
    Some(deadline) => deadline,
    None => {
      debug!("Initial delay is beyond the clock range; no tick will ever fire.");
      cancel.cancelled().await;
      return;
    }
  };

  loop {
    tokio::select! {
      biased;
      _ = cancel.cancelled() => break,
      _ = sleep_until(next_tick) => {}
    }

    let iteration = AssertUnwindSafe(enqueuer.run_one_iteration()).catch_unwind();
    let result = tokio::select! {
      biased;
      _ = cancel.cancelled() => break,
      result = iteration => result,
    };

    match result {
      Ok(Ok(())) => {}
      Ok(Err(e)) => {
        lifecycle.fail(e);
        return;
      }
      Err(_) => {
        lifecycle.fail(ServiceError::Panicked("enqueue iteration panicked".to_string()));
        return;
      }
    }

    next_tick = match next_tick.checked_add(period) {
      Some(deadline) => deadline,
      None => {
        cancel.cancelled().await;
        break;
      }
    };
  }

  debug!("Scheduling loop exited.");
}
