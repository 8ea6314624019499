use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

// --- Simple Histogram Implementation ---

/// A basic concurrent histogram storing count and sum.
///
/// Suitable for simple latency tracking without detailed percentile information.
#[derive(Debug, Default)]
pub struct SimpleHistogram {
  count: AtomicUsize,
  sum_micros: AtomicUsize,
}

impl SimpleHistogram {
  /// Records a duration observation in the histogram.
  pub fn record(&self, duration: Duration) {
    self.count.fetch_add(1, Ordering::Relaxed);
    self.sum_micros.fetch_add(
      duration.as_micros().try_into().unwrap_or(usize::MAX),
      Ordering::Relaxed,
    );
  }

  /// Gets the total number of observations recorded.
  pub fn get_count(&self) -> usize {
    self.count.load(Ordering::Relaxed)
  }

  /// Gets the total sum of durations recorded (in microseconds).
  pub fn get_sum_micros(&self) -> usize {
    self.sum_micros.load(Ordering::Relaxed)
  }
}

// --- Main Metrics Struct (Internal State) ---

/// Atomic counters shared by producers, the execution service and the
/// controller. Cloning only clones the `Arc`s.
#[derive(Debug, Clone, Default)]
pub struct SchedulerMetrics {
  // --- Producer side ---
  /// Scheduled ticks processed by all producers.
  pub producer_ticks: Arc<AtomicUsize>,
  /// Tasks successfully offered onto the shared queue by a tick.
  pub tasks_enqueued: Arc<AtomicUsize>,
  /// Offer attempts rejected because the queue stayed full.
  pub enqueue_retries: Arc<AtomicUsize>,
  /// Ticks dropped after the retry budget was exhausted.
  pub ticks_skipped: Arc<AtomicUsize>,

  // --- Execution side ---
  /// Tasks pulled off the queue by the execution service.
  pub tasks_dequeued: Arc<AtomicUsize>,
  /// Tasks handed to the worker pool.
  pub tasks_submitted: Arc<AtomicUsize>,
  pub runs_completed: Arc<AtomicUsize>,
  pub runs_failed: Arc<AtomicUsize>,
  pub runs_abandoned: Arc<AtomicUsize>,
  /// Finished handles dropped by the reclamation sweep.
  pub handles_reclaimed: Arc<AtomicUsize>,
  /// Unfinished handles cancelled during shutdown.
  pub handles_cancelled: Arc<AtomicUsize>,

  // --- Controller side ---
  pub tasks_registered: Arc<AtomicUsize>,
  pub registrations_failed: Arc<AtomicUsize>,
  pub tasks_queued_immediately: Arc<AtomicUsize>,

  // --- Gauges ---
  /// Current number of tracked in-flight handles.
  pub in_flight_current: Arc<AtomicUsize>,
  /// Current number of workers executing a task body.
  pub workers_active_current: Arc<AtomicUsize>,

  // --- Histograms ---
  /// Execution duration of task runs, measured from the moment a worker picks them up.
  pub task_execution_duration: Arc<SimpleHistogram>,
}

impl SchedulerMetrics {
  /// Creates a new `SchedulerMetrics` instance with all counters initialized to zero.
  pub fn new() -> Self {
    Self::default()
  }

  /// Creates a snapshot of the current metric values.
  pub fn snapshot(&self) -> MetricsSnapshot {
    let order = Ordering::Relaxed;

    MetricsSnapshot {
      producer_ticks: self.producer_ticks.load(order),
      tasks_enqueued: self.tasks_enqueued.load(order),
      enqueue_retries: self.enqueue_retries.load(order),
      ticks_skipped: self.ticks_skipped.load(order),
      tasks_dequeued: self.tasks_dequeued.load(order),
      tasks_submitted: self.tasks_submitted.load(order),
      runs_completed: self.runs_completed.load(order),
      runs_failed: self.runs_failed.load(order),
      runs_abandoned: self.runs_abandoned.load(order),
      handles_reclaimed: self.handles_reclaimed.load(order),
      handles_cancelled: self.handles_cancelled.load(order),
      tasks_registered: self.tasks_registered.load(order),
      registrations_failed: self.registrations_failed.load(order),
      tasks_queued_immediately: self.tasks_queued_immediately.load(order),
      in_flight_current: self.in_flight_current.load(order),
      workers_active_current: self.workers_active_current.load(order),
      task_execution_duration_count: self.task_execution_duration.get_count(),
      task_execution_duration_sum_micros: self.task_execution_duration.get_sum_micros(),
    }
  }
}

// --- Metrics Snapshot Struct (Public Data) ---

/// A snapshot of the scheduler's metrics at a specific point in time.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct MetricsSnapshot {
  // Counters
  pub producer_ticks: usize,
  pub tasks_enqueued: usize,
  pub enqueue_retries: usize,
  pub ticks_skipped: usize,
  pub tasks_dequeued: usize,
  pub tasks_submitted: usize,
  pub runs_completed: usize,
  pub runs_failed: usize,
  pub runs_abandoned: usize,
  pub handles_reclaimed: usize,
  pub handles_cancelled: usize,
  pub tasks_registered: usize,
  pub registrations_failed: usize,
  pub tasks_queued_immediately: usize,
  // Gauges
  pub in_flight_current: usize,
  pub workers_active_current: usize,
  // Histogram Data
  pub task_execution_duration_count: usize,
  pub task_execution_duration_sum_micros: usize,
}

impl MetricsSnapshot {
  /// Mean task execution duration in microseconds, if any run finished.
  pub fn mean_execution_duration_micros(&self) -> Option<f64> {
    if self.task_execution_duration_count == 0 {
      None
    } else {
      Some(self.task_execution_duration_sum_micros as f64 / self.task_execution_duration_count as f64)
    }
  }

  /// Mean task execution duration, if any run finished.
  pub fn mean_execution_duration(&self) -> Option<Duration> {
    self
      .mean_execution_duration_micros()
      .map(|micros| Duration::from_micros(micros as u64))
  }

  /// Runs that reached an outcome state.
  pub fn runs_finished(&self) -> usize {
    self.runs_completed + self.runs_failed + self.runs_abandoned
  }
}
