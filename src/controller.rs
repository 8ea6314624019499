//! Registry and management surface for running producers.

use crate::config::TaskTable;
use crate::error::{BoxError, ControllerError, QueueError, ServiceError};
use crate::instrument::InstrumentedTask;
use crate::metrics::SchedulerMetrics;
use crate::producer::{ProducerService, DEFAULT_OFFER_TIMEOUT, DEFAULT_RETRY_BUDGET};
use crate::queue::TaskQueue;
use crate::schedule::{Schedule, TimeUnit};
use crate::sequence::SequenceGenerator;
use crate::service::ServiceListener;
use crate::sink::SharedSink;
use crate::task::{LoggingTask, SharedTask, TaskId, INVALID_TASK_ID};

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::Ordering as AtomicOrdering;
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

/// Identifier under which [`LoggingTask`] is pre-registered.
pub const LOGGING_TASK_TYPE: &str = "logging";

/// Default bound on waiting for one producer to stop.
pub const DEFAULT_STOP_TIMEOUT: Duration = Duration::from_millis(500);

/// Builds a fresh task instance for one registration.
pub type TaskFactory = Arc<dyn Fn() -> Result<SharedTask, BoxError> + Send + Sync + 'static>;

/// Maps task type identifiers to the factories that construct them.
#[derive(Clone)]
pub struct TaskTypes {
  factories: HashMap<String, TaskFactory>,
}

impl TaskTypes {
  /// Registry with the built-in `"logging"` type.
  pub fn new() -> Self {
    let mut types = Self::empty();
    types.register(LOGGING_TASK_TYPE, || {
      Ok(Arc::new(LoggingTask::new()) as SharedTask)
    });
    types
  }

  pub fn empty() -> Self {
    Self {
      factories: HashMap::new(),
    }
  }

  /// Adds or replaces the factory for `task_type`.
  pub fn register<F>(&mut self, task_type: &str, factory: F) -> &mut Self
  where
    F: Fn() -> Result<SharedTask, BoxError> + Send + Sync + 'static,
  {
    self
      .factories
      .insert(task_type.to_string(), Arc::new(factory));
    self
  }

  /// Builder-style variant of [`register`](Self::register).
  pub fn with<F>(mut self, task_type: &str, factory: F) -> Self
  where
    F: Fn() -> Result<SharedTask, BoxError> + Send + Sync + 'static,
  {
    self.register(task_type, factory);
    self
  }

  pub fn contains(&self, task_type: &str) -> bool {
    self.factories.contains_key(task_type)
  }

  pub fn names(&self) -> Vec<String> {
    let mut names: Vec<String> = self.factories.keys().cloned().collect();
    names.sort();
    names
  }

  /// Instantiates a task of the given type.
  pub fn create(&self, task_type: &str) -> Result<SharedTask, ControllerError> {
    let factory = self
      .factories
      .get(task_type)
      .ok_or_else(|| ControllerError::UnknownTaskType(task_type.to_string()))?;
    factory().map_err(|source| ControllerError::Construction {
      task_type: task_type.to_string(),
      source,
    })
  }
}

impl Default for TaskTypes {
  fn default() -> Self {
    Self::new()
  }
}

impl fmt::Debug for TaskTypes {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("TaskTypes")
      .field("types", &self.names())
      .finish()
  }
}

/// One `(id, name)` pair of the registry.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct TaskSummary {
  pub id: TaskId,
  pub name: String,
}

struct Registration {
  id: TaskId,
  service: Arc<ProducerService>,
}

/// Both maps live behind one lock so they never disagree.
#[derive(Default)]
struct Registry {
  by_name: HashMap<String, Registration>,
  by_id: HashMap<TaskId, String>,
}

impl Registry {
  fn remove_by_name(&mut self, name: &str) -> Option<(String, Registration)> {
    let (name, registration) = self.by_name.remove_entry(name)?;
    self.by_id.remove(&registration.id);
    Some((name, registration))
  }

  fn remove_by_id(&mut self, id: TaskId) -> Option<(String, Registration)> {
    let name = self.by_id.remove(&id)?;
    let registration = self.by_name.remove(&name)?;
    Some((name, registration))
  }
}

/// Builder for a [`TaskController`].
pub struct TaskControllerBuilder {
  queue: TaskQueue,
  sink: SharedSink,
  types: TaskTypes,
  ids: Option<Arc<SequenceGenerator>>,
  retry_budget: u32,
  offer_timeout: Duration,
  stop_timeout: Duration,
  metrics: Option<SchedulerMetrics>,
  listeners: Vec<Arc<dyn ServiceListener>>,
  auto_start: Option<TaskTable>,
}

impl TaskControllerBuilder {
  pub fn task_types(mut self, types: TaskTypes) -> Self {
    self.types = types;
    self
  }

  /// Sequence the controller draws task ids from.
  pub fn id_sequence(mut self, ids: Arc<SequenceGenerator>) -> Self {
    self.ids = Some(ids);
    self
  }

  /// Offer attempts per tick for every producer this controller starts.
  pub fn retry_budget(mut self, attempts: u32) -> Self {
    self.retry_budget = attempts;
    self
  }

  pub fn offer_timeout(mut self, timeout: Duration) -> Self {
    self.offer_timeout = timeout;
    self
  }

  /// Bounded wait for each producer to stop on `stop_task` and `shutdown`.
  pub fn stop_timeout(mut self, timeout: Duration) -> Self {
    self.stop_timeout = timeout;
    self
  }

  pub fn metrics(mut self, metrics: SchedulerMetrics) -> Self {
    self.metrics = Some(metrics);
    self
  }

  /// Listener attached to every producer the controller starts.
  pub fn listener(mut self, listener: Arc<dyn ServiceListener>) -> Self {
    self.listeners.push(listener);
    self
  }

  /// Starts every entry of `table` when the controller is built.
  pub fn auto_start(mut self, table: TaskTable) -> Self {
    self.auto_start = Some(table);
    self
  }

  /// Builds the controller. With an auto-start table this starts producers,
  /// so it must be called within a Tokio runtime.
  pub fn build(self) -> TaskController {
    let controller = TaskController {
      queue: self.queue,
      sink: self.sink,
      types: self.types,
      ids: self.ids.unwrap_or_default(),
      registry: Mutex::new(Registry::default()),
      retry_budget: self.retry_budget,
      offer_timeout: self.offer_timeout,
      stop_timeout: self.stop_timeout,
      metrics: self.metrics.unwrap_or_default(),
      listeners: self.listeners,
    };
    if let Some(table) = self.auto_start {
      controller.start_table(&table);
    }
    controller
  }
}

/// Owns the live producers, keyed by name and by generated id.
///
/// Registration instantiates the task through [`TaskTypes`], wraps it in an
/// [`InstrumentedTask`] bound to the controller's sink and starts a
/// [`ProducerService`] for it on the shared queue.
pub struct TaskController {
  queue: TaskQueue,
  sink: SharedSink,
  types: TaskTypes,
  ids: Arc<SequenceGenerator>,
  registry: Mutex<Registry>,
  retry_budget: u32,
  offer_timeout: Duration,
  stop_timeout: Duration,
  metrics: SchedulerMetrics,
  listeners: Vec<Arc<dyn ServiceListener>>,
}

impl TaskController {
  pub fn builder(queue: TaskQueue, sink: SharedSink) -> TaskControllerBuilder {
    TaskControllerBuilder {
      queue,
      sink,
      types: TaskTypes::new(),
      ids: None,
      retry_budget: DEFAULT_RETRY_BUDGET,
      offer_timeout: DEFAULT_OFFER_TIMEOUT,
      stop_timeout: DEFAULT_STOP_TIMEOUT,
      metrics: None,
      listeners: Vec::new(),
      auto_start: None,
    }
  }

  pub fn task_types(&self) -> &TaskTypes {
    &self.types
  }

  /// Registers and starts a producer, returning its id or
  /// [`INVALID_TASK_ID`] if anything went wrong. Failures are logged, never raised.
  pub fn start_task(
    &self,
    name: &str,
    task_type: &str,
    initial_delay: u64,
    interval: u64,
    unit: TimeUnit,
  ) -> TaskId {
    self
      .try_start_task(name, task_type, initial_delay, interval, unit)
      .unwrap_or_else(|e| {
        error!(task = name, task_type, error = %e, "Failed to start task.");
        INVALID_TASK_ID
      })
  }

  /// [`start_task`](Self::start_task) with the unit given as text, e.g. `"SECONDS"`.
  pub fn start_task_str(
    &self,
    name: &str,
    task_type: &str,
    initial_delay: u64,
    interval: u64,
    unit: &str,
  ) -> TaskId {
    match unit.parse::<TimeUnit>() {
      Ok(unit) => self.start_task(name, task_type, initial_delay, interval, unit),
      Err(_) => {
        let e = ControllerError::InvalidTimeUnit(unit.to_string());
        self.record_failure();
        error!(task = name, task_type, error = %e, "Failed to start task.");
        INVALID_TASK_ID
      }
    }
  }

  /// Registers and starts a producer.
  ///
  /// The id is drawn before the producer starts but only published once it
  /// is running, so a failed start leaves a gap in the sequence. Must be
  /// called within a Tokio runtime.
  ///
  /// # Errors
  ///
  /// - [`ControllerError::UnknownTaskType`] / [`ControllerError::Construction`]: the task could not be built.
  /// - [`ControllerError::DuplicateName`]: `name` is already registered; the existing entry is untouched.
  /// - [`ControllerError::UnusableId`]: the id sequence produced [`INVALID_TASK_ID`] or an id still in use.
  /// - [`ControllerError::Service`]: the producer failed to start (e.g. a zero interval).
  pub fn try_start_task(
    &self,
    name: &str,
    task_type: &str,
    initial_delay: u64,
    interval: u64,
    unit: TimeUnit,
  ) -> Result<TaskId, ControllerError> {
    let result = self.register(name, task_type, Schedule::new(initial_delay, interval, unit));
    if result.is_err() {
      self.record_failure();
    }
    result
  }

  fn record_failure(&self) {
    self
      .metrics
      .registrations_failed
      .fetch_add(1, AtomicOrdering::Relaxed);
  }

  fn register(
    &self,
    name: &str,
    task_type: &str,
    schedule: Schedule,
  ) -> Result<TaskId, ControllerError> {
    if self.queue.is_closed() {
      return Err(ServiceError::QueueClosed.into());
    }
    if self.registry.lock().by_name.contains_key(name) {
      return Err(ControllerError::DuplicateName(name.to_string()));
    }

    let task = self.types.create(task_type)?;
    task.set_name(name);
    let task = InstrumentedTask::shared(task, self.sink.clone());

    let mut builder = ProducerService::builder(name, schedule, task, self.queue.clone())
      .retry_budget(self.retry_budget)
      .offer_timeout(self.offer_timeout)
      .metrics(self.metrics.clone());
    for listener in &self.listeners {
      builder = builder.listener(listener.clone());
    }
    let service = Arc::new(builder.build());

    // Checking and inserting under one guard keeps concurrent registrations of
    // the same name from both succeeding. Starting only spawns the loop.
    let mut registry = self.registry.lock();
    if registry.by_name.contains_key(name) {
      return Err(ControllerError::DuplicateName(name.to_string()));
    }
    let id = self.ids.next();
    if id == INVALID_TASK_ID || registry.by_id.contains_key(&id) {
      return Err(ControllerError::UnusableId(id));
    }
    service.start()?;

    registry.by_id.insert(id, name.to_string());
    registry
      .by_name
      .insert(name.to_string(), Registration { id, service });
    drop(registry);

    self
      .metrics
      .tasks_registered
      .fetch_add(1, AtomicOrdering::Relaxed);
    info!(task = name, task_type, id, ?schedule, "Task registered.");
    Ok(id)
  }

  /// Starts every entry of a static task table. Bad entries are logged and
  /// skipped. Returns the ids of the tasks that started.
  pub fn start_table(&self, table: &TaskTable) -> Vec<TaskId> {
    let mut started = Vec::new();
    for entry in table.entries() {
      match entry {
        Ok(entry) => {
          let id = self.start_task(
            &entry.name,
            &entry.task_type,
            entry.initial_delay,
            entry.interval,
            entry.unit,
          );
          if id != INVALID_TASK_ID {
            started.push(id);
          }
        }
        Err(e) => {
          self.record_failure();
          warn!(error = %e, "Skipping task table entry.");
        }
      }
    }
    info!(started = started.len(), "Task table loaded.");
    started
  }

  /// Stops and unregisters the producer named `name`. Returns whether one was
  /// registered; a second call for the same name is a no-op.
  pub async fn stop_task(&self, name: &str) -> bool {
    let removed = self.registry.lock().remove_by_name(name);
    match removed {
      Some((name, registration)) => {
        self.stop_registration(name, registration).await;
        true
      }
      None => {
        debug!(task = name, "stop_task: no such task registered.");
        false
      }
    }
  }

  /// Id-keyed variant of [`stop_task`](Self::stop_task).
  pub async fn stop_task_by_id(&self, id: TaskId) -> bool {
    let removed = self.registry.lock().remove_by_id(id);
    match removed {
      Some((name, registration)) => {
        self.stop_registration(name, registration).await;
        true
      }
      None => {
        debug!(id, "stop_task_by_id: no such task registered.");
        false
      }
    }
  }

  async fn stop_registration(&self, name: String, registration: Registration) {
    let id = registration.id;
    match tokio::time::timeout(self.stop_timeout, registration.service.stop()).await {
      Ok(state) => info!(task = %name, id, ?state, "Task stopped."),
      Err(_) => warn!(
        task = %name,
        id,
        timeout = ?self.stop_timeout,
        "Task did not stop in time; it will not be ticked again."
      ),
    }
  }

  /// Pushes the named task straight onto the queue, bypassing its schedule.
  ///
  /// Returns `Ok(false)` if nothing is registered under `name`.
  ///
  /// # Errors
  ///
  /// [`QueueError::Full`] or [`QueueError::Closed`] if the queue refused it.
  pub fn queue_immediately(&self, name: &str) -> Result<bool, QueueError> {
    let task = self
      .registry
      .lock()
      .by_name
      .get(name)
      .map(|registration| registration.service.task().clone());
    let Some(task) = task else {
      debug!(task = name, "queue_immediately: no such task registered.");
      return Ok(false);
    };

    self.queue.try_add(task)?;
    self
      .metrics
      .tasks_queued_immediately
      .fetch_add(1, AtomicOrdering::Relaxed);
    debug!(task = name, "Task queued immediately.");
    Ok(true)
  }

  /// Snapshot of the current registrations, in no particular order.
  pub fn tasks(&self) -> Vec<TaskSummary> {
    self
      .registry
      .lock()
      .by_id
      .iter()
      .map(|(id, name)| TaskSummary {
        id: *id,
        name: name.clone(),
      })
      .collect()
  }

  pub fn task_id(&self, name: &str) -> Option<TaskId> {
    self.registry.lock().by_name.get(name).map(|r| r.id)
  }

  /// The producer registered under `name`, if any.
  pub fn service(&self, name: &str) -> Option<Arc<ProducerService>> {
    self
      .registry
      .lock()
      .by_name
      .get(name)
      .map(|r| r.service.clone())
  }

  pub fn len(&self) -> usize {
    self.registry.lock().by_name.len()
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }

  /// Stops every producer, each with a bounded wait, and clears the registry
  /// whether or not every stop finished in time.
  pub async fn shutdown(&self) {
    let drained: Vec<(String, Registration)> = {
      let mut registry = self.registry.lock();
      registry.by_id.clear();
      registry.by_name.drain().collect()
    };
    if drained.is_empty() {
      return;
    }

    info!(count = drained.len(), "Stopping all registered tasks.");
    join_all(
      drained
        .into_iter()
        .map(|(name, registration)| self.stop_registration(name, registration)),
    )
    .await;
  }
}

impl fmt::Debug for TaskController {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("TaskController")
      .field("registered", &self.len())
      .field("types", &self.types)
      .field("queue", &self.queue)
      .field("stop_timeout", &self.stop_timeout)
      .finish()
  }
}
