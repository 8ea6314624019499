//! QueueKeeper: an in-process scheduler for recurring tasks.
//!
//! Named tasks run repeatedly on fixed-rate schedules. Every registered task
//! gets its own producer, which offers the task onto one bounded queue shared
//! by all producers. A single execution service drains that queue into a
//! bounded worker pool. Each run is driven through a lifecycle state machine
//! whose transitions are reported to a pluggable sink.
//!
//! # Features
//!
//! - Fixed-rate schedules (`initial delay`, `interval`, [`TimeUnit`]), with
//!   catch-up rather than merging when a tick overruns.
//! - Backpressure absorbed at the producer: a full queue is retried a few
//!   times, then that occurrence is skipped (and counted in the metrics).
//! - Per-run lifecycle `STARTING -> STARTED -> STOPPING -> {COMPLETED | FAILED |
//!   ABANDONED} -> STOPPED`, reported to a [`StateTransition`] sink with a
//!   per-run execution id.
//! - Advisory cancellation through the task-local [`TaskContext`]; a body that
//!   observes it is classified `ABANDONED` rather than `FAILED`.
//! - A controller registry with start / stop / list / queue-now operations, a
//!   string-keyed [`TaskTypes`] factory registry and an optional static
//!   [`TaskTable`] of tasks to start at boot.
//! - Built-in metrics ([`MetricsSnapshot`]) and `tracing` instrumentation.
//! - Optional Serde support for public value types (`serde` feature).
//!
//! # Usage
//!
//! ```no_run
//! use queuekeeper::{task_fn, FnTask, QueueKeeper, SharedTask, TaskTypes, TimeUnit};
//! use std::sync::atomic::{AtomicUsize, Ordering};
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let runs = Arc::new(AtomicUsize::new(0));
//!     let counter = runs.clone();
//!     let types = TaskTypes::new().with("counter", move || {
//!         let counter = counter.clone();
//!         let task = FnTask::new("counter", task_fn! {
//!             { let counter = counter.clone(); }
//!             {
//!                 counter.fetch_add(1, Ordering::SeqCst);
//!                 Ok(())
//!             }
//!         });
//!         Ok(Arc::new(task) as SharedTask)
//!     });
//!
//!     let keeper = QueueKeeper::builder()
//!         .concurrency(2)
//!         .task_types(types)
//!         .build()?;
//!
//!     let id = keeper.start_task("tick", "counter", 0, 100, TimeUnit::Milliseconds);
//!     println!("registered {:?}", keeper.tasks());
//!
//!     tokio::time::sleep(Duration::from_secs(1)).await;
//!     keeper.queue_immediately("tick")?;
//!     keeper.stop_task_by_id(id).await;
//!
//!     println!("runs: {}", runs.load(Ordering::SeqCst));
//!     println!("{:#?}", keeper.metrics());
//!     keeper.shutdown(Some(Duration::from_secs(5))).await?;
//!     Ok(())
//! }
//! ```
//!
//! # Configuration
//!
//! Use the [`QueueKeeperBuilder`] to configure:
//! - `queue_capacity`: slots in the shared queue (default 1024).
//! - `concurrency`: worker pool size (default: available parallelism).
//! - `retry_budget` / `offer_timeout`: producer backpressure handling (3 attempts of 500ms).
//! - `poll_timeout` / `reclaim_period`: execution service pacing (500ms / 10s).
//! - `stop_timeout`: bounded wait per producer on stop and shutdown (500ms).
//! - `sink`, `task_types`, `task_table`, `listener`.
//!
//! # Accessing the task context
//!
//! Inside a body run by the worker pool, [`try_get_current_task_context`] (or
//! the panicking [`task_context!`] macro) returns the run's [`TaskContext`]:
//!
//! ```no_run
//! use queuekeeper::{task_fn, try_get_current_task_context, FnTask, TaskError};
//!
//! let patient = FnTask::new("patient", task_fn! {{
//!     if let Some(ctx) = try_get_current_task_context() {
//!         tokio::select! {
//!             _ = ctx.cancelled() => return Err(TaskError::Cancelled),
//!             _ = tokio::time::sleep(std::time::Duration::from_secs(30)) => {}
//!         }
//!     }
//!     Ok(())
//! }});
//! # let _ = patient;
//! ```

pub mod config;
pub mod controller;
pub mod error;
pub mod execution;
pub mod instrument;
mod macros;
pub mod metrics;
pub mod producer;
pub mod queue;
pub mod schedule;
pub mod scheduler;
pub mod sequence;
pub mod service;
pub mod sink;
pub mod task;
mod worker;

// --- Public Re-exports ---

// Facade
pub use scheduler::{QueueKeeper, QueueKeeperBuilder};

// Services
pub use controller::{TaskController, TaskSummary, TaskTypes};
pub use execution::ExecutionService;
pub use producer::ProducerService;
pub use service::{LoggingServiceListener, ServiceListener, ServiceState};

// Error types
pub use error::{
  BuildError, ConfigError, ControllerError, QueueError, ServiceError, ShutdownError, SinkError,
};

// Task model
pub use config::{TaskEntry, TaskTable};
pub use instrument::{InstrumentedQueue, InstrumentedTask, TaskRun};
pub use queue::TaskQueue;
pub use schedule::{Schedule, TimeUnit};
pub use sequence::SequenceGenerator;
pub use sink::{
  CompositeSink, LoggingSink, MemorySink, NoopSink, SharedSink, StateTransition, TransitionRecord,
};
pub use task::context::{try_get_current_task_context, TaskContext};
pub use task::{
  ExecutionId, FnTask, LoggingTask, SharedTask, Task, TaskError, TaskId, TaskMeta, TaskState,
  INVALID_TASK_ID,
};

// Metrics related types
pub use metrics::{MetricsSnapshot, SchedulerMetrics};
