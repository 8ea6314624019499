//! Generic service lifecycle: `New -> Starting -> Running -> Stopping ->
//! Terminated`, with `Failed` reachable from any non-terminal state.
//!
//! Both the producer and the execution service embed a [`Lifecycle`] and
//! notify their registered [`ServiceListener`]s on every transition.

use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::error::ServiceError;

/// Lifecycle state of a service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum ServiceState {
  New,
  Starting,
  Running,
  Stopping,
  Terminated,
  Failed,
}

impl ServiceState {
  pub fn is_terminal(self) -> bool {
    matches!(self, ServiceState::Terminated | ServiceState::Failed)
  }
}

/// Observer notified on each service transition. All methods default to no-ops.
pub trait ServiceListener: Send + Sync + 'static {
  fn starting(&self, _service: &str) {}
  fn running(&self, _service: &str) {}
  fn stopping(&self, _service: &str, _from: ServiceState) {}
  fn terminated(&self, _service: &str, _from: ServiceState) {}
  fn failed(&self, _service: &str, _from: ServiceState, _error: &ServiceError) {}
}

/// Logs every service transition.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingServiceListener;

impl ServiceListener for LoggingServiceListener {
  fn starting(&self, service: &str) {
    info!(service, "Service -> starting.");
  }

  fn running(&self, service: &str) {
    info!(service, "Service -> running.");
  }

  fn stopping(&self, service: &str, from: ServiceState) {
    warn!(service, ?from, "Service -> stopping.");
  }

  fn terminated(&self, service: &str, from: ServiceState) {
    warn!(service, ?from, "Service -> terminated.");
  }

  fn failed(&self, service: &str, from: ServiceState, error: &ServiceError) {
    error!(service, ?from, %error, "Service failed!");
  }
}

/// State machine shared by a service and the tasks it spawns.
pub(crate) struct Lifecycle {
  name: String,
  state: watch::Sender<ServiceState>,
  failure: Mutex<Option<ServiceError>>,
  listeners: Mutex<Vec<Arc<dyn ServiceListener>>>,
}

impl Lifecycle {
  pub fn new(name: &str) -> Self {
    let (state, _) = watch::channel(ServiceState::New);
    Self {
      name: name.to_string(),
      state,
      failure: Mutex::new(None),
      listeners: Mutex::new(Vec::new()),
    }
  }

  pub fn name(&self) -> &str {
    &self.name
  }

  pub fn state(&self) -> ServiceState {
    *self.state.borrow()
  }

  pub fn failure(&self) -> Option<ServiceError> {
    self.failure.lock().clone()
  }

  pub fn add_listener(&self, listener: Arc<dyn ServiceListener>) {
    self.listeners.lock().push(listener);
  }

  fn notify(&self, f: impl Fn(&dyn ServiceListener)) {
    let listeners = self.listeners.lock().clone();
    for listener in &listeners {
      f(listener.as_ref());
    }
  }

  /// Atomically moves to `to` if `allowed(current)`. Returns the previous
  /// state on success, the current state otherwise.
  fn transition(
    &self,
    allowed: impl Fn(ServiceState) -> bool,
    to: ServiceState,
  ) -> Result<ServiceState, ServiceState> {
    let mut outcome = Err(ServiceState::New);
    self.state.send_if_modified(|current| {
      if allowed(*current) {
        outcome = Ok(*current);
        *current = to;
        true
      } else {
        outcome = Err(*current);
        false
      }
    });
    outcome
  }

  /// `New -> Starting`. Any other state means the service was already used.
  pub fn begin_start(&self) -> Result<(), ServiceError> {
    self
      .transition(|s| s == ServiceState::New, ServiceState::Starting)
      .map_err(ServiceError::AlreadyStarted)?;
    self.notify(|l| l.starting(&self.name));
    Ok(())
  }

  /// `Starting -> Running`. False if the service left `Starting` meanwhile.
  pub fn mark_running(&self) -> bool {
    let moved = self
      .transition(|s| s == ServiceState::Starting, ServiceState::Running)
      .is_ok();
    if moved {
      self.notify(|l| l.running(&self.name));
    }
    moved
  }

  /// Requests a stop. Returns `true` when the caller must finish the stop
  /// (and call [`mark_terminated`](Self::mark_terminated)); a never-started
  /// service goes straight to `Terminated`.
  pub fn begin_stop(&self) -> bool {
    match self.transition(
      |s| matches!(s, ServiceState::Starting | ServiceState::Running),
      ServiceState::Stopping,
    ) {
      Ok(from) => {
        self.notify(|l| l.stopping(&self.name, from));
        true
      }
      Err(ServiceState::New) => {
        if self
          .transition(|s| s == ServiceState::New, ServiceState::Terminated)
          .is_ok()
        {
          self.notify(|l| l.terminated(&self.name, ServiceState::New));
        }
        false
      }
      Err(_) => false,
    }
  }

  /// `Stopping -> Terminated`.
  pub fn mark_terminated(&self) {
    if let Ok(from) = self.transition(|s| s == ServiceState::Stopping, ServiceState::Terminated) {
      self.notify(|l| l.terminated(&self.name, from));
    }
  }

  /// Moves any non-terminal state to `Failed`, recording the error.
  pub fn fail(&self, error: ServiceError) {
    if let Ok(from) = self.transition(|s| !s.is_terminal(), ServiceState::Failed) {
      *self.failure.lock() = Some(error.clone());
      self.notify(|l| l.failed(&self.name, from, &error));
    }
  }

  /// Resolves once the service is `Terminated` or `Failed`.
  pub async fn await_terminal(&self) -> ServiceState {
    let mut rx = self.state.subscribe();
    let result = rx.wait_for(|s| s.is_terminal()).await.map(|s| *s);
    result.unwrap_or_else(|_| self.state())
  }
}

impl fmt::Debug for Lifecycle {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("Lifecycle")
      .field("name", &self.name)
      .field("state", &self.state())
      .field("listeners", &self.listeners.lock().len())
      .finish()
  }
}
