use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, Mutex};
use tokio::time::timeout;

use crate::error::QueueError;
use crate::task::SharedTask;

/// Default capacity of the shared task queue.
pub const DEFAULT_QUEUE_CAPACITY: usize = 1024;

struct QueueInner {
  tx: mpsc::Sender<SharedTask>,
  rx: Mutex<mpsc::Receiver<SharedTask>>,
  capacity: usize,
}

/// Bounded blocking queue shared by every producer and the execution service.
///
/// Cloning the handle shares the same underlying queue. Under contention the
/// first successful offer wins; there is no fairness across producers.
#[derive(Clone)]
pub struct TaskQueue {
  inner: Arc<QueueInner>,
}

impl TaskQueue {
  /// Creates a queue holding at most `capacity` tasks (minimum 1).
  pub fn bounded(capacity: usize) -> Self {
    let capacity = capacity.max(1);
    let (tx, rx) = mpsc::channel(capacity);
    Self {
      inner: Arc::new(QueueInner {
        tx,
        rx: Mutex::new(rx),
        capacity,
      }),
    }
  }

  /// Offers a task, waiting at most `wait` for free capacity.
  pub async fn offer(&self, task: SharedTask, wait: Duration) -> Result<(), QueueError> {
    self
      .inner
      .tx
      .send_timeout(task, wait)
      .await
      .map_err(|e| match e {
        mpsc::error::SendTimeoutError::Timeout(_) => QueueError::Full,
        mpsc::error::SendTimeoutError::Closed(_) => QueueError::Closed,
      })
  }

  /// Inserts a task without waiting.
  pub fn try_add(&self, task: SharedTask) -> Result<(), QueueError> {
    self.inner.tx.try_send(task).map_err(|e| match e {
      mpsc::error::TrySendError::Full(_) => QueueError::Full,
      mpsc::error::TrySendError::Closed(_) => QueueError::Closed,
    })
  }

  /// Takes the next task, waiting at most `wait`. `None` on timeout or when
  /// the queue is closed and drained.
  pub async fn poll(&self, wait: Duration) -> Option<SharedTask> {
    let recv = async {
      let mut rx = self.inner.rx.lock().await;
      rx.recv().await
    };
    timeout(wait, recv).await.ok().flatten()
  }

  /// Stops accepting new tasks. Tasks already queued can still be polled.
  pub async fn close(&self) {
    self.inner.rx.lock().await.close();
  }

  pub fn is_closed(&self) -> bool {
    self.inner.tx.is_closed()
  }

  /// Number of tasks currently waiting.
  pub fn len(&self) -> usize {
    self.inner.capacity.saturating_sub(self.inner.tx.capacity())
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }

  pub fn capacity(&self) -> usize {
    self.inner.capacity
  }
}

impl Default for TaskQueue {
  fn default() -> Self {
    Self::bounded(DEFAULT_QUEUE_CAPACITY)
  }
}

impl fmt::Debug for TaskQueue {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("TaskQueue")
      .field("len", &self.len())
      .field("capacity", &self.inner.capacity)
      .finish()
  }
}
