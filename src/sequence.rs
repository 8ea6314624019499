use std::sync::atomic::{AtomicI32, Ordering};

/// Thread-safe monotonic integer sequence.
///
/// Used for task execution ids and controller-assigned task ids. The first
/// value returned by [`next`](Self::next) is `start + increment`.
#[derive(Debug)]
pub struct SequenceGenerator {
  start: i32,
  increment: i32,
  value: AtomicI32,
}

impl Default for SequenceGenerator {
  fn default() -> Self {
    Self::new(0, 1)
  }
}

impl SequenceGenerator {
  pub fn new(start: i32, increment: i32) -> Self {
    Self {
      start,
      increment,
      value: AtomicI32::new(start),
    }
  }

  /// Starts at `start` with an increment of 1.
  pub fn starting_at(start: i32) -> Self {
    Self::new(start, 1)
  }

  /// Atomically advances the sequence and returns the new value.
  pub fn next(&self) -> i32 {
    self
      .value
      .fetch_add(self.increment, Ordering::SeqCst)
      .wrapping_add(self.increment)
  }

  /// The value the next call to [`next`](Self::next) would return.
  /// Racy by nature under concurrent callers.
  pub fn peek_next(&self) -> i32 {
    self.value.load(Ordering::SeqCst).wrapping_add(self.increment)
  }

  pub fn start_value(&self) -> i32 {
    self.start
  }

  pub fn increment(&self) -> i32 {
    self.increment
  }
}
