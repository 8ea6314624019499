use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// Unit in which a [`Schedule`]'s counts are expressed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "SCREAMING_SNAKE_CASE"))]
pub enum TimeUnit {
  Nanoseconds,
  Microseconds,
  Milliseconds,
  Seconds,
  Minutes,
  Hours,
  Days,
}

impl TimeUnit {
  pub const ALL: [TimeUnit; 7] = [
    TimeUnit::Nanoseconds,
    TimeUnit::Microseconds,
    TimeUnit::Milliseconds,
    TimeUnit::Seconds,
    TimeUnit::Minutes,
    TimeUnit::Hours,
    TimeUnit::Days,
  ];

  /// Converts `count` units into a `Duration`.
  /// Returns `None` if the result does not fit.
  pub fn to_duration(self, count: u64) -> Option<Duration> {
    let secs = |factor: u64| count.checked_mul(factor).map(Duration::from_secs);
    match self {
      TimeUnit::Nanoseconds => Some(Duration::from_nanos(count)),
      TimeUnit::Microseconds => Some(Duration::from_micros(count)),
      TimeUnit::Milliseconds => Some(Duration::from_millis(count)),
      TimeUnit::Seconds => Some(Duration::from_secs(count)),
      TimeUnit::Minutes => secs(60),
      TimeUnit::Hours => secs(60 * 60),
      TimeUnit::Days => secs(24 * 60 * 60),
    }
  }

  pub fn as_str(self) -> &'static str {
    match self {
      TimeUnit::Nanoseconds => "NANOSECONDS",
      TimeUnit::Microseconds => "MICROSECONDS",
      TimeUnit::Milliseconds => "MILLISECONDS",
      TimeUnit::Seconds => "SECONDS",
      TimeUnit::Minutes => "MINUTES",
      TimeUnit::Hours => "HOURS",
      TimeUnit::Days => "DAYS",
    }
  }
}

impl fmt::Display for TimeUnit {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

/// Returned when a string does not name a [`TimeUnit`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownTimeUnit(pub String);

impl fmt::Display for UnknownTimeUnit {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "unknown time unit '{}'", self.0)
  }
}

impl std::error::Error for UnknownTimeUnit {}

impl FromStr for TimeUnit {
  type Err = UnknownTimeUnit;

  /// Case-insensitive match on the unit names (`"seconds"`, `"SECONDS"`, ...).
  fn from_str(s: &str) -> Result<Self, Self::Err> {
    let wanted = s.trim();
    TimeUnit::ALL
      .into_iter()
      .find(|unit| unit.as_str().eq_ignore_ascii_case(wanted))
      .ok_or_else(|| UnknownTimeUnit(s.to_string()))
  }
}

/// Initial delay, repeat interval and time unit governing one producer.
///
/// Immutable once constructed; counts are unsigned so they can never be
/// negative. A schedule change means stopping the old producer and starting a
/// new one with a new `Schedule`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Schedule {
  initial_delay: u64,
  interval: u64,
  unit: TimeUnit,
}

impl Schedule {
  pub fn new(initial_delay: u64, interval: u64, unit: TimeUnit) -> Self {
    Self {
      initial_delay,
      interval,
      unit,
    }
  }

  pub fn initial_delay(&self) -> u64 {
    self.initial_delay
  }

  pub fn interval(&self) -> u64 {
    self.interval
  }

  pub fn unit(&self) -> TimeUnit {
    self.unit
  }

  /// Initial delay as a `Duration`, saturating on overflow.
  pub fn initial_delay_duration(&self) -> Duration {
    self
      .unit
      .to_duration(self.initial_delay)
      .unwrap_or(Duration::MAX)
  }

  /// Interval as a `Duration`, saturating on overflow.
  pub fn interval_duration(&self) -> Duration {
    self.unit.to_duration(self.interval).unwrap_or(Duration::MAX)
  }
}
