//! Static task table read once at startup.
//!
//! The table is a `key=value` text file:
//!
//! ```text
//! tasks = heartbeat, cleanup
//! heartbeat.runnable = logging
//! heartbeat.execution.initialDelay = 0
//! heartbeat.execution.interval = 5
//! heartbeat.execution.timeunit = SECONDS
//! ```
//!
//! `initialDelay` defaults to `0`; the other per-task keys are required.

use std::collections::HashMap;
use std::io;
use std::path::Path;

use tracing::debug;

use crate::error::ConfigError;
use crate::schedule::{Schedule, TimeUnit};

const TASKS_KEY: &str = "tasks";
const RUNNABLE_KEY: &str = "runnable";
const INITIAL_DELAY_KEY: &str = "execution.initialDelay";
const INTERVAL_KEY: &str = "execution.interval";
const TIME_UNIT_KEY: &str = "execution.timeunit";

/// One fully-resolved row of the task table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskEntry {
  pub name: String,
  /// Identifier looked up in the controller's [`TaskTypes`](crate::controller::TaskTypes).
  pub task_type: String,
  pub initial_delay: u64,
  pub interval: u64,
  pub unit: TimeUnit,
}

impl TaskEntry {
  pub fn schedule(&self) -> Schedule {
    Schedule::new(self.initial_delay, self.interval, self.unit)
  }
}

/// Parsed `key=value` properties describing tasks to start automatically.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TaskTable {
  properties: HashMap<String, String>,
}

impl TaskTable {
  /// Parses the table text. Blank lines and lines starting with `#` or `!`
  /// are ignored; keys and values are split on the first `=` or `:`.
  pub fn parse(text: &str) -> Self {
    let mut properties = HashMap::new();
    for line in text.lines() {
      let line = line.trim();
      if line.is_empty() || line.starts_with('#') || line.starts_with('!') {
        continue;
      }
      let (key, value) = match line.find(|c: char| c == '=' || c == ':') {
        Some(at) => (&line[..at], &line[at + 1..]),
        None => (line, ""),
      };
      properties.insert(key.trim().to_string(), value.trim().to_string());
    }
    Self { properties }
  }

  /// Reads the table from `path`. A missing file is an empty table.
  pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
    let path = path.as_ref();
    match std::fs::read_to_string(path) {
      Ok(text) => Ok(Self::parse(&text)),
      Err(e) if e.kind() == io::ErrorKind::NotFound => {
        debug!(path = %path.display(), "No task table found; nothing to auto-start.");
        Ok(Self::default())
      }
      Err(e) => Err(ConfigError::Io(e)),
    }
  }

  pub fn get(&self, key: &str) -> Option<&str> {
    self.properties.get(key).map(String::as_str)
  }

  /// Names listed under the top-level `tasks` key, in listed order.
  pub fn task_names(&self) -> Vec<String> {
    self
      .get(TASKS_KEY)
      .map(|names| {
        names
          .split(',')
          .map(str::trim)
          .filter(|name| !name.is_empty())
          .map(str::to_string)
          .collect()
      })
      .unwrap_or_default()
  }

  pub fn is_empty(&self) -> bool {
    self.task_names().is_empty()
  }

  /// One result per listed task, so a bad entry never hides the others.
  pub fn entries(&self) -> Vec<Result<TaskEntry, ConfigError>> {
    self
      .task_names()
      .into_iter()
      .map(|name| self.entry(&name))
      .collect()
  }

  /// Resolves the entry for a single task name.
  pub fn entry(&self, name: &str) -> Result<TaskEntry, ConfigError> {
    let task_type = self.required(name, RUNNABLE_KEY)?.to_string();
    let initial_delay = match self.value(name, INITIAL_DELAY_KEY) {
      Some(raw) => parse_count(name, INITIAL_DELAY_KEY, raw)?,
      None => 0,
    };
    let interval = parse_count(name, INTERVAL_KEY, self.required(name, INTERVAL_KEY)?)?;
    let raw_unit = self.required(name, TIME_UNIT_KEY)?;
    let unit = raw_unit
      .parse::<TimeUnit>()
      .map_err(|_| ConfigError::InvalidTimeUnit {
        task: name.to_string(),
        value: raw_unit.to_string(),
      })?;

    Ok(TaskEntry {
      name: name.to_string(),
      task_type,
      initial_delay,
      interval,
      unit,
    })
  }

  fn value(&self, name: &str, key: &str) -> Option<&str> {
    self.get(&format!("{name}.{key}"))
  }

  fn required(&self, name: &str, key: &str) -> Result<&str, ConfigError> {
    self.value(name, key).ok_or_else(|| ConfigError::MissingKey {
      task: name.to_string(),
      key: format!("{name}.{key}"),
    })
  }
}

fn parse_count(task: &str, key: &str, raw: &str) -> Result<u64, ConfigError> {
  raw.parse::<u64>().map_err(|_| ConfigError::InvalidNumber {
    task: task.to_string(),
    key: format!("{task}.{key}"),
    value: raw.to_string(),
  })
}
