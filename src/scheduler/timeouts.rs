use std::time::Duration;

use crate::config::SchedulerConfig;

/// Adaptive timeouts keyed by substring match against the resource path.
#[derive(Debug, Clone)]
pub struct TimeoutTable {
  classes: Vec<(String, Duration)>,
  default: Duration,
}

impl TimeoutTable {
  pub fn new(default: Duration) -> Self {
    Self {
      classes: Vec::new(),
      default,
    }
  }

  pub fn from_config(config: &SchedulerConfig) -> Self {
    let mut table = Self::new(Duration::from_millis(config.default_timeout_ms));
    for class in &config.timeout_classes {
      table = table.with_class(class.contains.clone(), Duration::from_millis(class.timeout_ms));
    }
    table
  }

  /// Classes are checked in insertion order.
  pub fn with_class(mut self, contains: impl Into<String>, timeout: Duration) -> Self {
    self.classes.push((contains.into(), timeout));
    self
  }

  pub fn resolve(&self, resource: &str) -> Duration {
    self
      .classes
      .iter()
      .find(|(needle, _)| resource.contains(needle.as_str()))
      .map(|(_, timeout)| *timeout)
      .unwrap_or(self.default)
  }
}
