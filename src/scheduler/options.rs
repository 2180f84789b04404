use serde::Serialize;
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use std::time::Duration;

use crate::client::ResourceRequest;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
  High,
  #[default]
  Normal,
}

/// Per-call options for [`RequestScheduler::load`](super::RequestScheduler::load).
#[derive(Debug, Clone, PartialEq)]
pub struct LoadOptions {
  /// Returned in place of a null payload or an absorbed failure
  pub fallback: Value,
  /// `None` derives the timeout from the resource class table
  pub timeout: Option<Duration>,
  /// `None` uses the scheduler default
  pub retry_count: Option<u32>,
  pub use_cache: bool,
  pub priority: Priority,
}

impl Default for LoadOptions {
  fn default() -> Self {
    Self {
      fallback: Value::Null,
      timeout: None,
      retry_count: None,
      use_cache: true,
      priority: Priority::Normal,
    }
  }
}

impl LoadOptions {
  pub fn fallback(mut self, fallback: Value) -> Self {
    self.fallback = fallback;
    self
  }

  pub fn timeout(mut self, timeout: Duration) -> Self {
    self.timeout = Some(timeout);
    self
  }

  pub fn retries(mut self, retry_count: u32) -> Self {
    self.retry_count = Some(retry_count);
    self
  }

  pub fn no_cache(mut self) -> Self {
    self.use_cache = false;
    self
  }

  pub fn high_priority(mut self) -> Self {
    self.priority = Priority::High;
    self
  }

  /// Key under which identical in-flight calls are merged: the request plus
  /// every option, hashed.
  pub(crate) fn coalescing_key(&self, request: &ResourceRequest) -> String {
    let descriptor = json!({
      "path": request.path,
      "body": request.body,
      "fallback": self.fallback,
      "timeoutMs": self.timeout.map(|t| t.as_millis() as u64),
      "retryCount": self.retry_count,
      "useCache": self.use_cache,
      "priority": self.priority,
    });
    let mut hasher = Sha256::new();
    hasher.update(descriptor.to_string().as_bytes());
    hex::encode(hasher.finalize())
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_coalescing_key_covers_options() {
    let request = ResourceRequest::get("/api/summary");
    let base = LoadOptions::default();

    assert_eq!(
      base.coalescing_key(&request),
      LoadOptions::default().coalescing_key(&request)
    );
    assert_ne!(
      base.coalescing_key(&request),
      base.clone().retries(3).coalescing_key(&request)
    );
    assert_ne!(
      base.coalescing_key(&request),
      base.clone().fallback(json!([])).coalescing_key(&request)
    );
    assert_ne!(
      base.coalescing_key(&request),
      base.coalescing_key(&ResourceRequest::get("/api/other"))
    );
  }
}
