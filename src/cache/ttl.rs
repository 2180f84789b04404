//! Pattern-based TTL resolution.

use std::time::Duration;

/// Resolves a TTL for a cache key from a table of key patterns.
///
/// A pattern is either an exact key or contains `*` wildcards matching any
/// run of characters. An exact match always wins; otherwise the longest
/// matching wildcard pattern is used; otherwise the default TTL.
#[derive(Debug, Clone)]
pub struct TtlTable {
  exact: Vec<(String, Duration)>,
  wildcard: Vec<(String, Duration)>,
  default_ttl: Duration,
}

impl TtlTable {
  pub fn new(default_ttl: Duration) -> Self {
    Self {
      exact: Vec::new(),
      wildcard: Vec::new(),
      default_ttl,
    }
  }

  pub fn with_pattern(mut self, pattern: impl Into<String>, ttl: Duration) -> Self {
    self.insert(pattern, ttl);
    self
  }

  pub fn insert(&mut self, pattern: impl Into<String>, ttl: Duration) {
    let pattern = pattern.into();
    let bucket = if pattern.contains('*') {
      &mut self.wildcard
    } else {
      &mut self.exact
    };
    bucket.retain(|(p, _)| *p != pattern);
    bucket.push((pattern, ttl));
  }

  pub fn default_ttl(&self) -> Duration {
    self.default_ttl
  }

  pub fn resolve(&self, key: &str) -> Duration {
    if let Some((_, ttl)) = self.exact.iter().find(|(p, _)| p == key) {
      return *ttl;
    }

    self
      .wildcard
      .iter()
      .filter(|(p, _)| glob_match(p, key))
      .max_by_key(|(p, _)| p.len())
      .map(|(_, ttl)| *ttl)
      .unwrap_or(self.default_ttl)
  }
}

/// Match `text` against `pattern`, where `*` matches any (possibly empty) run.
fn glob_match(pattern: &str, text: &str) -> bool {
  let mut parts = pattern.split('*');
  let Some(first) = parts.next() else {
    return text.is_empty();
  };
  let Some(mut rest) = text.strip_prefix(first) else {
    return false;
  };

  let parts: Vec<&str> = parts.collect();
  let Some((last, middle)) = parts.split_last() else {
    // No '*' at all
    return rest.is_empty();
  };

  for part in middle {
    match rest.find(part) {
      Some(idx) => rest = &rest[idx + part.len()..],
      None => return false,
    }
  }
  rest.ends_with(last)
}
