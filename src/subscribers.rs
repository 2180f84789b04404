//! Callback registry shared by the cache and the filter state.
//!
//! Each callback is invoked in isolation: a panicking subscriber is logged and
//! skipped, and delivery continues with the next one.

use std::collections::BTreeMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

/// Identifier handed out on registration.
pub type SubscriberId = u64;

/// A registry of callbacks taking `&E`, grouped by topic.
pub struct Subscribers<E: ?Sized> {
  next_id: AtomicU64,
  topics: Mutex<BTreeMap<String, Vec<(SubscriberId, Arc<dyn Fn(&E) + Send + Sync>)>>>,
}

impl<E: ?Sized> Default for Subscribers<E> {
  fn default() -> Self {
    Self {
      next_id: AtomicU64::new(1),
      topics: Mutex::new(BTreeMap::new()),
    }
  }
}

impl<E: ?Sized + 'static> Subscribers<E> {
  pub fn new() -> Self {
    Self::default()
  }

  /// Register a callback under `topic`.
  pub fn add<F>(&self, topic: &str, callback: F) -> SubscriberId
  where
    F: Fn(&E) + Send + Sync + 'static,
  {
    let id = self.next_id.fetch_add(1, Ordering::Relaxed);
    let mut topics = self.topics.lock().unwrap_or_else(|e| e.into_inner());
    topics
      .entry(topic.to_string())
      .or_default()
      .push((id, Arc::new(callback)));
    id
  }

  /// Remove a callback. Returns false if it was already gone.
  pub fn remove(&self, topic: &str, id: SubscriberId) -> bool {
    let mut topics = self.topics.lock().unwrap_or_else(|e| e.into_inner());
    let Some(list) = topics.get_mut(topic) else {
      return false;
    };
    let before = list.len();
    list.retain(|(sid, _)| *sid != id);
    let removed = list.len() != before;
    if list.is_empty() {
      topics.remove(topic);
    }
    removed
  }

  pub fn len(&self, topic: &str) -> usize {
    let topics = self.topics.lock().unwrap_or_else(|e| e.into_inner());
    topics.get(topic).map(Vec::len).unwrap_or(0)
  }

  /// Invoke every callback registered under each of `topics`, in topic order
  /// then registration order. Returns how many callbacks panicked.
  ///
  /// The registry lock is released before any callback runs, so callbacks may
  /// subscribe, unsubscribe or trigger further notifications.
  pub fn notify(&self, topics: &[&str], event: &E) -> usize {
    let snapshot: Vec<_> = {
      let registry = self.topics.lock().unwrap_or_else(|e| e.into_inner());
      topics
        .iter()
        .filter_map(|t| registry.get(*t))
        .flat_map(|list| list.iter().map(|(id, cb)| (*id, Arc::clone(cb))))
        .collect()
    };

    let mut failures = 0;
    for (id, callback) in snapshot {
      if catch_unwind(AssertUnwindSafe(|| callback(event))).is_err() {
        failures += 1;
        tracing::warn!(subscriber = id, "subscriber panicked during notification");
      }
    }
    failures
  }
}

/// Handle returned by `subscribe`/`on_change`; call [`Subscription::unsubscribe`]
/// to stop receiving callbacks.
pub struct Subscription<E: ?Sized + 'static> {
  registry: Weak<Subscribers<E>>,
  topic: String,
  id: SubscriberId,
}

impl<E: ?Sized + 'static> Subscription<E> {
  pub(crate) fn new(registry: &Arc<Subscribers<E>>, topic: &str, id: SubscriberId) -> Self {
    Self {
      registry: Arc::downgrade(registry),
      topic: topic.to_string(),
      id,
    }
  }

  pub fn unsubscribe(self) {
    if let Some(registry) = self.registry.upgrade() {
      registry.remove(&self.topic, self.id);
    }
  }
}

impl<E: ?Sized + 'static> std::fmt::Debug for Subscription<E> {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("Subscription")
      .field("topic", &self.topic)
      .field("id", &self.id)
      .finish()
  }
}
