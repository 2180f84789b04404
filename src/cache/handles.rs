//! Registry for live, non-data objects (chart instances, render handles).
//!
//! These never enter the cache. They are indexed by the same key as the data
//! they render, but have no TTL, no durable mirror and no notifications.

use std::any::Any;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

type Handle = Arc<dyn Any + Send + Sync>;

#[derive(Default)]
pub struct HandleRegistry {
  handles: Mutex<HashMap<String, Handle>>,
}

impl HandleRegistry {
  pub fn new() -> Self {
    Self::default()
  }

  /// Store `handle` under `key`, returning whatever was there before.
  pub fn insert<T: Any + Send + Sync>(&self, key: &str, handle: T) -> Option<Handle> {
    let mut handles = self.handles.lock().unwrap_or_else(|e| e.into_inner());
    handles.insert(key.to_string(), Arc::new(handle))
  }

  /// Fetch the handle under `key` if it is a `T`.
  pub fn get<T: Any + Send + Sync>(&self, key: &str) -> Option<Arc<T>> {
    let handles = self.handles.lock().unwrap_or_else(|e| e.into_inner());
    handles
      .get(key)
      .cloned()
      .and_then(|h| h.downcast::<T>().ok())
  }

  pub fn remove(&self, key: &str) -> Option<Handle> {
    let mut handles = self.handles.lock().unwrap_or_else(|e| e.into_inner());
    handles.remove(key)
  }

  pub fn clear(&self) {
    let mut handles = self.handles.lock().unwrap_or_else(|e| e.into_inner());
    handles.clear();
  }

  pub fn len(&self) -> usize {
    let handles = self.handles.lock().unwrap_or_else(|e| e.into_inner());
    handles.len()
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }
}

impl std::fmt::Debug for HandleRegistry {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("HandleRegistry")
      .field("len", &self.len())
      .finish()
  }
}
