//! Shared cross-filter state with debounced change broadcast.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::runtime::Handle;
use tracing::{debug, warn};

use super::dimension::{FilterDimensionMap, Scalar, ToggleOutcome};
use crate::config::CrossfilterConfig;
use crate::event::{EventStream, FilterEvent, FilterEventKind};
use crate::subscribers::{Subscribers, Subscription};

const CHANGE_TOPIC: &str = "change";
const EVENT_CAPACITY: usize = 64;

/// Options for [`CrossfilterState::toggle`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ToggleOptions {
  /// Add to / remove from a list instead of replacing the value
  pub multi_select: bool,
  /// Deactivate every other dimension first
  pub clear_previous: bool,
}

impl ToggleOptions {
  pub fn single() -> Self {
    Self::default()
  }

  pub fn multi() -> Self {
    Self {
      multi_select: true,
      ..Self::default()
    }
  }

  pub fn clearing_others(mut self) -> Self {
    self.clear_previous = true;
    self
  }
}

struct Inner {
  map: Mutex<FilterDimensionMap>,
  debounce: Duration,
  /// Bumped on every mutation; a scheduled flush only fires if it is still current
  generation: AtomicU64,
  /// Event kind the next debounced flush will report
  debounced_kind: Mutex<Option<FilterEventKind>>,
  /// Event kind waiting to be broadcast by the active broadcaster
  next_kind: Mutex<Option<FilterEventKind>>,
  broadcasting: AtomicBool,
  broadcasts: AtomicU64,
  listeners: Arc<Subscribers<FilterDimensionMap>>,
  events: broadcast::Sender<FilterEvent>,
}

/// The active filter dimensions for one page session.
///
/// Mutations are applied immediately; listeners are told once per debounce
/// window, with the state as it stands at the end of the window.
#[derive(Clone)]
pub struct CrossfilterState {
  inner: Arc<Inner>,
}

impl CrossfilterState {
  pub fn new<I, S>(debounce: Duration, dimensions: I) -> Self
  where
    I: IntoIterator<Item = S>,
    S: Into<String>,
  {
    let (events, _) = broadcast::channel(EVENT_CAPACITY);
    Self {
      inner: Arc::new(Inner {
        map: Mutex::new(FilterDimensionMap::with_dimensions(dimensions)),
        debounce,
        generation: AtomicU64::new(0),
        debounced_kind: Mutex::new(None),
        next_kind: Mutex::new(None),
        broadcasting: AtomicBool::new(false),
        broadcasts: AtomicU64::new(0),
        listeners: Arc::new(Subscribers::new()),
        events,
      }),
    }
  }

  pub fn from_config(config: &CrossfilterConfig) -> Self {
    Self::new(
      Duration::from_millis(config.debounce_ms),
      config.dimensions.iter().cloned(),
    )
  }

  fn map(&self) -> MutexGuard<'_, FilterDimensionMap> {
    self.inner.map.lock().unwrap_or_else(|e| e.into_inner())
  }

  fn lock_kind<'a>(
    slot: &'a Mutex<Option<FilterEventKind>>,
  ) -> MutexGuard<'a, Option<FilterEventKind>> {
    slot.lock().unwrap_or_else(|e| e.into_inner())
  }

  pub fn snapshot(&self) -> FilterDimensionMap {
    self.map().clone()
  }

  pub fn is_active(&self, dimension: &str, value: &Scalar) -> bool {
    self.map().is_active(dimension, value)
  }

  /// Toggle `value` in `dimension` and schedule a debounced broadcast.
  ///
  /// Outside a tokio runtime there is no timer, so the broadcast happens
  /// immediately instead.
  pub fn toggle(
    &self,
    dimension: &str,
    value: impl Into<Scalar>,
    options: ToggleOptions,
  ) -> ToggleOutcome {
    let value = value.into();
    let outcome = {
      let mut map = self.map();
      if options.clear_previous {
        map.clear_except(dimension);
      }
      map.toggle(dimension, value, options.multi_select)
    };

    let kind = match outcome {
      ToggleOutcome::Applied => FilterEventKind::FilterApplied,
      ToggleOutcome::Removed => FilterEventKind::FilterRemoved,
    };
    self.schedule_broadcast(kind);
    outcome
  }

  /// Deactivate one dimension; debounced like a toggle.
  pub fn clear_dimension(&self, dimension: &str) -> bool {
    let cleared = self.map().clear(dimension);
    if cleared {
      self.schedule_broadcast(FilterEventKind::FilterRemoved);
    }
    cleared
  }

  /// Reset every dimension and broadcast immediately, dropping any pending
  /// debounced broadcast.
  pub fn clear_all(&self) {
    self.map().clear_all();
    self.inner.generation.fetch_add(1, Ordering::AcqRel);
    Self::lock_kind(&self.inner.debounced_kind).take();
    self.broadcast(FilterEventKind::FilterCleared);
  }

  /// Reset every dimension without telling anyone. Used at navigation
  /// boundaries, where the next page starts from a clean slate.
  pub fn reset(&self) {
    self.map().clear_all();
    self.inner.generation.fetch_add(1, Ordering::AcqRel);
    Self::lock_kind(&self.inner.debounced_kind).take();
  }

  pub fn register_dimension(&self, dimension: impl Into<String>) {
    self.map().register(dimension);
  }

  /// Register `callback` to receive the filter map after each broadcast.
  pub fn on_change<F>(&self, callback: F) -> Subscription<FilterDimensionMap>
  where
    F: Fn(&FilterDimensionMap) + Send + Sync + 'static,
  {
    let id = self.inner.listeners.add(CHANGE_TOPIC, callback);
    Subscription::new(&self.inner.listeners, CHANGE_TOPIC, id)
  }

  /// Subscribe to the named event stream.
  pub fn events(&self) -> EventStream {
    EventStream::new(self.inner.events.subscribe())
  }

  /// Publish an event on the named stream without touching listeners.
  pub fn publish(&self, event: FilterEvent) {
    // No receivers is fine
    let _ = self.inner.events.send(event);
  }

  /// Number of broadcasts delivered so far.
  pub fn broadcast_count(&self) -> u64 {
    self.inner.broadcasts.load(Ordering::Acquire)
  }

  pub fn debounce(&self) -> Duration {
    self.inner.debounce
  }

  fn schedule_broadcast(&self, kind: FilterEventKind) {
    *Self::lock_kind(&self.inner.debounced_kind) = Some(kind);
    let generation = self.inner.generation.fetch_add(1, Ordering::AcqRel) + 1;

    let Ok(runtime) = Handle::try_current() else {
      warn!(event = kind.name(), "no tokio runtime, broadcasting without debounce");
      Self::lock_kind(&self.inner.debounced_kind).take();
      self.broadcast(kind);
      return;
    };

    let state = self.clone();
    runtime.spawn(async move {
      tokio::time::sleep(state.inner.debounce).await;
      if state.inner.generation.load(Ordering::Acquire) != generation {
        return; // Superseded by a later mutation
      }
      let kind = Self::lock_kind(&state.inner.debounced_kind).take();
      if let Some(kind) = kind {
        state.broadcast(kind);
      }
    });
  }

  /// Deliver the current state to listeners and the event stream.
  ///
  /// A listener that mutates and broadcasts again re-enters here; the inner
  /// broadcast is folded into another pass of the outer loop instead of
  /// recursing.
  fn broadcast(&self, kind: FilterEventKind) {
    *Self::lock_kind(&self.inner.next_kind) = Some(kind);

    loop {
      if self
        .inner
        .broadcasting
        .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
        .is_err()
      {
        return;
      }

      loop {
        let next = Self::lock_kind(&self.inner.next_kind).take();
        let Some(kind) = next else {
          break;
        };
        let snapshot = self.snapshot();
        debug!(
          event = kind.name(),
          active = snapshot.active_count(),
          "broadcasting filter change"
        );
        self.inner.listeners.notify(&[CHANGE_TOPIC], &snapshot);
        self.publish(FilterEvent::new(kind, snapshot));
        self.inner.broadcasts.fetch_add(1, Ordering::AcqRel);
      }

      self.inner.broadcasting.store(false, Ordering::Release);

      if Self::lock_kind(&self.inner.next_kind).is_none() {
        return;
      }
    }
  }
}

impl std::fmt::Debug for CrossfilterState {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("CrossfilterState")
      .field("filters", &self.snapshot())
      .field("debounce", &self.inner.debounce)
      .finish_non_exhaustive()
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::crossfilter::DimensionValue;
  use serde_json::json;

  fn state() -> CrossfilterState {
    CrossfilterState::new(Duration::from_millis(100), ["status", "category"])
  }

  fn record(state: &CrossfilterState) -> Arc<Mutex<Vec<FilterDimensionMap>>> {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let seen_clone = seen.clone();
    // Kept subscribed for the life of the test
    let _ = state.on_change(move |map| seen_clone.lock().unwrap().push(map.clone()));
    seen
  }

  #[tokio::test(start_paused = true)]
  async fn test_scenario_single_select_round_trip() {
    let state = state();
    state.toggle("status", "Open", ToggleOptions::single());
    assert_eq!(
      serde_json::to_value(state.snapshot()).unwrap(),
      json!({"category": null, "status": "Open"})
    );

    state.toggle("status", "Open", ToggleOptions::single());
    assert_eq!(
      serde_json::to_value(state.snapshot()).unwrap(),
      json!({"category": null, "status": null})
    );
  }

  #[tokio::test(start_paused = true)]
  async fn test_burst_of_toggles_produces_one_broadcast() {
    let state = state();
    let seen = record(&state);

    for i in 0..10 {
      state.toggle("category", Scalar::Int(i % 3), ToggleOptions::multi());
      tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert!(seen.lock().unwrap().is_empty());

    tokio::time::sleep(Duration::from_millis(200)).await;
    let seen = seen.lock().unwrap();
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0], state.snapshot());
    assert_eq!(state.broadcast_count(), 1);
  }

  #[tokio::test(start_paused = true)]
  async fn test_intermediate_states_are_never_observed() {
    let state = state();
    let seen = record(&state);

    state.toggle("status", "Open", ToggleOptions::single());
    state.toggle("status", "Closed", ToggleOptions::single());
    state.toggle("status", "Pending", ToggleOptions::single());
    tokio::time::sleep(Duration::from_millis(150)).await;

    let seen = seen.lock().unwrap();
    assert_eq!(seen.len(), 1);
    assert_eq!(
      seen[0].get("status"),
      Some(&DimensionValue::One(Scalar::from("Pending")))
    );
  }

  #[tokio::test(start_paused = true)]
  async fn test_separate_windows_broadcast_separately() {
    let state = state();
    let seen = record(&state);

    state.toggle("status", "Open", ToggleOptions::single());
    tokio::time::sleep(Duration::from_millis(150)).await;
    state.toggle("category", "A", ToggleOptions::multi());
    tokio::time::sleep(Duration::from_millis(150)).await;

    assert_eq!(seen.lock().unwrap().len(), 2);
  }

  #[tokio::test(start_paused = true)]
  async fn test_clear_all_is_immediate_and_cancels_pending() {
    let state = state();
    let seen = record(&state);
    let mut events = state.events();

    state.toggle("status", "Open", ToggleOptions::single());
    state.clear_all();
    assert_eq!(seen.lock().unwrap().len(), 1);
    assert!(!seen.lock().unwrap()[0].has_active());

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(seen.lock().unwrap().len(), 1);

    let event = events.try_next().unwrap();
    assert_eq!(event.kind, FilterEventKind::FilterCleared);
    assert!(events.try_next().is_none());
  }

  #[tokio::test(start_paused = true)]
  async fn test_event_kind_follows_last_mutation() {
    let state = state();
    let mut events = state.events();

    state.toggle("category", "A", ToggleOptions::multi());
    tokio::time::sleep(Duration::from_millis(150)).await;
    state.toggle("category", "A", ToggleOptions::multi());
    tokio::time::sleep(Duration::from_millis(150)).await;

    assert_eq!(events.try_next().unwrap().kind, FilterEventKind::FilterApplied);
    assert_eq!(events.try_next().unwrap().kind, FilterEventKind::FilterRemoved);
  }

  #[tokio::test(start_paused = true)]
  async fn test_clear_previous_resets_other_dimensions() {
    let state = state();
    state.toggle("status", "Open", ToggleOptions::single());
    state.toggle("category", "A", ToggleOptions::multi().clearing_others());

    let snapshot = state.snapshot();
    assert!(snapshot.get("status").is_none());
    assert!(state.is_active("category", &Scalar::from("A")));
  }

  #[tokio::test(start_paused = true)]
  async fn test_reset_is_silent() {
    let state = state();
    let seen = record(&state);
    state.toggle("status", "Open", ToggleOptions::single());
    state.reset();
    tokio::time::sleep(Duration::from_millis(200)).await;

    assert!(seen.lock().unwrap().is_empty());
    assert!(!state.snapshot().has_active());
  }

  #[tokio::test(start_paused = true)]
  async fn test_listener_that_clears_does_not_recurse() {
    let state = state();
    let calls = Arc::new(AtomicU64::new(0));

    let handle = state.clone();
    let calls_clone = calls.clone();
    let _ = state.on_change(move |map| {
      calls_clone.fetch_add(1, Ordering::SeqCst);
      if map.has_active() {
        handle.clear_all();
      }
    });

    state.toggle("status", "Open", ToggleOptions::single());
    tokio::time::sleep(Duration::from_millis(150)).await;

    // Once for the toggle, once more for the nested clear
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert!(!state.snapshot().has_active());
  }

  #[test]
  fn test_toggle_without_runtime_broadcasts_immediately() {
    let state = state();
    let seen = record(&state);

    state.toggle("status", "Open", ToggleOptions::single());
    assert_eq!(state.broadcast_count(), 1);
    assert!(seen.lock().unwrap()[0].is_active("status", &Scalar::from("Open")));

    assert!(state.clear_dimension("status"));
    assert_eq!(state.broadcast_count(), 2);
    assert!(!seen.lock().unwrap()[1].has_active());
  }

  #[tokio::test(start_paused = true)]
  async fn test_panicking_listener_does_not_block_others() {
    let state = state();
    let _ = state.on_change(|_| panic!("listener bug"));
    let seen = record(&state);

    state.toggle("status", "Open", ToggleOptions::single());
    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(seen.lock().unwrap().len(), 1);
  }
}
