//! Page reactions to filter changes.
//!
//! Each bound page gets one worker task. A broadcast wakes the worker only
//! while the page is visible; a broadcast that lands during a run is folded
//! into a single rerun against the live state.

mod clauses;
mod visibility;

pub use clauses::to_clause_list;
pub use visibility::{CurrentPage, VisibilityOracle};

use color_eyre::Result;
use futures::FutureExt;
use std::collections::BTreeMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use crate::crossfilter::{CrossfilterState, FilterClause, FilterDimensionMap};
use crate::event::FilterEvent;
use crate::subscribers::Subscription;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BindingStatus {
  Idle,
  Running,
  RunningPendingRerun,
}

struct BindingShared {
  page: String,
  status: Mutex<BindingStatus>,
  wake: Notify,
  runs: AtomicU64,
}

impl BindingShared {
  fn status(&self) -> MutexGuard<'_, BindingStatus> {
    self.status.lock().unwrap_or_else(|e| e.into_inner())
  }
}

/// Decides whether a broadcast turns into a run.
struct Trigger {
  shared: Arc<BindingShared>,
  state: CrossfilterState,
  visibility: Arc<dyn VisibilityOracle>,
}

impl Trigger {
  fn fire(&self, filters: &FilterDimensionMap) {
    let page = &self.shared.page;
    if !self.visibility.is_visible(page) {
      trace!(page = %page, "page hidden, skipping reaction");
      return;
    }

    let previous = {
      let mut status = self.shared.status();
      let previous = *status;
      *status = match previous {
        BindingStatus::Idle => BindingStatus::Running,
        BindingStatus::Running | BindingStatus::RunningPendingRerun => {
          BindingStatus::RunningPendingRerun
        }
      };
      previous
    };

    // Folded into an already queued rerun: nothing new to announce
    if previous == BindingStatus::RunningPendingRerun {
      return;
    }
    self
      .state
      .publish(FilterEvent::update_requested(page.clone(), filters.clone()));

    if previous == BindingStatus::Idle {
      self.shared.wake.notify_one();
    } else {
      debug!(page = %page, "reaction in flight, queueing one rerun");
    }
  }
}

/// Registers page reactions against a [`CrossfilterState`].
#[derive(Clone)]
pub struct ReactionBinder {
  state: CrossfilterState,
  visibility: Arc<dyn VisibilityOracle>,
  field_names: Arc<BTreeMap<String, String>>,
}

impl ReactionBinder {
  pub fn new(
    state: CrossfilterState,
    visibility: Arc<dyn VisibilityOracle>,
    field_names: BTreeMap<String, String>,
  ) -> Self {
    Self {
      state,
      visibility,
      field_names: Arc::new(field_names),
    }
  }

  pub fn state(&self) -> &CrossfilterState {
    &self.state
  }

  /// Clauses for `filters` using this binder's field mapping.
  pub fn clauses_for(&self, filters: &FilterDimensionMap) -> Vec<FilterClause> {
    to_clause_list(filters, &self.field_names)
  }

  /// Run `react` after each filter broadcast while `page` is visible, never
  /// more than one run at a time.
  ///
  /// `react` receives the filter state as it is when the run starts. Errors
  /// and panics are logged and do not stop later runs.
  pub fn bind<R, Fut>(&self, page: impl Into<String>, react: R) -> Binding
  where
    R: Fn(FilterDimensionMap) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
  {
    let shared = Arc::new(BindingShared {
      page: page.into(),
      status: Mutex::new(BindingStatus::Idle),
      wake: Notify::new(),
      runs: AtomicU64::new(0),
    });

    let trigger = Arc::new(Trigger {
      shared: Arc::clone(&shared),
      state: self.state.clone(),
      visibility: Arc::clone(&self.visibility),
    });

    let worker = tokio::spawn(run_worker(Arc::clone(&shared), self.state.clone(), react));

    let on_change = Arc::clone(&trigger);
    let subscription = self.state.on_change(move |filters| on_change.fire(filters));

    debug!(page = %shared.page, "page bound");
    Binding {
      shared,
      trigger,
      worker,
      subscription: Some(subscription),
    }
  }
}

async fn run_worker<R, Fut>(shared: Arc<BindingShared>, state: CrossfilterState, react: R)
where
  R: Fn(FilterDimensionMap) -> Fut + Send + Sync + 'static,
  Fut: Future<Output = Result<()>> + Send + 'static,
{
  loop {
    shared.wake.notified().await;

    loop {
      let filters = state.snapshot();
      let run = AssertUnwindSafe(async { react(filters).await }).catch_unwind();
      match run.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => warn!(page = %shared.page, error = %e, "reaction failed"),
        Err(_) => warn!(page = %shared.page, "reaction panicked"),
      }
      shared.runs.fetch_add(1, Ordering::AcqRel);

      let mut status = shared.status();
      if *status == BindingStatus::RunningPendingRerun {
        *status = BindingStatus::Running;
        continue;
      }
      *status = BindingStatus::Idle;
      break;
    }
  }
}

/// A live page binding. Dropping it stops further reactions.
pub struct Binding {
  shared: Arc<BindingShared>,
  trigger: Arc<Trigger>,
  worker: JoinHandle<()>,
  subscription: Option<Subscription<FilterDimensionMap>>,
}

impl Binding {
  pub fn page(&self) -> &str {
    &self.shared.page
  }

  pub fn status(&self) -> BindingStatus {
    *self.shared.status()
  }

  /// Completed runs, including failed ones.
  pub fn run_count(&self) -> u64 {
    self.shared.runs.load(Ordering::Acquire)
  }

  /// Trigger a run as if the filters had just changed.
  pub fn request_update(&self) {
    let filters = self.trigger.state.snapshot();
    self.trigger.fire(&filters);
  }

  pub fn unbind(self) {}
}

impl Drop for Binding {
  fn drop(&mut self) {
    self.worker.abort();
    if let Some(subscription) = self.subscription.take() {
      subscription.unsubscribe();
    }
    debug!(page = %self.shared.page, "page unbound");
  }
}

impl std::fmt::Debug for Binding {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("Binding")
      .field("page", &self.shared.page)
      .field("status", &self.status())
      .field("runs", &self.run_count())
      .finish()
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::crossfilter::{Scalar, ToggleOptions};
  use crate::event::FilterEventKind;
  use color_eyre::eyre::eyre;
  use std::sync::atomic::AtomicUsize;
  use std::time::Duration;

  fn setup(visible: &str) -> (ReactionBinder, Arc<CurrentPage>) {
    let state = CrossfilterState::new(Duration::from_millis(100), ["status", "category"]);
    let page = Arc::new(CurrentPage::new(Some(visible.to_string())));
    let binder = ReactionBinder::new(state, page.clone(), BTreeMap::new());
    (binder, page)
  }

  #[tokio::test(start_paused = true)]
  async fn test_visible_page_reacts_once_per_broadcast() {
    let (binder, _) = setup("overview");
    let seen = Arc::new(Mutex::new(Vec::new()));
    let seen_clone = seen.clone();
    let binding = binder.bind("overview", move |filters| {
      let seen = seen_clone.clone();
      async move {
        seen.lock().unwrap().push(filters);
        Ok(())
      }
    });

    binder
      .state()
      .toggle("status", "Open", ToggleOptions::single());
    binder
      .state()
      .toggle("status", "Closed", ToggleOptions::single());
    tokio::time::sleep(Duration::from_millis(200)).await;

    let seen = seen.lock().unwrap();
    assert_eq!(seen.len(), 1);
    assert!(seen[0].is_active("status", &Scalar::from("Closed")));
    assert_eq!(binding.run_count(), 1);
    assert_eq!(binding.status(), BindingStatus::Idle);
  }

  #[tokio::test(start_paused = true)]
  async fn test_hidden_page_does_no_work() {
    let (binder, page) = setup("overview");
    let runs = Arc::new(AtomicUsize::new(0));
    let runs_clone = runs.clone();
    let binding = binder.bind("details", move |_| {
      runs_clone.fetch_add(1, Ordering::SeqCst);
      async { Ok(()) }
    });

    binder
      .state()
      .toggle("status", "Open", ToggleOptions::single());
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(runs.load(Ordering::SeqCst), 0);

    // No backlog carried over when the page becomes visible
    page.set(Some("details".into()));
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(runs.load(Ordering::SeqCst), 0);

    binder
      .state()
      .toggle("status", "Open", ToggleOptions::single());
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(runs.load(Ordering::SeqCst), 1);
    assert_eq!(binding.status(), BindingStatus::Idle);
  }

  #[tokio::test(start_paused = true)]
  async fn test_triggers_during_run_coalesce_into_one_rerun() {
    let (binder, _) = setup("overview");
    let active = Arc::new(AtomicUsize::new(0));
    let max_active = Arc::new(AtomicUsize::new(0));
    let last_seen = Arc::new(Mutex::new(None));

    let (active_c, max_c, last_c) = (active.clone(), max_active.clone(), last_seen.clone());
    let binding = binder.bind("overview", move |filters| {
      let (active, max_active, last_seen) = (active_c.clone(), max_c.clone(), last_c.clone());
      async move {
        let now = active.fetch_add(1, Ordering::SeqCst) + 1;
        max_active.fetch_max(now, Ordering::SeqCst);
        *last_seen.lock().unwrap() = Some(filters);
        tokio::time::sleep(Duration::from_millis(700)).await;
        active.fetch_sub(1, Ordering::SeqCst);
        Ok(())
      }
    });

    let state = binder.state().clone();
    state.toggle("category", "A", ToggleOptions::multi());
    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(binding.status(), BindingStatus::Running);

    for value in ["B", "C", "D"] {
      state.toggle("category", value, ToggleOptions::multi());
      tokio::time::sleep(Duration::from_millis(150)).await;
    }
    assert_eq!(binding.status(), BindingStatus::RunningPendingRerun);

    tokio::time::sleep(Duration::from_millis(2_000)).await;
    assert_eq!(binding.run_count(), 2);
    assert_eq!(max_active.load(Ordering::SeqCst), 1);
    assert_eq!(binding.status(), BindingStatus::Idle);

    // The rerun saw the live state, not the state at the first trigger
    let last = last_seen.lock().unwrap().clone().unwrap();
    assert!(last.is_active("category", &Scalar::from("D")));
  }

  #[tokio::test(start_paused = true)]
  async fn test_failed_reaction_does_not_stop_binding() {
    let (binder, _) = setup("overview");
    let calls = Arc::new(AtomicUsize::new(0));
    let calls_clone = calls.clone();
    let binding = binder.bind("overview", move |_| {
      let n = calls_clone.fetch_add(1, Ordering::SeqCst);
      async move {
        match n {
          0 => Err(eyre!("backend down")),
          1 => panic!("renderer bug"),
          _ => Ok(()),
        }
      }
    });

    for _ in 0..3 {
      binding.request_update();
      tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(calls.load(Ordering::SeqCst), 3);
    assert_eq!(binding.run_count(), 3);
  }

  #[tokio::test(start_paused = true)]
  async fn test_update_requested_names_visible_page() {
    let (binder, _) = setup("overview");
    let mut events = binder.state().events();
    let _binding = binder.bind("overview", |_| async { Ok(()) });

    binder
      .state()
      .toggle("status", "Open", ToggleOptions::single());
    tokio::time::sleep(Duration::from_millis(150)).await;

    // Listeners run before the broadcast's own event is sent
    let requested = events.try_next().unwrap();
    let applied = events.try_next().unwrap();
    assert_eq!(requested.kind, FilterEventKind::UpdateRequested);
    assert_eq!(requested.page.as_deref(), Some("overview"));
    assert_eq!(applied.kind, FilterEventKind::FilterApplied);
    assert!(applied.page.is_none());
  }

  #[tokio::test(start_paused = true)]
  async fn test_update_requested_once_per_run() {
    let (binder, _) = setup("overview");
    let mut events = binder.state().events();
    let binding = binder.bind("overview", |_| async {
      tokio::time::sleep(Duration::from_millis(700)).await;
      Ok(())
    });

    let state = binder.state().clone();
    for value in ["A", "B", "C", "D"] {
      state.toggle("category", value, ToggleOptions::multi());
      tokio::time::sleep(Duration::from_millis(150)).await;
    }
    tokio::time::sleep(Duration::from_millis(2_000)).await;
    assert_eq!(binding.run_count(), 2);

    let mut requested = 0;
    while let Some(event) = events.try_next() {
      if event.kind == FilterEventKind::UpdateRequested {
        requested += 1;
      }
    }
    assert_eq!(requested, 2);
  }

  #[tokio::test(start_paused = true)]
  async fn test_unbind_stops_reactions() {
    let (binder, _) = setup("overview");
    let runs = Arc::new(AtomicUsize::new(0));
    let runs_clone = runs.clone();
    let binding = binder.bind("overview", move |_| {
      runs_clone.fetch_add(1, Ordering::SeqCst);
      async { Ok(()) }
    });
    binding.unbind();

    binder
      .state()
      .toggle("status", "Open", ToggleOptions::single());
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(runs.load(Ordering::SeqCst), 0);
  }

  #[test]
  fn test_clauses_use_field_mapping() {
    let state = CrossfilterState::new(Duration::from_millis(100), ["status"]);
    let mut fields = BTreeMap::new();
    fields.insert("status".to_string(), "state".to_string());
    let binder = ReactionBinder::new(state, Arc::new(CurrentPage::default()), fields);

    let mut filters = FilterDimensionMap::new();
    filters.toggle("status", Scalar::from("Open"), false);
    assert_eq!(binder.clauses_for(&filters)[0].field, "state");
  }
}
