//! One user session: the services a dashboard's pages share.

use color_eyre::Result;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::info;

use crate::aggregate::FilteredAggregate;
use crate::binder::{Binding, CurrentPage, ReactionBinder, VisibilityOracle};
use crate::cache::{CacheStore, HandleRegistry};
use crate::client::{HttpFetcher, ResourceFetcher};
use crate::config::Config;
use crate::crossfilter::{CrossfilterState, FilterDimensionMap};
use crate::error::LoadError;
use crate::scheduler::{LoadOptions, RequestScheduler};

/// Wires the cache, scheduler, filter state and binder together.
///
/// Filter state is scoped to the current page and reset by [`Session::navigate`];
/// cached data outlives navigation.
pub struct Session<F = HttpFetcher> {
  config: Config,
  scheduler: RequestScheduler<F>,
  filters: CrossfilterState,
  page: Arc<CurrentPage>,
  binder: ReactionBinder,
  handles: HandleRegistry,
  sweeper: Option<JoinHandle<()>>,
}

impl Session<HttpFetcher> {
  /// Build a session talking to the configured API, with the durable tier
  /// opened from configuration.
  pub fn from_config(config: Config) -> Result<Self> {
    let fetcher = HttpFetcher::from_config(&config.api)?;
    let cache = CacheStore::from_config(&config.cache)?;
    Ok(Self::with_fetcher(config, fetcher, cache))
  }
}

impl<F: ResourceFetcher> Session<F> {
  pub fn with_fetcher(config: Config, fetcher: F, cache: CacheStore) -> Self {
    let scheduler = RequestScheduler::new(fetcher, cache, &config.scheduler);
    let filters = CrossfilterState::from_config(&config.crossfilter);
    let page = Arc::new(CurrentPage::default());
    let binder = ReactionBinder::new(
      filters.clone(),
      page.clone(),
      config.crossfilter.field_names.clone(),
    );

    Self {
      config,
      scheduler,
      filters,
      page,
      binder,
      handles: HandleRegistry::new(),
      sweeper: None,
    }
  }

  pub fn config(&self) -> &Config {
    &self.config
  }

  pub fn cache(&self) -> &CacheStore {
    self.scheduler.cache()
  }

  pub fn scheduler(&self) -> &RequestScheduler<F> {
    &self.scheduler
  }

  pub fn filters(&self) -> &CrossfilterState {
    &self.filters
  }

  pub fn binder(&self) -> &ReactionBinder {
    &self.binder
  }

  /// Rendering handles for the current page.
  pub fn handles(&self) -> &HandleRegistry {
    &self.handles
  }

  pub fn current_page(&self) -> Option<String> {
    self.page.visible_page()
  }

  /// Start the periodic durable-tier sweep. Does nothing if it is already
  /// running or the durable tier is disabled.
  pub fn start_sweeper(&mut self) {
    let durable = &self.config.cache.durable;
    if self.sweeper.is_some() || !durable.enabled || durable.sweep_interval_secs == 0 {
      return;
    }
    let interval = Duration::from_secs(durable.sweep_interval_secs);
    self.sweeper = Some(self.cache().spawn_durable_sweeper(interval));
  }

  /// Switch to `page`: filters start over and the previous page's
  /// rendering handles are released. Cached data is kept.
  pub fn navigate(&self, page: &str) {
    self.filters.reset();
    self.handles.clear();
    self.page.set(Some(page.to_string()));
    info!(page, "navigated");
  }

  /// Bind a reaction for `page`; see [`ReactionBinder::bind`].
  pub fn bind<R, Fut>(&self, page: impl Into<String>, react: R) -> Binding
  where
    R: Fn(FilterDimensionMap) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = Result<()>> + Send + 'static,
  {
    self.binder.bind(page, react)
  }

  /// Fetch the filtered aggregate at `path` for the current filter state.
  pub async fn load_filtered(
    &self,
    path: &str,
    options: LoadOptions,
  ) -> Result<FilteredAggregate, LoadError> {
    let clauses = self.binder.clauses_for(&self.filters.snapshot());
    self.scheduler.load_filtered(path, &clauses, options).await
  }
}

impl<F> Drop for Session<F> {
  fn drop(&mut self) {
    if let Some(sweeper) = self.sweeper.take() {
      sweeper.abort();
    }
  }
}
