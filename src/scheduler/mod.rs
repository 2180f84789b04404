//! Request scheduling: read-through caching, coalescing, bounded concurrency
//! and retry with backoff.

mod options;
mod queue;
mod timeouts;

pub use options::{LoadOptions, Priority};
pub use queue::{QueueSlot, RequestQueue};
pub use timeouts::TimeoutTable;

use futures::future::{BoxFuture, FutureExt, Shared};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::aggregate::FilteredAggregate;
use crate::cache::CacheStore;
use crate::client::{ResourceFetcher, ResourceRequest};
use crate::config::SchedulerConfig;
use crate::crossfilter::FilterClause;
use crate::error::{FaultClass, FetchError, LoadError};

type SharedLoad = Shared<BoxFuture<'static, Result<Arc<Value>, LoadError>>>;

/// Outcome of one resource in [`RequestScheduler::load_many`].
#[derive(Debug, Clone)]
pub struct LoadOutcome {
  pub resource: String,
  pub result: Result<Arc<Value>, LoadError>,
}

impl LoadOutcome {
  pub fn value(&self) -> Option<&Value> {
    self.result.as_ref().ok().map(|v| v.as_ref())
  }

  pub fn error(&self) -> Option<&LoadError> {
    self.result.as_ref().err()
  }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SchedulerStats {
  /// Loads answered from the cache
  pub cache_hits: u64,
  /// Loads that attached to an in-flight request
  pub coalesced: u64,
  /// Fetch attempts issued
  pub calls: u64,
  pub retries: u64,
  /// Loads resolved to their fallback after a fault
  pub fallbacks: u64,
  pub hard_failures: u64,
}

#[derive(Default)]
struct Counters {
  cache_hits: AtomicU64,
  coalesced: AtomicU64,
  calls: AtomicU64,
  retries: AtomicU64,
  fallbacks: AtomicU64,
  hard_failures: AtomicU64,
}

struct Inner<F> {
  fetcher: F,
  cache: CacheStore,
  queue: Arc<RequestQueue>,
  timeouts: TimeoutTable,
  retry_base_delay: Duration,
  default_retry_count: u32,
  /// Coalescing key -> (generation, in-flight outcome)
  pending: Mutex<HashMap<String, (u64, SharedLoad)>>,
  next_generation: AtomicU64,
  counters: Counters,
}

/// Schedules resource loads against a [`ResourceFetcher`].
pub struct RequestScheduler<F> {
  inner: Arc<Inner<F>>,
}

impl<F> Clone for RequestScheduler<F> {
  fn clone(&self) -> Self {
    Self {
      inner: Arc::clone(&self.inner),
    }
  }
}

/// Removes a pending entry when its task settles, before awaiting callers
/// are woken.
struct PendingGuard<F: ResourceFetcher> {
  inner: Arc<Inner<F>>,
  key: String,
  generation: u64,
}

impl<F: ResourceFetcher> Drop for PendingGuard<F> {
  fn drop(&mut self) {
    let mut pending = self.inner.pending.lock().unwrap_or_else(|e| e.into_inner());
    if matches!(pending.get(&self.key), Some((g, _)) if *g == self.generation) {
      pending.remove(&self.key);
    }
  }
}

impl<F: ResourceFetcher> RequestScheduler<F> {
  pub fn new(fetcher: F, cache: CacheStore, config: &SchedulerConfig) -> Self {
    Self {
      inner: Arc::new(Inner {
        fetcher,
        cache,
        queue: Arc::new(RequestQueue::new(config.max_concurrent)),
        timeouts: TimeoutTable::from_config(config),
        retry_base_delay: Duration::from_millis(config.retry_base_delay_ms),
        default_retry_count: config.default_retry_count,
        pending: Mutex::new(HashMap::new()),
        next_generation: AtomicU64::new(1),
        counters: Counters::default(),
      }),
    }
  }

  pub fn cache(&self) -> &CacheStore {
    &self.inner.cache
  }

  pub fn fetcher(&self) -> &F {
    &self.inner.fetcher
  }

  pub fn queue(&self) -> &RequestQueue {
    &self.inner.queue
  }

  fn pending(&self) -> MutexGuard<'_, HashMap<String, (u64, SharedLoad)>> {
    self.inner.pending.lock().unwrap_or_else(|e| e.into_inner())
  }

  /// Requests currently in flight, after coalescing.
  pub fn pending_count(&self) -> usize {
    self.pending().len()
  }

  /// `GET` a resource.
  ///
  /// Absorbed faults resolve to `options.fallback`; only a hard fault (or a
  /// crashed load task) is returned as an error.
  pub async fn load(&self, resource: &str, options: LoadOptions) -> Result<Arc<Value>, LoadError> {
    self.load_request(ResourceRequest::get(resource), options).await
  }

  pub async fn load_request(
    &self,
    request: ResourceRequest,
    options: LoadOptions,
  ) -> Result<Arc<Value>, LoadError> {
    if options.use_cache {
      if let Some(value) = self.inner.cache.get(&request.cache_key(), None) {
        self.inner.counters.cache_hits.fetch_add(1, Ordering::Relaxed);
        return Ok(value);
      }
    }

    let key = options.coalescing_key(&request);
    let shared = {
      let mut pending = self.pending();
      match pending.get(&key) {
        Some((_, shared)) => {
          self.inner.counters.coalesced.fetch_add(1, Ordering::Relaxed);
          debug!(resource = %request.path, "joining in-flight request");
          shared.clone()
        }
        None => {
          let generation = self.inner.next_generation.fetch_add(1, Ordering::Relaxed);
          let shared = self.spawn_load(key.clone(), generation, request, options);
          // The task cannot clear its entry before this insert: it needs the
          // lock we are holding
          pending.insert(key, (generation, shared.clone()));
          shared
        }
      }
    };

    shared.await
  }

  fn spawn_load(
    &self,
    key: String,
    generation: u64,
    request: ResourceRequest,
    options: LoadOptions,
  ) -> SharedLoad {
    let resource = request.path.clone();
    let scheduler = self.clone();
    let handle = tokio::spawn(async move {
      let _guard = PendingGuard {
        inner: Arc::clone(&scheduler.inner),
        key,
        generation,
      };
      scheduler.execute(request, options).await
    });

    handle
      .map(move |joined| match joined {
        Ok(result) => result,
        Err(e) => Err(LoadError::Aborted {
          resource,
          reason: e.to_string().into(),
        }),
      })
      .boxed()
      .shared()
  }

  fn backoff(&self, attempt: u32) -> Duration {
    let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
    self.inner.retry_base_delay.saturating_mul(factor)
  }

  /// Attempt the call until it succeeds, is absorbed, or hard-fails.
  ///
  /// A queue slot is held for each attempt only; backoff waits release it.
  async fn execute(
    &self,
    request: ResourceRequest,
    options: LoadOptions,
  ) -> Result<Arc<Value>, LoadError> {
    let cache_key = request.cache_key();
    let timeout = options
      .timeout
      .unwrap_or_else(|| self.inner.timeouts.resolve(&request.path));
    let retries = options.retry_count.unwrap_or(self.inner.default_retry_count);
    let mut attempt = 0u32;

    loop {
      let result = {
        let _slot = self.inner.queue.acquire(options.priority).await;
        self.inner.counters.calls.fetch_add(1, Ordering::Relaxed);
        info!(
          resource = %request.path,
          attempt,
          timeout_ms = timeout.as_millis() as u64,
          "fetching"
        );
        match tokio::time::timeout(timeout, self.inner.fetcher.fetch(&request, timeout)).await {
          Ok(result) => result,
          Err(_) => Err(FetchError::Timeout),
        }
      };

      let err = match result {
        Ok(value) => {
          let value = match value {
            Value::Null => options.fallback.clone(),
            value => value,
          };
          let value = Arc::new(value);
          if options.use_cache {
            self.inner.cache.set_shared(&cache_key, Arc::clone(&value));
          }
          return Ok(value);
        }
        Err(err) => err,
      };

      match err.class() {
        FaultClass::Transient { evict_cache } => {
          if evict_cache {
            self.inner.cache.invalidate_key(&cache_key);
          }
          if attempt >= retries {
            warn!(
              resource = %request.path,
              error = %err,
              attempts = attempt + 1,
              "retries exhausted, using fallback"
            );
            return Ok(self.fallback(&options));
          }
          let delay = self.backoff(attempt);
          debug!(
            resource = %request.path,
            error = %err,
            delay_ms = delay.as_millis() as u64,
            "retrying after backoff"
          );
          self.inner.counters.retries.fetch_add(1, Ordering::Relaxed);
          tokio::time::sleep(delay).await;
          attempt += 1;
        }
        FaultClass::NonRetryable => {
          warn!(resource = %request.path, error = %err, "fetch failed, using fallback");
          return Ok(self.fallback(&options));
        }
        FaultClass::Hard => {
          self.inner.counters.hard_failures.fetch_add(1, Ordering::Relaxed);
          error!(resource = %request.path, error = %err, "hard fetch failure");
          return Err(LoadError::Hard {
            resource: request.path,
            source: err,
          });
        }
      }
    }
  }

  fn fallback(&self, options: &LoadOptions) -> Arc<Value> {
    self.inner.counters.fallbacks.fetch_add(1, Ordering::Relaxed);
    Arc::new(options.fallback.clone())
  }

  /// Load every resource concurrently. Each outcome is reported separately;
  /// one failure does not affect the others.
  pub async fn load_many<I, S>(&self, resources: I, options: LoadOptions) -> Vec<LoadOutcome>
  where
    I: IntoIterator<Item = S>,
    S: Into<String>,
  {
    let loads = resources.into_iter().map(|resource| {
      let resource: String = resource.into();
      let options = options.clone();
      async move {
        let result = self.load(&resource, options).await;
        LoadOutcome { resource, result }
      }
    });
    futures::future::join_all(loads).await
  }

  /// `POST` filter clauses to a filtered-aggregate endpoint.
  ///
  /// The result is cached under a sub-key of `path` derived from the clauses.
  pub async fn load_filtered(
    &self,
    path: &str,
    clauses: &[FilterClause],
    options: LoadOptions,
  ) -> Result<FilteredAggregate, LoadError> {
    let request = ResourceRequest::post(path, json!({ "filters": clauses }));
    let value = self.load_request(request, options).await?;
    Ok(FilteredAggregate::from_response(&value))
  }

  pub fn stats(&self) -> SchedulerStats {
    let c = &self.inner.counters;
    SchedulerStats {
      cache_hits: c.cache_hits.load(Ordering::Relaxed),
      coalesced: c.coalesced.load(Ordering::Relaxed),
      calls: c.calls.load(Ordering::Relaxed),
      retries: c.retries.load(Ordering::Relaxed),
      fallbacks: c.fallbacks.load(Ordering::Relaxed),
      hard_failures: c.hard_failures.load(Ordering::Relaxed),
    }
  }
}
