//! Two-tier cache store: transient map plus best-effort durable mirror.

use chrono::Utc;
use color_eyre::Result;
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, warn};

use super::durable::{DurableError, DurableRecord, DurableTier, NoopTier, SqliteTier};
use super::ttl::TtlTable;
use crate::config::CacheConfig;
use crate::subscribers::{Subscribers, Subscription};

/// Key that global subscribers register under, and that a full clear is
/// reported with.
pub const ALL_KEYS: &str = "*";

/// A change notification: `value` is `None` when the key was invalidated.
#[derive(Debug, Clone)]
pub struct CacheEvent {
  pub key: String,
  pub value: Option<Arc<Value>>,
}

/// A transient-tier entry.
#[derive(Debug, Clone)]
pub struct CacheEntry {
  pub value: Arc<Value>,
  pub written_at: Instant,
  pub ttl: Duration,
  /// Whether the entry was mirrored to the durable tier
  pub durable: bool,
}

impl CacheEntry {
  fn is_fresh(&self, ttl: Duration) -> bool {
    self.written_at.elapsed() <= ttl
  }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
  pub hits: u64,
  pub misses: u64,
  pub durable_hits: u64,
  pub expired: u64,
  pub dropped_durable_writes: u64,
}

#[derive(Default)]
struct Counters {
  hits: AtomicU64,
  misses: AtomicU64,
  durable_hits: AtomicU64,
  expired: AtomicU64,
  dropped_durable_writes: AtomicU64,
}

struct Inner {
  entries: Mutex<HashMap<String, CacheEntry>>,
  ttl: TtlTable,
  durable_threshold: Duration,
  durable: Arc<dyn DurableTier>,
  subscribers: Arc<Subscribers<CacheEvent>>,
  /// Pending notifications, delivered in issue order by whichever caller
  /// holds `draining`
  outbox: Mutex<VecDeque<CacheEvent>>,
  draining: AtomicBool,
  counters: Counters,
}

/// Cache keyed by logical resource name.
///
/// Values are immutable `serde_json::Value`s shared behind `Arc`, so reads
/// never copy and a reader can never mutate what another reader sees.
#[derive(Clone)]
pub struct CacheStore {
  inner: Arc<Inner>,
}

impl CacheStore {
  pub fn new(ttl: TtlTable, durable_threshold: Duration, durable: Arc<dyn DurableTier>) -> Self {
    Self {
      inner: Arc::new(Inner {
        entries: Mutex::new(HashMap::new()),
        ttl,
        durable_threshold,
        durable,
        subscribers: Arc::new(Subscribers::new()),
        outbox: Mutex::new(VecDeque::new()),
        draining: AtomicBool::new(false),
        counters: Counters::default(),
      }),
    }
  }

  /// Transient-only store.
  pub fn in_memory(ttl: TtlTable) -> Self {
    Self::new(ttl, Duration::MAX, Arc::new(NoopTier))
  }

  /// Build a store from configuration, opening the SQLite durable tier if enabled.
  pub fn from_config(config: &CacheConfig) -> Result<Self> {
    let mut ttl = TtlTable::new(config.default_ttl());
    for (pattern, ms) in &config.ttl_patterns {
      ttl.insert(pattern.clone(), Duration::from_millis(*ms));
    }

    let durable: Arc<dyn DurableTier> = if config.durable.enabled {
      Arc::new(SqliteTier::open(
        config.durable.path.as_deref(),
        config.durable.max_pages,
      )?)
    } else {
      Arc::new(NoopTier)
    };

    Ok(Self::new(ttl, config.durable_threshold(), durable))
  }

  fn entries(&self) -> std::sync::MutexGuard<'_, HashMap<String, CacheEntry>> {
    self.inner.entries.lock().unwrap_or_else(|e| e.into_inner())
  }

  pub fn resolve_ttl(&self, key: &str) -> Duration {
    self.inner.ttl.resolve(key)
  }

  fn is_durable_ttl(&self, ttl: Duration) -> bool {
    ttl >= self.inner.durable_threshold
  }

  /// Read `key`. The effective TTL is `ttl_override` if given, else the TTL
  /// the entry was written with. Expired entries are evicted and reported as
  /// a miss; for durable-eligible TTLs a transient miss falls through to the
  /// durable tier.
  pub fn get(&self, key: &str, ttl_override: Option<Duration>) -> Option<Arc<Value>> {
    {
      let mut entries = self.entries();
      if let Some(entry) = entries.get(key) {
        let ttl = ttl_override.unwrap_or(entry.ttl);
        if entry.is_fresh(ttl) {
          self.inner.counters.hits.fetch_add(1, Ordering::Relaxed);
          debug!(key, "cache hit");
          return Some(Arc::clone(&entry.value));
        }
        entries.remove(key);
        self.inner.counters.expired.fetch_add(1, Ordering::Relaxed);
        debug!(key, "cache entry expired");
      }
    }

    let ttl = ttl_override.unwrap_or_else(|| self.resolve_ttl(key));
    if self.is_durable_ttl(ttl) {
      if let Some(value) = self.read_durable(key, ttl) {
        self.inner.counters.durable_hits.fetch_add(1, Ordering::Relaxed);
        return Some(value);
      }
    }

    self.inner.counters.misses.fetch_add(1, Ordering::Relaxed);
    debug!(key, "cache miss");
    None
  }

  /// Consult the durable tier and hydrate the transient tier on a fresh hit.
  fn read_durable(&self, key: &str, ttl: Duration) -> Option<Arc<Value>> {
    let record = match self.inner.durable.get(key) {
      Ok(Some(record)) => record,
      Ok(None) => return None,
      Err(e) => {
        warn!(key, error = %e, "durable read failed");
        return None;
      }
    };

    let age = Duration::from_millis(record.age_millis(Utc::now().timestamp_millis()));
    if age > ttl {
      if let Err(e) = self.inner.durable.remove(&[key]) {
        warn!(key, error = %e, "failed to drop expired durable entry");
      }
      return None;
    }

    debug!(key, age_ms = age.as_millis() as u64, "durable cache hit");
    let now = Instant::now();
    let value = Arc::new(record.data);
    self.entries().insert(
      key.to_string(),
      CacheEntry {
        value: Arc::clone(&value),
        written_at: now.checked_sub(age).unwrap_or(now),
        ttl: Duration::from_millis(record.ttl_millis),
        durable: true,
      },
    );
    Some(value)
  }

  /// Store an owned value under `key` with its pattern-resolved TTL.
  pub fn set(&self, key: &str, value: Value) {
    self.insert(key, Arc::new(value), None);
  }

  /// Store an owned value with an explicit TTL.
  pub fn set_with_ttl(&self, key: &str, value: Value, ttl: Duration) {
    self.insert(key, Arc::new(value), Some(ttl));
  }

  /// Store a value the caller keeps a reference to, without copying it.
  pub fn set_shared(&self, key: &str, value: Arc<Value>) {
    self.insert(key, value, None);
  }

  fn insert(&self, key: &str, value: Arc<Value>, ttl: Option<Duration>) {
    let ttl = ttl.unwrap_or_else(|| self.resolve_ttl(key));
    let durable = self.is_durable_ttl(ttl);

    self.entries().insert(
      key.to_string(),
      CacheEntry {
        value: Arc::clone(&value),
        written_at: Instant::now(),
        ttl,
        durable,
      },
    );

    if durable {
      self.mirror(key, &value, ttl);
    }

    self.publish(CacheEvent {
      key: key.to_string(),
      value: Some(value),
    });
  }

  /// Write to the durable tier. On a quota error, sweep expired durable rows
  /// and retry once; a second failure drops the write.
  fn mirror(&self, key: &str, value: &Value, ttl: Duration) {
    let ttl_millis = u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX);
    let record = DurableRecord::new(value.clone(), ttl_millis);

    match self.inner.durable.put(key, &record) {
      Ok(()) => {}
      Err(DurableError::QuotaExceeded) => {
        let swept = self
          .inner
          .durable
          .evict_expired(Utc::now().timestamp_millis())
          .unwrap_or(0);
        debug!(key, swept, "durable quota exceeded, retrying after sweep");
        if let Err(e) = self.inner.durable.put(key, &record) {
          self
            .inner
            .counters
            .dropped_durable_writes
            .fetch_add(1, Ordering::Relaxed);
          debug!(key, error = %e, "durable write dropped");
        }
      }
      Err(e) => {
        self
          .inner
          .counters
          .dropped_durable_writes
          .fetch_add(1, Ordering::Relaxed);
        warn!(key, error = %e, "durable write failed");
      }
    }
  }

  /// Drop `keys` from both tiers, or everything when `None`.
  ///
  /// Always notifies: once per key, or once with key `*` for a full clear.
  pub fn invalidate(&self, keys: Option<&[&str]>) {
    match keys {
      Some(keys) => {
        {
          let mut entries = self.entries();
          for key in keys {
            entries.remove(*key);
          }
        }
        if let Err(e) = self.inner.durable.remove(keys) {
          warn!(error = %e, "failed to remove durable entries");
        }
        for key in keys {
          self.publish(CacheEvent {
            key: key.to_string(),
            value: None,
          });
        }
      }
      None => {
        self.entries().clear();
        if let Err(e) = self.inner.durable.clear() {
          warn!(error = %e, "failed to clear durable tier");
        }
        self.publish(CacheEvent {
          key: ALL_KEYS.to_string(),
          value: None,
        });
      }
    }
  }

  /// Shorthand for invalidating a single key.
  pub fn invalidate_key(&self, key: &str) {
    self.invalidate(Some(&[key]));
  }

  /// Register `callback` for changes to `key`. Subscribing to `*` receives
  /// every event.
  pub fn subscribe<F>(&self, key: &str, callback: F) -> Subscription<CacheEvent>
  where
    F: Fn(&CacheEvent) + Send + Sync + 'static,
  {
    let id = self.inner.subscribers.add(key, callback);
    Subscription::new(&self.inner.subscribers, key, id)
  }

  /// Queue `event` and deliver the outbox unless another caller already is.
  ///
  /// A subscriber that writes to the cache re-enters here; its event is
  /// queued behind the current one instead of recursing.
  fn publish(&self, event: CacheEvent) {
    self.lock_outbox().push_back(event);

    loop {
      if self
        .inner
        .draining
        .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
        .is_err()
      {
        return;
      }

      loop {
        let next = self.lock_outbox().pop_front();
        let Some(event) = next else {
          break;
        };
        if event.key == ALL_KEYS {
          self.inner.subscribers.notify(&[ALL_KEYS], &event);
        } else {
          self.inner.subscribers.notify(&[&event.key, ALL_KEYS], &event);
        }
      }

      self.inner.draining.store(false, Ordering::Release);

      // An event may have been queued between the last pop and the release
      if self.lock_outbox().is_empty() {
        return;
      }
    }
  }

  fn lock_outbox(&self) -> std::sync::MutexGuard<'_, VecDeque<CacheEvent>> {
    self.inner.outbox.lock().unwrap_or_else(|e| e.into_inner())
  }

  /// Remove expired rows from the durable tier.
  pub fn sweep_durable(&self) -> usize {
    match self
      .inner
      .durable
      .evict_expired(Utc::now().timestamp_millis())
    {
      Ok(removed) => {
        if removed > 0 {
          debug!(removed, "swept expired durable entries");
        }
        removed
      }
      Err(e) => {
        warn!(error = %e, "durable sweep failed");
        0
      }
    }
  }

  /// Run [`CacheStore::sweep_durable`] every `interval` until the handle is aborted.
  pub fn spawn_durable_sweeper(&self, interval: Duration) -> JoinHandle<()> {
    let store = self.clone();
    tokio::spawn(async move {
      let mut ticker = tokio::time::interval(interval);
      ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
      loop {
        ticker.tick().await;
        store.sweep_durable();
      }
    })
  }

  /// Keys currently held in the transient tier, expired or not.
  pub fn keys(&self) -> Vec<String> {
    let mut keys: Vec<String> = self.entries().keys().cloned().collect();
    keys.sort();
    keys
  }

  pub fn len(&self) -> usize {
    self.entries().len()
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }

  pub fn entry(&self, key: &str) -> Option<CacheEntry> {
    self.entries().get(key).cloned()
  }

  pub fn stats(&self) -> CacheStats {
    let c = &self.inner.counters;
    CacheStats {
      hits: c.hits.load(Ordering::Relaxed),
      misses: c.misses.load(Ordering::Relaxed),
      durable_hits: c.durable_hits.load(Ordering::Relaxed),
      expired: c.expired.load(Ordering::Relaxed),
      dropped_durable_writes: c.dropped_durable_writes.load(Ordering::Relaxed),
    }
  }
}

impl std::fmt::Debug for CacheStore {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("CacheStore")
      .field("entries", &self.len())
      .field("stats", &self.stats())
      .finish_non_exhaustive()
  }
}
