//! Fault taxonomy for resource fetches.

use std::sync::Arc;

/// A failed fetch, as reported by a [`ResourceFetcher`](crate::client::ResourceFetcher).
#[derive(Debug, Clone, thiserror::Error)]
pub enum FetchError {
  /// The call exceeded its timeout and was aborted
  #[error("request timed out")]
  Timeout,
  /// Connection-level failure before a status was received
  #[error("transport failure: {0}")]
  Transport(String),
  /// The server answered with a non-2xx status
  #[error("unexpected HTTP status {0}")]
  Status(u16),
  /// The body could not be decoded as JSON
  #[error("malformed response body: {0}")]
  Malformed(String),
  /// The request could not be built (bad path, bad base URL)
  #[error("invalid request: {0}")]
  InvalidRequest(String),
}

/// How the scheduler reacts to a [`FetchError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultClass {
  /// Retry with backoff. `evict_cache` is set for gateway errors, whose cached
  /// copy is assumed stale.
  Transient { evict_cache: bool },
  /// Resolve to the fallback value without retrying
  NonRetryable,
  /// Propagate to the caller
  Hard,
}

impl FetchError {
  pub fn class(&self) -> FaultClass {
    match self {
      FetchError::Timeout | FetchError::Transport(_) => {
        FaultClass::Transient { evict_cache: false }
      }
      FetchError::Status(502..=504) => FaultClass::Transient { evict_cache: true },
      FetchError::Status(404 | 500) => FaultClass::NonRetryable,
      FetchError::Status(_) => FaultClass::Hard,
      FetchError::Malformed(_) => FaultClass::NonRetryable,
      FetchError::InvalidRequest(_) => FaultClass::Hard,
    }
  }
}

/// Error surfaced by [`RequestScheduler::load`](crate::scheduler::RequestScheduler::load).
///
/// Cloneable so one outcome can be handed to every coalesced caller.
#[derive(Debug, Clone, thiserror::Error)]
pub enum LoadError {
  #[error("hard fault loading {resource}: {source}")]
  Hard {
    resource: String,
    #[source]
    source: FetchError,
  },
  #[error("load task for {resource} was aborted: {reason}")]
  Aborted {
    resource: String,
    reason: Arc<str>,
  },
}
