use serde::Serialize;
use tokio::sync::broadcast;

use crate::crossfilter::FilterDimensionMap;

/// Named broadcast events consumed by renderers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum FilterEventKind {
  /// A value was added to a dimension
  FilterApplied,
  /// A value or dimension was deactivated
  FilterRemoved,
  /// Every dimension was reset
  FilterCleared,
  /// A visible page was asked to refresh
  UpdateRequested,
}

impl FilterEventKind {
  pub fn name(&self) -> &'static str {
    match self {
      FilterEventKind::FilterApplied => "filter-applied",
      FilterEventKind::FilterRemoved => "filter-removed",
      FilterEventKind::FilterCleared => "filter-cleared",
      FilterEventKind::UpdateRequested => "update-requested",
    }
  }
}

/// An event with the filter state it was raised against.
#[derive(Debug, Clone, Serialize)]
pub struct FilterEvent {
  pub kind: FilterEventKind,
  pub filters: FilterDimensionMap,
  /// Visible page for `update-requested`; renderers of other pages ignore it
  #[serde(skip_serializing_if = "Option::is_none")]
  pub page: Option<String>,
}

impl FilterEvent {
  pub fn new(kind: FilterEventKind, filters: FilterDimensionMap) -> Self {
    Self {
      kind,
      filters,
      page: None,
    }
  }

  pub fn update_requested(page: impl Into<String>, filters: FilterDimensionMap) -> Self {
    Self {
      kind: FilterEventKind::UpdateRequested,
      filters,
      page: Some(page.into()),
    }
  }

  /// Whether a renderer for `page` should act on this event.
  pub fn concerns(&self, page: &str) -> bool {
    match &self.page {
      Some(p) => p == page,
      None => true,
    }
  }
}

/// Receiving end of the event stream for one renderer
pub struct EventStream {
  rx: broadcast::Receiver<FilterEvent>,
}

impl EventStream {
  pub(crate) fn new(rx: broadcast::Receiver<FilterEvent>) -> Self {
    Self { rx }
  }

  /// Receive the next event. A slow renderer that lagged skips what it
  /// missed; the next event still carries the full current state.
  pub async fn next(&mut self) -> Option<FilterEvent> {
    loop {
      match self.rx.recv().await {
        Ok(event) => return Some(event),
        Err(broadcast::error::RecvError::Lagged(skipped)) => {
          tracing::debug!(skipped, "event stream lagged");
        }
        Err(broadcast::error::RecvError::Closed) => return None,
      }
    }
  }

  /// Receive the next event relevant to `page`.
  pub async fn next_for(&mut self, page: &str) -> Option<FilterEvent> {
    loop {
      let event = self.next().await?;
      if event.concerns(page) {
        return Some(event);
      }
    }
  }

  /// Non-blocking receive, for polling from a tick loop.
  pub fn try_next(&mut self) -> Option<FilterEvent> {
    loop {
      match self.rx.try_recv() {
        Ok(event) => return Some(event),
        Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
        Err(_) => return None,
      }
    }
  }
}
