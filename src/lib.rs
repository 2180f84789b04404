//! Data access and cross-filter coordination for dashboards.
//!
//! - [`cache::CacheStore`]: two-tier TTL cache with change notifications
//! - [`scheduler::RequestScheduler`]: bounded, coalescing, retrying loads
//! - [`crossfilter::CrossfilterState`]: toggleable filter dimensions with debounced broadcast
//! - [`binder::ReactionBinder`]: visibility-gated, non-reentrant page reactions
//!
//! [`session::Session`] wires them together for one user session.

pub mod aggregate;
pub mod binder;
pub mod cache;
pub mod client;
pub mod config;
pub mod crossfilter;
pub mod error;
pub mod event;
pub mod logging;
pub mod scheduler;
pub mod session;
pub mod subscribers;

pub use aggregate::{FilteredAggregate, GroupCount};
pub use binder::{to_clause_list, Binding, BindingStatus, ReactionBinder, VisibilityOracle};
pub use cache::{CacheStore, HandleRegistry, TtlTable};
pub use client::{HttpFetcher, ResourceFetcher, ResourceRequest};
pub use config::Config;
pub use crossfilter::{
  CrossfilterState, DimensionValue, FilterClause, FilterDimensionMap, Operator, Scalar,
  ToggleOptions,
};
pub use error::{FaultClass, FetchError, LoadError};
pub use event::{EventStream, FilterEvent, FilterEventKind};
pub use scheduler::{LoadOptions, Priority, RequestScheduler};
pub use session::Session;
