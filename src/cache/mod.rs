//! Two-tier cache for resource payloads.
//!
//! This module provides:
//! - A transient in-process tier with lazy, per-entry TTL expiry
//! - TTL resolution from a key pattern table
//! - A best-effort durable tier (SQLite) for long-lived entries
//! - Per-key and global change notifications
//! - A separate registry for live rendering handles that must never be cached

mod durable;
mod handles;
mod store;
mod ttl;

pub use durable::{DurableError, DurableRecord, DurableTier, NoopTier, SqliteTier, KEY_PREFIX};
pub use handles::HandleRegistry;
pub use store::{CacheEntry, CacheEvent, CacheStats, CacheStore, ALL_KEYS};
pub use ttl::TtlTable;
