//! Durable cache tier trait and SQLite implementation.
//!
//! The durable tier is best-effort: it mirrors long-lived entries so they
//! survive a restart, but any write may be dropped under quota pressure.

use chrono::Utc;
use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, Connection, ErrorCode, OptionalExtension};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

/// Fixed prefix all durable keys are stored under.
pub const KEY_PREFIX: &str = "crossdash:";

/// A durable row, serialized as `{ data, writtenAt, ttlMillis }`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DurableRecord {
  pub data: Value,
  /// Epoch millis
  pub written_at: i64,
  pub ttl_millis: u64,
}

impl DurableRecord {
  pub fn new(data: Value, ttl_millis: u64) -> Self {
    Self {
      data,
      written_at: Utc::now().timestamp_millis(),
      ttl_millis,
    }
  }

  /// Wall-clock age in millis at `now_ms`.
  pub fn age_millis(&self, now_ms: i64) -> u64 {
    now_ms.saturating_sub(self.written_at).max(0) as u64
  }

  pub fn is_expired(&self, now_ms: i64) -> bool {
    self.age_millis(now_ms) > self.ttl_millis
  }
}

#[derive(Debug, thiserror::Error)]
pub enum DurableError {
  #[error("durable storage quota exceeded")]
  QuotaExceeded,
  #[error("durable storage failure: {0}")]
  Storage(String),
  #[error("durable record could not be encoded: {0}")]
  Codec(#[from] serde_json::Error),
}

impl From<rusqlite::Error> for DurableError {
  fn from(e: rusqlite::Error) -> Self {
    match e.sqlite_error_code() {
      Some(ErrorCode::DiskFull) => DurableError::QuotaExceeded,
      _ => DurableError::Storage(e.to_string()),
    }
  }
}

/// Trait for durable tier backends.
pub trait DurableTier: Send + Sync {
  /// Store or replace the record for `key`.
  fn put(&self, key: &str, record: &DurableRecord) -> Result<(), DurableError>;

  /// Read the record for `key`, expired or not.
  fn get(&self, key: &str) -> Result<Option<DurableRecord>, DurableError>;

  /// Remove the given keys.
  fn remove(&self, keys: &[&str]) -> Result<(), DurableError>;

  /// Remove every durable entry.
  fn clear(&self) -> Result<(), DurableError>;

  /// Remove every entry whose wall-clock age exceeds its stored TTL.
  /// Returns the number of rows removed.
  fn evict_expired(&self, now_ms: i64) -> Result<usize, DurableError>;

  /// All stored keys, without the prefix.
  fn keys(&self) -> Result<Vec<String>, DurableError>;
}

/// Durable tier that stores nothing.
/// Used when the durable tier is disabled - all operations are no-ops.
pub struct NoopTier;

impl DurableTier for NoopTier {
  fn put(&self, _key: &str, _record: &DurableRecord) -> Result<(), DurableError> {
    Ok(()) // Discard
  }

  fn get(&self, _key: &str) -> Result<Option<DurableRecord>, DurableError> {
    Ok(None) // Always miss
  }

  fn remove(&self, _keys: &[&str]) -> Result<(), DurableError> {
    Ok(())
  }

  fn clear(&self) -> Result<(), DurableError> {
    Ok(())
  }

  fn evict_expired(&self, _now_ms: i64) -> Result<usize, DurableError> {
    Ok(0)
  }

  fn keys(&self) -> Result<Vec<String>, DurableError> {
    Ok(Vec::new())
  }
}

/// SQLite-based durable tier.
pub struct SqliteTier {
  conn: Mutex<Connection>,
}

/// Schema for the durable tier.
const DURABLE_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS durable_cache (
    key TEXT PRIMARY KEY,
    record BLOB NOT NULL,
    written_at INTEGER NOT NULL,
    ttl_millis INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_durable_cache_expiry
    ON durable_cache(written_at, ttl_millis);
"#;

impl SqliteTier {
  /// Open the durable tier at `path`, or at the default location.
  pub fn open(path: Option<&Path>, max_pages: Option<u32>) -> Result<Self> {
    let path = match path {
      Some(p) => p.to_path_buf(),
      None => Self::default_path()?,
    };

    // Ensure parent directory exists
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)
        .map_err(|e| eyre!("Failed to create cache directory: {}", e))?;
    }

    let conn = Connection::open(&path)
      .map_err(|e| eyre!("Failed to open durable cache at {}: {}", path.display(), e))?;

    Self::with_connection(conn, max_pages)
  }

  /// In-memory tier, gone when dropped.
  pub fn open_in_memory(max_pages: Option<u32>) -> Result<Self> {
    let conn = Connection::open_in_memory()
      .map_err(|e| eyre!("Failed to open in-memory durable cache: {}", e))?;
    Self::with_connection(conn, max_pages)
  }

  fn with_connection(conn: Connection, max_pages: Option<u32>) -> Result<Self> {
    conn
      .execute_batch(DURABLE_SCHEMA)
      .map_err(|e| eyre!("Failed to run durable cache migrations: {}", e))?;

    if let Some(pages) = max_pages {
      conn
        .pragma_update_and_check(None, "max_page_count", pages, |row| row.get::<_, i64>(0))
        .map_err(|e| eyre!("Failed to set durable cache page budget: {}", e))?;
    }

    Ok(Self {
      conn: Mutex::new(conn),
    })
  }

  /// Get the default database path.
  fn default_path() -> Result<PathBuf> {
    let data_dir = dirs::data_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
      .ok_or_else(|| eyre!("Could not determine data directory"))?;

    Ok(data_dir.join("crossdash").join("durable.db"))
  }

  fn lock(&self) -> std::sync::MutexGuard<'_, Connection> {
    self.conn.lock().unwrap_or_else(|e| e.into_inner())
  }
}

fn prefixed(key: &str) -> String {
  format!("{}{}", KEY_PREFIX, key)
}

impl DurableTier for SqliteTier {
  fn put(&self, key: &str, record: &DurableRecord) -> Result<(), DurableError> {
    let data = serde_json::to_vec(record)?;
    let conn = self.lock();
    conn.execute(
      "INSERT OR REPLACE INTO durable_cache (key, record, written_at, ttl_millis)
       VALUES (?, ?, ?, ?)",
      params![prefixed(key), data, record.written_at, record.ttl_millis as i64],
    )?;
    Ok(())
  }

  fn get(&self, key: &str) -> Result<Option<DurableRecord>, DurableError> {
    let conn = self.lock();
    let data: Option<Vec<u8>> = conn
      .query_row(
        "SELECT record FROM durable_cache WHERE key = ?",
        params![prefixed(key)],
        |row| row.get(0),
      )
      .optional()?;

    match data {
      Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
      None => Ok(None),
    }
  }

  fn remove(&self, keys: &[&str]) -> Result<(), DurableError> {
    let conn = self.lock();
    let mut stmt = conn.prepare("DELETE FROM durable_cache WHERE key = ?")?;
    for key in keys {
      stmt.execute(params![prefixed(key)])?;
    }
    Ok(())
  }

  fn clear(&self) -> Result<(), DurableError> {
    let conn = self.lock();
    conn.execute(
      "DELETE FROM durable_cache WHERE key LIKE ?",
      params![format!("{}%", KEY_PREFIX)],
    )?;
    Ok(())
  }

  fn evict_expired(&self, now_ms: i64) -> Result<usize, DurableError> {
    let conn = self.lock();
    let removed = conn.execute(
      "DELETE FROM durable_cache WHERE key LIKE ? AND ? - written_at > ttl_millis",
      params![format!("{}%", KEY_PREFIX), now_ms],
    )?;
    Ok(removed)
  }

  fn keys(&self) -> Result<Vec<String>, DurableError> {
    let conn = self.lock();
    let mut stmt = conn.prepare("SELECT key FROM durable_cache WHERE key LIKE ? ORDER BY key")?;
    let keys = stmt
      .query_map(params![format!("{}%", KEY_PREFIX)], |row| row.get::<_, String>(0))?
      .filter_map(|r| r.ok())
      .filter_map(|k| k.strip_prefix(KEY_PREFIX).map(String::from))
      .collect();
    Ok(keys)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  fn tier() -> SqliteTier {
    SqliteTier::open_in_memory(None).unwrap()
  }

  #[test]
  fn test_record_layout() {
    let record = DurableRecord {
      data: json!({"n": 1}),
      written_at: 1_700_000_000_000,
      ttl_millis: 600_000,
    };
    assert_eq!(
      serde_json::to_value(&record).unwrap(),
      json!({"data": {"n": 1}, "writtenAt": 1_700_000_000_000i64, "ttlMillis": 600_000})
    );
  }

  #[test]
  fn test_put_get_remove() {
    let tier = tier();
    let record = DurableRecord::new(json!([1, 2, 3]), 600_000);
    tier.put("/api/x", &record).unwrap();

    assert_eq!(tier.get("/api/x").unwrap(), Some(record));
    assert_eq!(tier.keys().unwrap(), vec!["/api/x".to_string()]);

    tier.remove(&["/api/x"]).unwrap();
    assert_eq!(tier.get("/api/x").unwrap(), None);
  }

  #[test]
  fn test_evict_expired_only_removes_stale_rows() {
    let tier = tier();
    let now = Utc::now().timestamp_millis();
    let stale = DurableRecord {
      data: json!(1),
      written_at: now - 20_000,
      ttl_millis: 10_000,
    };
    let fresh = DurableRecord {
      data: json!(2),
      written_at: now - 5_000,
      ttl_millis: 10_000,
    };
    tier.put("stale", &stale).unwrap();
    tier.put("fresh", &fresh).unwrap();

    assert_eq!(tier.evict_expired(now).unwrap(), 1);
    assert_eq!(tier.keys().unwrap(), vec!["fresh".to_string()]);
  }

  #[test]
  fn test_clear() {
    let tier = tier();
    tier.put("a", &DurableRecord::new(json!(1), 1_000)).unwrap();
    tier.put("b", &DurableRecord::new(json!(2), 1_000)).unwrap();
    tier.clear().unwrap();
    assert!(tier.keys().unwrap().is_empty());
  }

  #[test]
  fn test_page_budget_reports_quota_exceeded() {
    let tier = SqliteTier::open_in_memory(Some(8)).unwrap();
    let big = DurableRecord::new(json!("x".repeat(256 * 1024)), 600_000);

    let err = tier.put("big", &big).unwrap_err();
    assert!(matches!(err, DurableError::QuotaExceeded), "got {:?}", err);
  }

  #[test]
  fn test_record_expiry() {
    let record = DurableRecord {
      data: Value::Null,
      written_at: 1_000,
      ttl_millis: 500,
    };
    assert!(!record.is_expired(1_400));
    assert!(record.is_expired(1_600));
    assert_eq!(record.age_millis(500), 0);
  }
}
