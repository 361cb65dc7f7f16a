//! Cache storage trait and SQLite implementation.

use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, OptionalExtension};
use std::sync::Arc;

use super::traits::{CachedEntry, Response};
use crate::db::Database;

/// Trait for cache storage backends.
///
/// Storage is organised in namespaces; each namespace maps request keys to responses.
pub trait CacheStorage: Send + Sync + 'static {
  /// Create the namespace if it does not exist yet.
  fn open_namespace(&self, namespace: &str) -> Result<()>;

  /// All namespace names, oldest first.
  fn namespaces(&self) -> Result<Vec<String>>;

  /// Delete a namespace and its entries. Returns false if it did not exist.
  fn delete_namespace(&self, namespace: &str) -> Result<bool>;

  /// Get the entry stored under `key`.
  fn get_entry(&self, namespace: &str, key: &str) -> Result<Option<CachedEntry>>;

  /// Store or overwrite a single entry, opening the namespace if needed.
  fn put_entry(&self, namespace: &str, key: &str, response: &Response) -> Result<()>;

  /// Store a batch of entries atomically: either all are written or none are.
  fn put_entries(&self, namespace: &str, entries: &[(String, Response)]) -> Result<()>;

  /// Request keys stored in a namespace, sorted.
  fn keys(&self, namespace: &str) -> Result<Vec<String>>;
}

/// SQLite-based cache storage implementation.
pub struct SqliteStorage {
  db: Arc<Database>,
}

impl SqliteStorage {
  pub fn new(db: Arc<Database>) -> Self {
    Self { db }
  }
}

impl CacheStorage for SqliteStorage {
  fn open_namespace(&self, namespace: &str) -> Result<()> {
    let conn = self.db.lock()?;

    conn
      .execute(
        "INSERT OR IGNORE INTO cache_namespaces (name) VALUES (?)",
        params![namespace],
      )
      .map_err(|e| eyre!("Failed to open cache namespace {}: {}", namespace, e))?;

    Ok(())
  }

  fn namespaces(&self) -> Result<Vec<String>> {
    let conn = self.db.lock()?;

    let mut stmt = conn
      .prepare("SELECT name FROM cache_namespaces ORDER BY created_at, rowid")
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

    let names = stmt
      .query_map([], |row| row.get(0))
      .map_err(|e| eyre!("Failed to list cache namespaces: {}", e))?
      .collect::<rusqlite::Result<Vec<String>>>()
      .map_err(|e| eyre!("Failed to read cache namespace: {}", e))?;

    Ok(names)
  }

  fn delete_namespace(&self, namespace: &str) -> Result<bool> {
    let conn = self.db.lock()?;

    let removed = conn
      .execute(
        "DELETE FROM cache_namespaces WHERE name = ?",
        params![namespace],
      )
      .map_err(|e| eyre!("Failed to delete cache namespace {}: {}", namespace, e))?;

    Ok(removed > 0)
  }

  fn get_entry(&self, namespace: &str, key: &str) -> Result<Option<CachedEntry>> {
    let conn = self.db.lock()?;

    let row: Option<(u16, String, Vec<u8>, String)> = conn
      .query_row(
        "SELECT status, headers, body, cached_at FROM cache_entries
         WHERE namespace = ? AND request_key = ?",
        params![namespace, key],
        |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
      )
      .optional()
      .map_err(|e| eyre!("Failed to read cache entry {}: {}", key, e))?;

    match row {
      Some((status, headers, body, cached_at_str)) => {
        let headers = serde_json::from_str(&headers)
          .map_err(|e| eyre!("Failed to deserialize cached headers: {}", e))?;
        let cached_at = parse_datetime(&cached_at_str)?;
        Ok(Some(CachedEntry {
          response: Response {
            status,
            headers,
            body,
          },
          cached_at,
        }))
      }
      None => Ok(None),
    }
  }

  fn put_entry(&self, namespace: &str, key: &str, response: &Response) -> Result<()> {
    let mut conn = self.db.lock()?;
    let tx = conn
      .transaction()
      .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;

    insert_entry(&tx, namespace, key, response)?;

    tx.commit()
      .map_err(|e| eyre!("Failed to commit transaction: {}", e))?;

    Ok(())
  }

  fn put_entries(&self, namespace: &str, entries: &[(String, Response)]) -> Result<()> {
    let mut conn = self.db.lock()?;
    let tx = conn
      .transaction()
      .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;

    for (key, response) in entries {
      insert_entry(&tx, namespace, key, response)?;
    }

    tx.commit()
      .map_err(|e| eyre!("Failed to commit transaction: {}", e))?;

    Ok(())
  }

  fn keys(&self, namespace: &str) -> Result<Vec<String>> {
    let conn = self.db.lock()?;

    let mut stmt = conn
      .prepare("SELECT request_key FROM cache_entries WHERE namespace = ? ORDER BY request_key")
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

    let keys = stmt
      .query_map(params![namespace], |row| row.get(0))
      .map_err(|e| eyre!("Failed to list cache keys: {}", e))?
      .collect::<rusqlite::Result<Vec<String>>>()
      .map_err(|e| eyre!("Failed to read cache key: {}", e))?;

    Ok(keys)
  }
}

fn insert_entry(
  conn: &rusqlite::Connection,
  namespace: &str,
  key: &str,
  response: &Response,
) -> Result<()> {
  let headers = serde_json::to_string(&response.headers)
    .map_err(|e| eyre!("Failed to serialize headers: {}", e))?;

  conn
    .execute(
      "INSERT OR IGNORE INTO cache_namespaces (name) VALUES (?)",
      params![namespace],
    )
    .map_err(|e| eyre!("Failed to open cache namespace {}: {}", namespace, e))?;

  conn
    .execute(
      "INSERT OR REPLACE INTO cache_entries (namespace, request_key, status, headers, body, cached_at)
       VALUES (?, ?, ?, ?, ?, datetime('now'))",
      params![namespace, key, response.status, headers, response.body],
    )
    .map_err(|e| eyre!("Failed to store cache entry {}: {}", key, e))?;

  Ok(())
}

/// Parse a datetime string from SQLite format.
fn parse_datetime(s: &str) -> Result<DateTime<Utc>> {
  // SQLite stores as "YYYY-MM-DD HH:MM:SS"
  chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S")
    .map(|dt| dt.and_utc())
    .map_err(|e| eyre!("Failed to parse datetime '{}': {}", s, e))
}
