//! Key-value storage trait and SQLite implementation.

use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, OptionalExtension};
use std::sync::Arc;

use crate::db::Database;

/// Trait for the local key-value layer the action queue persists into.
///
/// Each `set` must replace the value as a whole: a reader never observes a
/// partially written value.
pub trait KeyValueStore: Send + Sync {
  fn get(&self, key: &str) -> Result<Option<String>>;

  fn set(&self, key: &str, value: &str) -> Result<()>;
}

/// SQLite-backed key-value storage.
pub struct SqliteKeyValue {
  db: Arc<Database>,
}

impl SqliteKeyValue {
  pub fn new(db: Arc<Database>) -> Self {
    Self { db }
  }
}

impl KeyValueStore for SqliteKeyValue {
  fn get(&self, key: &str) -> Result<Option<String>> {
    let conn = self.db.lock()?;

    conn
      .query_row(
        "SELECT value FROM kv_store WHERE key = ?",
        params![key],
        |row| row.get(0),
      )
      .optional()
      .map_err(|e| eyre!("Failed to read {}: {}", key, e))
  }

  fn set(&self, key: &str, value: &str) -> Result<()> {
    let conn = self.db.lock()?;

    // Single statement, so SQLite applies it atomically
    conn
      .execute(
        "INSERT OR REPLACE INTO kv_store (key, value) VALUES (?, ?)",
        params![key, value],
      )
      .map_err(|e| eyre!("Failed to write {}: {}", key, e))?;

    Ok(())
  }
}
