//! SQLite implementation of the offline store.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use url::Url;

use super::traits::{CachedEntry, OfflineStore, QueuedMutation};
use crate::error::StorageError;
use crate::transport::{Credentials, FormFields};

/// SQLite-backed store. One connection, serialized by a mutex.
pub struct SqliteStore {
  conn: Mutex<Connection>,
}

impl SqliteStore {
  /// Open (creating if needed) the database at `path`.
  pub fn open(path: &Path) -> color_eyre::Result<Self> {
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent).map_err(|e| {
        color_eyre::eyre::eyre!("Failed to create database directory: {}", e)
      })?;
    }

    let conn = Connection::open(path).map_err(|e| {
      color_eyre::eyre::eyre!("Failed to open offline store at {}: {}", path.display(), e)
    })?;

    Ok(Self::with_connection(conn)?)
  }

  pub fn open_in_memory() -> Result<Self, StorageError> {
    Self::with_connection(Connection::open_in_memory()?)
  }

  fn with_connection(conn: Connection) -> Result<Self, StorageError> {
    conn.execute_batch(SCHEMA)?;
    add_credentials_column(&conn)?;
    Ok(Self {
      conn: Mutex::new(conn),
    })
  }

  fn lock(&self) -> Result<MutexGuard<'_, Connection>, StorageError> {
    self.conn.lock().map_err(|_| StorageError::Poisoned)
  }
}

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS cached_responses (
    url TEXT PRIMARY KEY,
    payload TEXT NOT NULL,
    content_type TEXT,
    cached_at TEXT NOT NULL
);

-- AUTOINCREMENT so deleted ids are never handed out again
CREATE TABLE IF NOT EXISTS delayed_requests (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    url TEXT NOT NULL,
    form TEXT NOT NULL,
    queued_at TEXT NOT NULL,
    credentials TEXT NOT NULL DEFAULT '[]'
);
"#;

/// Databases created before credentials were queued lack the column.
fn add_credentials_column(conn: &Connection) -> Result<(), StorageError> {
  let present: bool = conn.query_row(
    "SELECT COUNT(*) > 0 FROM pragma_table_info('delayed_requests') WHERE name = 'credentials'",
    [],
    |row| row.get(0),
  )?;
  if !present {
    conn.execute_batch(
      "ALTER TABLE delayed_requests ADD COLUMN credentials TEXT NOT NULL DEFAULT '[]'",
    )?;
  }
  Ok(())
}

const UPSERT_RESPONSE: &str = "INSERT OR REPLACE INTO cached_responses (url, payload, content_type, cached_at)
   VALUES (?, ?, ?, ?)";

impl OfflineStore for SqliteStore {
  fn put_response(&self, entry: &CachedEntry) -> Result<(), StorageError> {
    let conn = self.lock()?;
    conn.execute(
      UPSERT_RESPONSE,
      params![
        entry.url,
        entry.payload,
        entry.content_type,
        entry.cached_at.to_rfc3339()
      ],
    )?;
    Ok(())
  }

  fn put_responses(&self, entries: &[CachedEntry]) -> Result<(), StorageError> {
    let mut conn = self.lock()?;
    let tx = conn.transaction()?;
    {
      let mut stmt = tx.prepare(UPSERT_RESPONSE)?;
      for entry in entries {
        stmt.execute(params![
          entry.url,
          entry.payload,
          entry.content_type,
          entry.cached_at.to_rfc3339()
        ])?;
      }
    }
    tx.commit()?;
    Ok(())
  }

  fn get_response(&self, url: &str) -> Result<Option<CachedEntry>, StorageError> {
    let conn = self.lock()?;
    let row: Option<(String, String, Option<String>, String)> = conn
      .query_row(
        "SELECT url, payload, content_type, cached_at FROM cached_responses WHERE url = ?",
        params![url],
        |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
      )
      .optional()?;

    row
      .map(|(url, payload, content_type, cached_at)| {
        Ok(CachedEntry {
          url,
          payload,
          content_type,
          cached_at: parse_datetime(&cached_at)?,
        })
      })
      .transpose()
  }

  fn all_responses(&self) -> Result<Vec<CachedEntry>, StorageError> {
    let conn = self.lock()?;
    let mut stmt = conn
      .prepare("SELECT url, payload, content_type, cached_at FROM cached_responses ORDER BY url")?;

    let rows = stmt
      .query_map([], |row| {
        Ok((
          row.get::<_, String>(0)?,
          row.get::<_, String>(1)?,
          row.get::<_, Option<String>>(2)?,
          row.get::<_, String>(3)?,
        ))
      })?
      .collect::<Result<Vec<_>, _>>()?;

    rows
      .into_iter()
      .map(|(url, payload, content_type, cached_at)| {
        Ok(CachedEntry {
          url,
          payload,
          content_type,
          cached_at: parse_datetime(&cached_at)?,
        })
      })
      .collect()
  }

  fn delete_response(&self, url: &str) -> Result<(), StorageError> {
    let conn = self.lock()?;
    conn.execute("DELETE FROM cached_responses WHERE url = ?", params![url])?;
    Ok(())
  }

  fn enqueue(
    &self,
    url: &Url,
    form: &FormFields,
    credentials: &Credentials,
  ) -> Result<i64, StorageError> {
    let form = serde_json::to_string(form)?;
    let credentials = serde_json::to_string(credentials)?;
    let conn = self.lock()?;
    conn.execute(
      "INSERT INTO delayed_requests (url, form, queued_at, credentials) VALUES (?, ?, ?, ?)",
      params![url.as_str(), form, Utc::now().to_rfc3339(), credentials],
    )?;
    Ok(conn.last_insert_rowid())
  }

  fn queued(&self) -> Result<Vec<QueuedMutation>, StorageError> {
    let conn = self.lock()?;
    let mut stmt = conn.prepare(
      "SELECT id, url, form, queued_at, credentials FROM delayed_requests ORDER BY id",
    )?;

    let rows = stmt
      .query_map([], |row| {
        Ok((
          row.get::<_, i64>(0)?,
          row.get::<_, String>(1)?,
          row.get::<_, String>(2)?,
          row.get::<_, String>(3)?,
          row.get::<_, String>(4)?,
        ))
      })?
      .collect::<Result<Vec<_>, _>>()?;

    rows
      .into_iter()
      .map(|(id, url, form, queued_at, credentials)| {
        Ok(QueuedMutation {
          id,
          url: Url::parse(&url)
            .map_err(|e| StorageError::Corrupt(format!("queued url '{}': {}", url, e)))?,
          form: serde_json::from_str(&form)?,
          credentials: serde_json::from_str(&credentials)?,
          queued_at: parse_datetime(&queued_at)?,
        })
      })
      .collect()
  }

  fn dequeue(&self, id: i64) -> Result<(), StorageError> {
    let conn = self.lock()?;
    conn.execute("DELETE FROM delayed_requests WHERE id = ?", params![id])?;
    Ok(())
  }

  fn queue_len(&self) -> Result<usize, StorageError> {
    let conn = self.lock()?;
    let count: i64 = conn.query_row("SELECT COUNT(*) FROM delayed_requests", [], |row| row.get(0))?;
    Ok(count as usize)
  }
}

fn parse_datetime(s: &str) -> Result<DateTime<Utc>, StorageError> {
  DateTime::parse_from_rfc3339(s)
    .map(|dt| dt.with_timezone(&Utc))
    .map_err(|e| StorageError::Corrupt(format!("timestamp '{}': {}", s, e)))
}
