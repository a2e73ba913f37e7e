//! Metadata and quota store
//!
//! Users, their file lists and their quotas live in an embedded SQLite
//! database (`stash.db` in the storage root). Every mutating operation runs
//! inside a transaction, and a user's `quota_used` is recomputed as
//! `SUM(size)` over their files inside that same transaction rather than
//! bumped by a delta, so the total stays equal to the sum of recorded file
//! sizes after every commit even with several workers touching the same
//! user.

use std::path::Path;

use log::{info, warn};
use parking_lot::Mutex;
use rusqlite::{params, Connection, ErrorCode, OptionalExtension};
use thiserror::Error;

/// Default per-user quota, 100 MiB.
pub const DEFAULT_QUOTA_LIMIT: u64 = 100 * 1024 * 1024;

const SCHEMA_SQL: &str = "
CREATE TABLE IF NOT EXISTS users (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  username TEXT UNIQUE NOT NULL,
  password_hash TEXT NOT NULL,
  quota_used INTEGER DEFAULT 0,
  quota_limit INTEGER DEFAULT 104857600,
  created_at INTEGER DEFAULT (strftime('%s', 'now'))
);

CREATE TABLE IF NOT EXISTS files (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  user_id INTEGER NOT NULL,
  filename TEXT NOT NULL,
  size INTEGER NOT NULL,
  timestamp INTEGER DEFAULT (strftime('%s', 'now')),
  FOREIGN KEY (user_id) REFERENCES users(id) ON DELETE CASCADE,
  UNIQUE(user_id, filename)
);

CREATE INDEX IF NOT EXISTS idx_users_username ON users(username);
CREATE INDEX IF NOT EXISTS idx_files_user_id ON files(user_id);
CREATE INDEX IF NOT EXISTS idx_files_composite ON files(user_id, filename);
";

const RECOMPUTE_QUOTA_SQL: &str = "
UPDATE users SET quota_used =
  (SELECT COALESCE(SUM(size), 0) FROM files WHERE user_id = ?1)
WHERE id = ?1";

/// Store failures the callers distinguish.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The named user or file does not exist.
    #[error("not found")]
    NotFound,
    /// A user with that name already exists.
    #[error("already exists")]
    AlreadyExists,
    /// Anything the database itself reports.
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),
}

fn no_rows_as_not_found(err: rusqlite::Error) -> StoreError {
    match err {
        rusqlite::Error::QueryReturnedNoRows => StoreError::NotFound,
        other => StoreError::Database(other),
    }
}

/// A user's byte budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Quota {
    pub used: u64,
    pub limit: u64,
}

/// Thread-safe handle to the metadata database.
///
/// The connection is guarded by a mutex; transactions are the only
/// consistency primitive callers rely on.
pub struct MetaStore {
    conn: Mutex<Connection>,
}

impl MetaStore {
    /// Open (creating if absent) the database at `path` and ensure the
    /// schema exists. Write-ahead journaling is enabled best-effort.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        let conn = Connection::open(path)?;
        match conn.query_row("PRAGMA journal_mode=WAL", [], |row| row.get::<_, String>(0)) {
            Ok(mode) => info!("metadata store journal mode: {}", mode),
            Err(err) => warn!("could not enable WAL journaling: {}", err),
        }
        conn.execute_batch(SCHEMA_SQL)?;
        info!("metadata store ready at {}", path.display());
        Ok(MetaStore {
            conn: Mutex::new(conn),
        })
    }

    /// In-memory store for tests.
    #[cfg(test)]
    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA_SQL)?;
        Ok(MetaStore {
            conn: Mutex::new(conn),
        })
    }

    /// Insert a new user with the default quota.
    pub fn create_user(&self, username: &str, password_hash: &str) -> Result<(), StoreError> {
        let conn = self.conn.lock();
        let result = conn.execute(
            "INSERT INTO users (username, password_hash) VALUES (?1, ?2)",
            params![username, password_hash],
        );
        match result {
            Ok(_) => Ok(()),
            Err(rusqlite::Error::SqliteFailure(err, _))
                if err.code == ErrorCode::ConstraintViolation =>
            {
                Err(StoreError::AlreadyExists)
            }
            Err(other) => Err(StoreError::Database(other)),
        }
    }

    /// True if a user with this name exists.
    pub fn user_exists(&self, username: &str) -> Result<bool, StoreError> {
        let conn = self.conn.lock();
        let row: Option<i64> = conn
            .query_row(
                "SELECT 1 FROM users WHERE username = ?1 LIMIT 1",
                params![username],
                |row| row.get(0),
            )
            .optional()?;
        Ok(row.is_some())
    }

    /// The stored password digest for a user.
    pub fn password_hash(&self, username: &str) -> Result<String, StoreError> {
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT password_hash FROM users WHERE username = ?1",
            params![username],
            |row| row.get(0),
        )
        .map_err(no_rows_as_not_found)
    }

    /// Current usage and limit for a user.
    pub fn get_quota(&self, username: &str) -> Result<Quota, StoreError> {
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT quota_used, quota_limit FROM users WHERE username = ?1",
            params![username],
            |row| {
                Ok(Quota {
                    used: row.get::<_, i64>(0)? as u64,
                    limit: row.get::<_, i64>(1)? as u64,
                })
            },
        )
        .map_err(no_rows_as_not_found)
    }

    /// Would `extra` more bytes still fit in the user's budget?
    pub fn check_quota(&self, username: &str, extra: u64) -> Result<bool, StoreError> {
        let quota = self.get_quota(username)?;
        Ok(quota.used.saturating_add(extra) <= quota.limit)
    }

    /// Change a user's quota limit.
    pub fn set_quota_limit(&self, username: &str, limit: u64) -> Result<(), StoreError> {
        let conn = self.conn.lock();
        let changed = conn.execute(
            "UPDATE users SET quota_limit = ?2 WHERE username = ?1",
            params![username, limit as i64],
        )?;
        if changed == 0 {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }

    /// Insert or replace a file record and recompute the owner's quota, all
    /// in one transaction.
    pub fn upsert_file(&self, username: &str, filename: &str, size: u64) -> Result<(), StoreError> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let user_id: i64 = tx
            .query_row(
                "SELECT id FROM users WHERE username = ?1",
                params![username],
                |row| row.get(0),
            )
            .map_err(no_rows_as_not_found)?;
        tx.execute(
            "INSERT INTO files (user_id, filename, size, timestamp)
             VALUES (?1, ?2, ?3, strftime('%s', 'now'))
             ON CONFLICT(user_id, filename) DO UPDATE SET
               size = excluded.size, timestamp = excluded.timestamp",
            params![user_id, filename, size as i64],
        )?;
        tx.execute(RECOMPUTE_QUOTA_SQL, params![user_id])?;
        tx.commit()?;
        Ok(())
    }

    /// Delete a file record and recompute the owner's quota, all in one
    /// transaction. `NotFound` if the record does not exist (the transaction
    /// rolls back).
    pub fn remove_file(&self, username: &str, filename: &str) -> Result<(), StoreError> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let user_id: i64 = tx
            .query_row(
                "SELECT id FROM users WHERE username = ?1",
                params![username],
                |row| row.get(0),
            )
            .map_err(no_rows_as_not_found)?;
        let removed = tx.execute(
            "DELETE FROM files WHERE user_id = ?1 AND filename = ?2",
            params![user_id, filename],
        )?;
        if removed == 0 {
            return Err(StoreError::NotFound);
        }
        tx.execute(RECOMPUTE_QUOTA_SQL, params![user_id])?;
        tx.commit()?;
        Ok(())
    }

    /// The recorded size of a user's file.
    pub fn file_size(&self, username: &str, filename: &str) -> Result<u64, StoreError> {
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT f.size FROM files f
             JOIN users u ON f.user_id = u.id
             WHERE u.username = ?1 AND f.filename = ?2",
            params![username, filename],
            |row| row.get::<_, i64>(0).map(|v| v as u64),
        )
        .map_err(no_rows_as_not_found)
    }
}
