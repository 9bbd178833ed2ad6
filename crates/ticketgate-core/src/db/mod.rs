//! `SQLite` persistence shared by every ticketgate store.
//!
//! A [`Database`] owns one connection behind a mutex. Each store
//! (`SqliteTicketStore`, `SqliteAccountLedger`, ...) clones the connection
//! handle, so all stores opened from the same `Database` share a connection
//! and all `Database`s opened on the same file share the file's locking.
//!
//! Correctness never depends on the in-process mutex. Every state change that
//! decides a race is a single conditional statement (or an `IMMEDIATE`
//! transaction), so two processes opening the same file get the same
//! guarantees as two threads sharing one `Database`.
//!
//! WAL mode is enabled for file-backed databases so readers do not block the
//! writer, and a busy timeout lets concurrent writers queue instead of
//! failing with `SQLITE_BUSY`.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use rusqlite::types::Type;
use rusqlite::{Connection, OpenFlags, Row};
use thiserror::Error;

/// Schema SQL embedded at compile time.
const SCHEMA_SQL: &str = include_str!("schema.sql");

/// Default time a writer waits for a competing writer before giving up.
pub const DEFAULT_BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Errors raised by the storage layer.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum StoreError {
    /// Database error from `SQLite`.
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// The connection mutex was poisoned by a panic on another thread.
    #[error("connection lock poisoned")]
    LockPoisoned,

    /// A persisted row violates an invariant the schema cannot express.
    #[error("corrupt {table} row {id}: {details}")]
    CorruptRow {
        /// Table the row belongs to.
        table: &'static str,
        /// Primary key of the row.
        id: String,
        /// What is wrong with it.
        details: String,
    },
}

impl StoreError {
    /// Returns `true` for failures worth one more attempt (lock contention,
    /// a busy database file).
    #[must_use]
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Database(rusqlite::Error::SqliteFailure(err, _)) => matches!(
                err.code,
                rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked
            ),
            Self::LockPoisoned | Self::CorruptRow { .. } | Self::Database(_) => false,
        }
    }
}

/// Shared handle to a ticketgate database.
#[derive(Debug, Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
    path: Option<PathBuf>,
}

impl Database {
    /// Opens or creates a database file and applies the schema.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be opened or initialized.
    pub fn open(path: impl AsRef<Path>, busy_timeout: Duration) -> Result<Self, StoreError> {
        let path = path.as_ref();
        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_WRITE
                | OpenFlags::SQLITE_OPEN_CREATE
                | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;
        conn.busy_timeout(busy_timeout)?;
        let mode: String =
            conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
        tracing::debug!(path = %path.display(), journal_mode = %mode, "opened ticket database");
        conn.pragma_update(None, "synchronous", "NORMAL")?;

        Self::initialize_connection(&conn)?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            path: Some(path.to_path_buf()),
        })
    }

    /// Creates an in-memory database for testing.
    ///
    /// # Errors
    ///
    /// Returns an error if the schema cannot be applied.
    pub fn in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        Self::initialize_connection(&conn)?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            path: None,
        })
    }

    fn initialize_connection(conn: &Connection) -> Result<(), StoreError> {
        conn.pragma_update(None, "foreign_keys", "ON")?;
        conn.execute_batch(SCHEMA_SQL)?;
        Ok(())
    }

    /// Returns a handle to the shared connection.
    #[must_use]
    pub fn connection(&self) -> Arc<Mutex<Connection>> {
        Arc::clone(&self.conn)
    }

    /// Path of the backing file, or `None` for in-memory databases.
    #[must_use]
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Verifies that WAL mode is enabled.
    ///
    /// # Errors
    ///
    /// Returns an error if the journal mode cannot be queried.
    pub fn verify_wal_mode(&self) -> Result<bool, StoreError> {
        let conn = lock(&self.conn)?;
        let mode: String = conn.query_row("PRAGMA journal_mode", [], |row| row.get(0))?;
        Ok(mode.eq_ignore_ascii_case("wal"))
    }
}

/// Locks the shared connection, mapping poisoning to [`StoreError`].
pub(crate) fn lock(conn: &Mutex<Connection>) -> Result<MutexGuard<'_, Connection>, StoreError> {
    conn.lock().map_err(|_| StoreError::LockPoisoned)
}

/// Converts a timestamp to its persisted form.
pub(crate) fn to_millis(instant: DateTime<Utc>) -> i64 {
    instant.timestamp_millis()
}

/// Reads a non-null millisecond timestamp column.
pub(crate) fn millis_at(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let millis: i64 = row.get(idx)?;
    crate::clock::from_millis(millis).ok_or_else(|| out_of_range(idx, millis))
}

/// Reads a nullable millisecond timestamp column.
pub(crate) fn opt_millis_at(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<DateTime<Utc>>> {
    row.get::<_, Option<i64>>(idx)?
        .map(|millis| crate::clock::from_millis(millis).ok_or_else(|| out_of_range(idx, millis)))
        .transpose()
}

/// Reads a non-negative counter column.
pub(crate) fn count_at(row: &Row<'_>, idx: usize) -> rusqlite::Result<u64> {
    let value: i64 = row.get(idx)?;
    u64::try_from(value).map_err(|_| rusqlite::Error::IntegralValueOutOfRange(idx, value))
}

/// Converts a counter to its persisted form, saturating at `i64::MAX`.
pub(crate) fn to_sql_count(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

fn out_of_range(idx: usize, millis: i64) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        idx,
        Type::Integer,
        format!("timestamp {millis}ms out of range").into(),
    )
}
