//! Validation log and daily aggregation.
//!
//! Every redemption attempt, whatever its result, is appended here. The log
//! is append-only (enforced by triggers in the schema) and ordered by a
//! monotonically increasing `seq_id`, so per-context counts taken over a time
//! window reflect insertion order.
//!
//! # Operating day
//!
//! The operator's per-shift counters cover the current *operating day* of the
//! redeeming context: from local midnight at the context's registered UTC
//! offset up to now. See [`day_start`].

use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, FixedOffset, NaiveTime, TimeZone, Utc};
use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, ValueRef};
use rusqlite::{Connection, Row, params};
use serde::{Deserialize, Serialize};

use crate::db::{self, Database, StoreError};
use crate::geo::GeoPoint;

/// Outcome recorded for a redemption attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValidationResult {
    /// The ticket was redeemed.
    Valid,
    /// The ticket had already been redeemed.
    Fraud,
    /// A transfer token was presented after its window closed.
    ExpiredTransfer,
    /// The token did not resolve to any ticket.
    Invalid,
    /// The ticket exists but cannot be redeemed in its current state.
    Inactive,
}

impl ValidationResult {
    /// Returns the persisted string form.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Valid => "valid",
            Self::Fraud => "fraud",
            Self::ExpiredTransfer => "expired_transfer",
            Self::Invalid => "invalid",
            Self::Inactive => "inactive",
        }
    }
}

impl fmt::Display for ValidationResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ValidationResult {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "valid" => Ok(Self::Valid),
            "fraud" => Ok(Self::Fraud),
            "expired_transfer" => Ok(Self::ExpiredTransfer),
            "invalid" => Ok(Self::Invalid),
            "inactive" => Ok(Self::Inactive),
            _ => Err(format!("invalid validation result: {s}")),
        }
    }
}

impl ToSql for ValidationResult {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.as_str()))
    }
}

impl FromSql for ValidationResult {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        value
            .as_str()?
            .parse()
            .map_err(|e: String| FromSqlError::Other(e.into()))
    }
}

/// One redemption attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationEntry {
    /// Position in the log, assigned on append.
    pub seq_id: Option<u64>,
    /// Resolved ticket, if the token matched one.
    pub ticket_id: Option<String>,
    /// The token exactly as presented.
    pub presented_token: String,
    /// Outcome of the attempt.
    pub result: ValidationResult,
    /// Redeeming context.
    pub context_id: String,
    /// Route reported by the context.
    pub route_id: Option<String>,
    /// Where the attempt happened.
    pub location: Option<GeoPoint>,
    /// When the attempt was processed.
    pub recorded_at: DateTime<Utc>,
}

/// Per-context counters for the current operating day.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DailyCounters {
    /// Start of the operating day (local midnight, in UTC).
    pub since: DateTime<Utc>,
    /// Valid redemptions since `since`.
    pub count: u64,
    /// `count * fare`, in minor currency units.
    pub total: u64,
}

/// Append-only log of redemption attempts.
pub trait ValidationLog: Send + Sync {
    /// Appends an entry and returns its sequence id.
    ///
    /// # Errors
    ///
    /// Returns an error if the entry cannot be persisted.
    fn append(&self, entry: &ValidationEntry) -> Result<u64, StoreError>;

    /// Counts `valid` entries for `context_id` recorded at or after `since`.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    fn count_valid_since(&self, context_id: &str, since: DateTime<Utc>) -> Result<u64, StoreError>;

    /// Returns every entry that resolved to `ticket_id`, in log order.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    fn entries_for_ticket(&self, ticket_id: &str) -> Result<Vec<ValidationEntry>, StoreError>;
}

/// Start of the operating day containing `now`, for a context whose
/// operating timezone is `offset`.
#[must_use]
pub fn day_start(now: DateTime<Utc>, offset: FixedOffset) -> DateTime<Utc> {
    let local_midnight = now
        .with_timezone(&offset)
        .date_naive()
        .and_time(NaiveTime::MIN);

    offset
        .from_local_datetime(&local_midnight)
        .single()
        .map_or(now, |start| start.with_timezone(&Utc))
}

/// Computes the operating-day counters for a context.
///
/// # Errors
///
/// Returns an error if the log cannot be queried.
pub fn daily_counters(
    log: &dyn ValidationLog,
    context_id: &str,
    now: DateTime<Utc>,
    offset: FixedOffset,
    fare_amount: u64,
) -> Result<DailyCounters, StoreError> {
    let since = day_start(now, offset);
    let count = log.count_valid_since(context_id, since)?;

    Ok(DailyCounters {
        since,
        count,
        total: count.saturating_mul(fare_amount),
    })
}

/// `SQLite`-backed [`ValidationLog`].
#[derive(Debug, Clone)]
pub struct SqliteValidationLog {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteValidationLog {
    /// Creates a log over the given connection.
    #[must_use]
    pub const fn new(conn: Arc<Mutex<Connection>>) -> Self {
        Self { conn }
    }

    /// Creates a log sharing `db`'s connection.
    #[must_use]
    pub fn from_database(db: &Database) -> Self {
        Self::new(db.connection())
    }
}

impl ValidationLog for SqliteValidationLog {
    fn append(&self, entry: &ValidationEntry) -> Result<u64, StoreError> {
        let conn = db::lock(&self.conn)?;
        insert_entry(&conn, entry)
    }

    fn count_valid_since(&self, context_id: &str, since: DateTime<Utc>) -> Result<u64, StoreError> {
        let conn = db::lock(&self.conn)?;

        let count = conn.query_row(
            "SELECT COUNT(*) FROM validation_log
             WHERE context_id = ?1 AND result = ?2 AND recorded_at_ms >= ?3",
            params![context_id, ValidationResult::Valid, db::to_millis(since)],
            |row| db::count_at(row, 0),
        )?;

        Ok(count)
    }

    fn entries_for_ticket(&self, ticket_id: &str) -> Result<Vec<ValidationEntry>, StoreError> {
        let conn = db::lock(&self.conn)?;

        let mut stmt = conn.prepare(
            "SELECT seq_id, ticket_id, presented_token, result, context_id, route_id,
                    latitude, longitude, recorded_at_ms
             FROM validation_log
             WHERE ticket_id = ?1
             ORDER BY seq_id ASC",
        )?;

        let entries = stmt
            .query_map(params![ticket_id], entry_from_row)?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(entries)
    }
}

/// Inserts a log row on `conn`, which may be an open transaction owned by
/// another store.
pub(crate) fn insert_entry(conn: &Connection, entry: &ValidationEntry) -> Result<u64, StoreError> {
    let (lat, lon) = entry
        .location
        .map_or((None, None), |p| (Some(p.lat), Some(p.lon)));

    conn.execute(
        "INSERT INTO validation_log
             (ticket_id, presented_token, result, context_id, route_id, latitude, longitude, recorded_at_ms)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        params![
            entry.ticket_id,
            entry.presented_token,
            entry.result,
            entry.context_id,
            entry.route_id,
            lat,
            lon,
            db::to_millis(entry.recorded_at),
        ],
    )?;

    // Row ids are positive, so the conversion cannot fail.
    Ok(u64::try_from(conn.last_insert_rowid()).unwrap_or_default())
}

fn entry_from_row(row: &Row<'_>) -> rusqlite::Result<ValidationEntry> {
    Ok(ValidationEntry {
        seq_id: Some(db::count_at(row, 0)?),
        ticket_id: row.get(1)?,
        presented_token: row.get(2)?,
        result: row.get(3)?,
        context_id: row.get(4)?,
        route_id: row.get(5)?,
        location: GeoPoint::from_parts(row.get(6)?, row.get(7)?),
        recorded_at: db::millis_at(row, 8)?,
    })
}
