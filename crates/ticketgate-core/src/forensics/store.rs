//! Append-only persistence of fraud attempts.

use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, ValueRef};
use rusqlite::{Connection, Row, TransactionBehavior, params};
use serde::{Deserialize, Serialize};

use super::severity::{Severity, SeverityPolicy};
use crate::db::{self, Database, StoreError};
use crate::geo::GeoPoint;
use crate::ticket::RedemptionEvidence;
use crate::validation::{self, ValidationEntry, ValidationResult};

const FRAUD_COLUMNS: &str = "id, ticket_id, holder_id,
     original_context_id, original_route_id, original_latitude, original_longitude, original_used_at_ms,
     detected_context_id, detected_route_id, detected_latitude, detected_longitude, detected_at_ms,
     fraud_type, severity, distance_km, minutes_elapsed, ticket_attempts, holder_attempts";

/// Whether the repeat attempt came from the unit that first redeemed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FraudType {
    /// Same context as the original redemption (e.g. a double tap).
    SameContext,
    /// A different context (e.g. a shared or copied ticket).
    DifferentContext,
}

impl FraudType {
    /// Classifies an attempt by comparing context ids.
    #[must_use]
    pub fn between(original_context: &str, detected_context: &str) -> Self {
        if original_context == detected_context {
            Self::SameContext
        } else {
            Self::DifferentContext
        }
    }

    /// Returns the persisted string form.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::SameContext => "same_context",
            Self::DifferentContext => "different_context",
        }
    }
}

impl fmt::Display for FraudType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FraudType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "same_context" => Ok(Self::SameContext),
            "different_context" => Ok(Self::DifferentContext),
            _ => Err(format!("invalid fraud type: {s}")),
        }
    }
}

impl ToSql for FraudType {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.as_str()))
    }
}

impl FromSql for FraudType {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        value
            .as_str()?
            .parse()
            .map_err(|e: String| FromSqlError::Other(e.into()))
    }
}

/// A fraud attempt before the running totals are known.
#[derive(Debug, Clone, PartialEq)]
pub struct FraudDraft {
    /// Ticket presented again.
    pub ticket_id: String,
    /// Holder of that ticket.
    pub holder_id: String,
    /// The token exactly as presented on the repeat attempt.
    pub presented_token: String,
    /// The redemption that consumed the ticket.
    pub original: RedemptionEvidence,
    /// The repeat attempt; `used_at` is when it was detected.
    pub detected: RedemptionEvidence,
    /// Same or different context.
    pub fraud_type: FraudType,
    /// Distance between the two locations, when both are known.
    pub distance_km: Option<f64>,
    /// Whole minutes between the original redemption and the attempt.
    pub minutes_elapsed: u64,
}

/// A persisted fraud attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FraudAttemptRecord {
    /// Row id, increasing in insertion order.
    pub id: u64,
    /// Ticket presented again.
    pub ticket_id: String,
    /// Holder of that ticket.
    pub holder_id: String,
    /// The redemption that consumed the ticket.
    pub original: RedemptionEvidence,
    /// The repeat attempt.
    pub detected: RedemptionEvidence,
    /// Same or different context.
    pub fraud_type: FraudType,
    /// Classified from `holder_attempts`.
    pub severity: Severity,
    /// Distance between the two locations, when both are known.
    pub distance_km: Option<f64>,
    /// Whole minutes between the original redemption and the attempt.
    pub minutes_elapsed: u64,
    /// Attempts against this ticket, this one included.
    pub ticket_attempts: u64,
    /// Attempts by this holder across all tickets, this one included.
    pub holder_attempts: u64,
}

/// Append-only store of fraud attempts.
pub trait FraudRecordStore: Send + Sync {
    /// Counts prior attempts, classifies severity, inserts the record and
    /// appends the matching `fraud` validation log entry as one write
    /// transaction. Concurrent attempts see distinct totals, and a failed
    /// log write leaves no record behind to inflate later totals.
    ///
    /// # Errors
    ///
    /// Returns an error if the transaction fails.
    fn record_attempt(
        &self,
        draft: &FraudDraft,
        policy: &SeverityPolicy,
    ) -> Result<FraudAttemptRecord, StoreError>;

    /// Returns every attempt against a ticket, oldest first.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    fn attempts_for_ticket(&self, ticket_id: &str) -> Result<Vec<FraudAttemptRecord>, StoreError>;

    /// Counts every attempt by a holder.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    fn count_for_holder(&self, holder_id: &str) -> Result<u64, StoreError>;
}

/// `SQLite`-backed [`FraudRecordStore`].
#[derive(Debug, Clone)]
pub struct SqliteFraudStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteFraudStore {
    /// Creates a store over the given connection.
    #[must_use]
    pub const fn new(conn: Arc<Mutex<Connection>>) -> Self {
        Self { conn }
    }

    /// Creates a store sharing `db`'s connection.
    #[must_use]
    pub fn from_database(db: &Database) -> Self {
        Self::new(db.connection())
    }
}

impl FraudRecordStore for SqliteFraudStore {
    fn record_attempt(
        &self,
        draft: &FraudDraft,
        policy: &SeverityPolicy,
    ) -> Result<FraudAttemptRecord, StoreError> {
        let mut conn = db::lock(&self.conn)?;
        // IMMEDIATE takes the write lock before counting, so a concurrent
        // attempt in another process cannot read the same totals.
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let ticket_attempts = tx
            .query_row(
                "SELECT COUNT(*) FROM fraud_attempts WHERE ticket_id = ?1",
                params![draft.ticket_id],
                |row| db::count_at(row, 0),
            )?
            .saturating_add(1);
        let holder_attempts = tx
            .query_row(
                "SELECT COUNT(*) FROM fraud_attempts WHERE holder_id = ?1",
                params![draft.holder_id],
                |row| db::count_at(row, 0),
            )?
            .saturating_add(1);
        let severity = policy.classify(holder_attempts);

        let (orig_lat, orig_lon) = split(draft.original.location);
        let (det_lat, det_lon) = split(draft.detected.location);

        tx.execute(
            "INSERT INTO fraud_attempts (
                 ticket_id, holder_id,
                 original_context_id, original_route_id, original_latitude, original_longitude, original_used_at_ms,
                 detected_context_id, detected_route_id, detected_latitude, detected_longitude, detected_at_ms,
                 fraud_type, severity, distance_km, minutes_elapsed, ticket_attempts, holder_attempts
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18)",
            params![
                draft.ticket_id,
                draft.holder_id,
                draft.original.context_id,
                draft.original.route_id,
                orig_lat,
                orig_lon,
                db::to_millis(draft.original.used_at),
                draft.detected.context_id,
                draft.detected.route_id,
                det_lat,
                det_lon,
                db::to_millis(draft.detected.used_at),
                draft.fraud_type,
                severity,
                draft.distance_km,
                db::to_sql_count(draft.minutes_elapsed),
                db::to_sql_count(ticket_attempts),
                db::to_sql_count(holder_attempts),
            ],
        )?;
        let id = u64::try_from(tx.last_insert_rowid()).unwrap_or_default();

        validation::insert_entry(
            &tx,
            &ValidationEntry {
                seq_id: None,
                ticket_id: Some(draft.ticket_id.clone()),
                presented_token: draft.presented_token.clone(),
                result: ValidationResult::Fraud,
                context_id: draft.detected.context_id.clone(),
                route_id: draft.detected.route_id.clone(),
                location: draft.detected.location,
                recorded_at: draft.detected.used_at,
            },
        )?;

        tx.commit()?;

        Ok(FraudAttemptRecord {
            id,
            ticket_id: draft.ticket_id.clone(),
            holder_id: draft.holder_id.clone(),
            original: draft.original.clone(),
            detected: draft.detected.clone(),
            fraud_type: draft.fraud_type,
            severity,
            distance_km: draft.distance_km,
            minutes_elapsed: draft.minutes_elapsed,
            ticket_attempts,
            holder_attempts,
        })
    }

    fn attempts_for_ticket(&self, ticket_id: &str) -> Result<Vec<FraudAttemptRecord>, StoreError> {
        let conn = db::lock(&self.conn)?;

        let mut stmt = conn.prepare(&format!(
            "SELECT {FRAUD_COLUMNS} FROM fraud_attempts WHERE ticket_id = ?1 ORDER BY id ASC"
        ))?;

        let records = stmt
            .query_map(params![ticket_id], record_from_row)?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(records)
    }

    fn count_for_holder(&self, holder_id: &str) -> Result<u64, StoreError> {
        let conn = db::lock(&self.conn)?;

        let count = conn.query_row(
            "SELECT COUNT(*) FROM fraud_attempts WHERE holder_id = ?1",
            params![holder_id],
            |row| db::count_at(row, 0),
        )?;

        Ok(count)
    }
}

fn split(location: Option<GeoPoint>) -> (Option<f64>, Option<f64>) {
    location.map_or((None, None), |p| (Some(p.lat), Some(p.lon)))
}

fn evidence_at(row: &Row<'_>, base: usize) -> rusqlite::Result<RedemptionEvidence> {
    Ok(RedemptionEvidence {
        context_id: row.get(base)?,
        route_id: row.get(base + 1)?,
        location: GeoPoint::from_parts(row.get(base + 2)?, row.get(base + 3)?),
        used_at: db::millis_at(row, base + 4)?,
    })
}

fn record_from_row(row: &Row<'_>) -> rusqlite::Result<FraudAttemptRecord> {
    Ok(FraudAttemptRecord {
        id: db::count_at(row, 0)?,
        ticket_id: row.get(1)?,
        holder_id: row.get(2)?,
        original: evidence_at(row, 3)?,
        detected: evidence_at(row, 8)?,
        fraud_type: row.get(13)?,
        severity: row.get(14)?,
        distance_km: row.get(15)?,
        minutes_elapsed: db::count_at(row, 16)?,
        ticket_attempts: db::count_at(row, 17)?,
        holder_attempts: db::count_at(row, 18)?,
    })
}

/// Whole minutes from `from` to `to`, clamped at zero.
#[must_use]
pub fn minutes_between(from: DateTime<Utc>, to: DateTime<Utc>) -> u64 {
    u64::try_from((to - from).num_minutes()).unwrap_or(0)
}
