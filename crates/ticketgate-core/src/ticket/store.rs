//! Ticket persistence and the compare-and-swap transition primitive.

use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, ValueRef};
use rusqlite::{Connection, OptionalExtension, Row, TransactionBehavior, params};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::error::TicketError;
use super::state::{RedemptionEvidence, Ticket, TicketState};
use crate::db::{self, Database, StoreError};
use crate::geo::GeoPoint;

/// Columns selected for every ticket read, in [`ticket_from_row`] order.
const TICKET_COLUMNS: &str = "id, holder_id, state, issued_at_ms, used_at_ms, used_by_context_id,
     used_route_id, used_at_latitude, used_at_longitude, transfer_expires_at_ms";

const TRANSFER_COLUMNS: &str =
    "transfer_token, ticket_id, requester_id, created_at_ms, expires_at_ms, closed_at_ms, outcome";

/// A requested state change, carrying the evidence the target state needs.
#[derive(Debug, Clone, PartialEq)]
pub enum Transition {
    /// Mark the ticket used with the given evidence.
    Redeem(RedemptionEvidence),
    /// Delegate the ticket until `expires_at`.
    BeginTransfer {
        /// Token the second party presents.
        transfer_token: String,
        /// Holder who initiated the transfer.
        requester_id: String,
        /// When the transfer was requested.
        requested_at: DateTime<Utc>,
        /// End of the transfer window.
        expires_at: DateTime<Utc>,
    },
    /// Return an expired transfer to its holder.
    Reclaim {
        /// When the reclaim happened.
        reclaimed_at: DateTime<Utc>,
    },
    /// Retire the ticket without redemption.
    Expire,
}

impl Transition {
    /// The state this transition leads to.
    #[must_use]
    pub const fn target(&self) -> TicketState {
        match self {
            Self::Redeem(_) => TicketState::Used,
            Self::BeginTransfer { .. } => TicketState::TransferPending,
            Self::Reclaim { .. } => TicketState::Active,
            Self::Expire => TicketState::Expired,
        }
    }
}

/// How a transfer window ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferOutcome {
    /// The ticket was redeemed while the transfer was open.
    Redeemed,
    /// The window lapsed and the ticket went back to its holder.
    Reclaimed,
}

impl TransferOutcome {
    /// Returns the persisted string form.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Redeemed => "redeemed",
            Self::Reclaimed => "reclaimed",
        }
    }
}

impl fmt::Display for TransferOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TransferOutcome {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "redeemed" => Ok(Self::Redeemed),
            "reclaimed" => Ok(Self::Reclaimed),
            _ => Err(format!("invalid transfer outcome: {s}")),
        }
    }
}

impl ToSql for TransferOutcome {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.as_str()))
    }
}

impl FromSql for TransferOutcome {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        value
            .as_str()?
            .parse()
            .map_err(|e: String| FromSqlError::Other(e.into()))
    }
}

/// One transfer window in a ticket's history.
///
/// Informational only: fraud forensics never compare against it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferRecord {
    /// Token handed to the second party.
    pub transfer_token: String,
    /// Ticket being delegated.
    pub ticket_id: String,
    /// Holder who initiated the transfer.
    pub requester_id: String,
    /// When the transfer began.
    pub created_at: DateTime<Utc>,
    /// End of the window.
    pub expires_at: DateTime<Utc>,
    /// When the window closed, if it has.
    pub closed_at: Option<DateTime<Utc>>,
    /// How the window closed, if it has.
    pub outcome: Option<TransferOutcome>,
}

impl TransferRecord {
    /// Returns `true` while the window has not been closed.
    #[must_use]
    pub const fn is_open(&self) -> bool {
        self.outcome.is_none()
    }
}

/// Durable record of every issued ticket.
///
/// [`TicketStore::transition`] is the only way to change a ticket's state.
pub trait TicketStore: Send + Sync {
    /// Issues a new `active` ticket to `holder_id`.
    ///
    /// # Errors
    ///
    /// Returns an error if the ticket cannot be persisted.
    fn create(&self, holder_id: &str, issued_at: DateTime<Utc>) -> Result<Ticket, TicketError>;

    /// Reads a ticket by id.
    ///
    /// # Errors
    ///
    /// Returns [`TicketError::NotFound`] if no such ticket exists.
    fn get(&self, ticket_id: &str) -> Result<Ticket, TicketError>;

    /// Atomically moves a ticket from `expected` to `change.target()`.
    ///
    /// Returns `Ok(false)` when the stored state is not `expected` at the
    /// instant of the write, including when the ticket does not exist. The
    /// check and the write are one conditional statement; no intermediate
    /// state is ever visible.
    ///
    /// # Errors
    ///
    /// Returns [`TicketError::IllegalTransition`] for edges outside the
    /// lifecycle, or a storage error.
    fn transition(
        &self,
        ticket_id: &str,
        expected: TicketState,
        change: &Transition,
    ) -> Result<bool, TicketError>;

    /// Looks up a transfer by the token handed to the second party.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    fn find_transfer(&self, transfer_token: &str) -> Result<Option<TransferRecord>, TicketError>;

    /// Returns the transfer history of a ticket, oldest first.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    fn transfers_for(&self, ticket_id: &str) -> Result<Vec<TransferRecord>, TicketError>;

    /// Returns pending transfers whose window closed before `now`.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    fn list_expired_transfers(&self, now: DateTime<Utc>) -> Result<Vec<Ticket>, TicketError>;

    /// Counts a holder's tickets that are still redeemable.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    fn count_outstanding(&self, holder_id: &str) -> Result<u64, TicketError>;
}

/// `SQLite`-backed [`TicketStore`].
#[derive(Debug, Clone)]
pub struct SqliteTicketStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteTicketStore {
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

impl TicketStore for SqliteTicketStore {
    fn create(&self, holder_id: &str, issued_at: DateTime<Utc>) -> Result<Ticket, TicketError> {
        let ticket = Ticket {
            id: Uuid::new_v4().to_string(),
            holder_id: holder_id.to_string(),
            state: TicketState::Active,
            issued_at,
            redemption: None,
            transfer_expires_at: None,
        };

        let conn = db::lock(&self.conn)?;
        conn.execute(
            "INSERT INTO tickets (id, holder_id, state, issued_at_ms) VALUES (?1, ?2, ?3, ?4)",
            params![
                ticket.id,
                ticket.holder_id,
                ticket.state,
                db::to_millis(issued_at)
            ],
        )?;

        Ok(ticket)
    }

    fn get(&self, ticket_id: &str) -> Result<Ticket, TicketError> {
        let conn = db::lock(&self.conn)?;

        let ticket = conn
            .query_row(
                &format!("SELECT {TICKET_COLUMNS} FROM tickets WHERE id = ?1"),
                params![ticket_id],
                ticket_from_row,
            )
            .optional()?
            .ok_or_else(|| TicketError::NotFound {
                ticket_id: ticket_id.to_string(),
            })?;

        check_invariants(&ticket)?;
        Ok(ticket)
    }

    fn transition(
        &self,
        ticket_id: &str,
        expected: TicketState,
        change: &Transition,
    ) -> Result<bool, TicketError> {
        let target = change.target();
        if !expected.can_transition_to(target) {
            return Err(TicketError::IllegalTransition {
                from: expected,
                to: target,
            });
        }

        let mut conn = db::lock(&self.conn)?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let changed = match change {
            Transition::Redeem(evidence) => {
                let (lat, lon) = evidence.location.map_or((None, None), |p| (Some(p.lat), Some(p.lon)));
                let changed = tx.execute(
                    "UPDATE tickets
                     SET state = ?1, used_at_ms = ?2, used_by_context_id = ?3, used_route_id = ?4,
                         used_at_latitude = ?5, used_at_longitude = ?6, transfer_expires_at_ms = NULL
                     WHERE id = ?7 AND state = ?8",
                    params![
                        target,
                        db::to_millis(evidence.used_at),
                        evidence.context_id,
                        evidence.route_id,
                        lat,
                        lon,
                        ticket_id,
                        expected,
                    ],
                )?;
                if changed == 1 && expected == TicketState::TransferPending {
                    close_open_transfer(&tx, ticket_id, TransferOutcome::Redeemed, evidence.used_at)?;
                }
                changed
            },
            Transition::BeginTransfer {
                transfer_token,
                requester_id,
                requested_at,
                expires_at,
            } => {
                let changed = tx.execute(
                    "UPDATE tickets SET state = ?1, transfer_expires_at_ms = ?2
                     WHERE id = ?3 AND state = ?4",
                    params![target, db::to_millis(*expires_at), ticket_id, expected],
                )?;
                if changed == 1 {
                    tx.execute(
                        "INSERT INTO ticket_transfers
                             (transfer_token, ticket_id, requester_id, created_at_ms, expires_at_ms)
                         VALUES (?1, ?2, ?3, ?4, ?5)",
                        params![
                            transfer_token,
                            ticket_id,
                            requester_id,
                            db::to_millis(*requested_at),
                            db::to_millis(*expires_at),
                        ],
                    )?;
                }
                changed
            },
            Transition::Reclaim { reclaimed_at } => {
                let changed = tx.execute(
                    "UPDATE tickets SET state = ?1, transfer_expires_at_ms = NULL
                     WHERE id = ?2 AND state = ?3",
                    params![target, ticket_id, expected],
                )?;
                if changed == 1 {
                    close_open_transfer(&tx, ticket_id, TransferOutcome::Reclaimed, *reclaimed_at)?;
                }
                changed
            },
            Transition::Expire => tx.execute(
                "UPDATE tickets SET state = ?1, transfer_expires_at_ms = NULL
                 WHERE id = ?2 AND state = ?3",
                params![target, ticket_id, expected],
            )?,
        };

        tx.commit()?;

        if changed == 0 {
            tracing::debug!(ticket_id, %expected, %target, "ticket transition lost compare-and-swap");
        }
        Ok(changed == 1)
    }

    fn find_transfer(&self, transfer_token: &str) -> Result<Option<TransferRecord>, TicketError> {
        let conn = db::lock(&self.conn)?;

        let record = conn
            .query_row(
                &format!("SELECT {TRANSFER_COLUMNS} FROM ticket_transfers WHERE transfer_token = ?1"),
                params![transfer_token],
                transfer_from_row,
            )
            .optional()?;

        Ok(record)
    }

    fn transfers_for(&self, ticket_id: &str) -> Result<Vec<TransferRecord>, TicketError> {
        let conn = db::lock(&self.conn)?;

        let mut stmt = conn.prepare(&format!(
            "SELECT {TRANSFER_COLUMNS} FROM ticket_transfers
             WHERE ticket_id = ?1
             ORDER BY created_at_ms ASC, rowid ASC"
        ))?;

        let records = stmt
            .query_map(params![ticket_id], transfer_from_row)?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(records)
    }

    fn list_expired_transfers(&self, now: DateTime<Utc>) -> Result<Vec<Ticket>, TicketError> {
        let conn = db::lock(&self.conn)?;

        let mut stmt = conn.prepare(&format!(
            "SELECT {TICKET_COLUMNS} FROM tickets
             WHERE state = ?1 AND transfer_expires_at_ms < ?2
             ORDER BY transfer_expires_at_ms ASC"
        ))?;

        let tickets = stmt
            .query_map(
                params![TicketState::TransferPending, db::to_millis(now)],
                ticket_from_row,
            )?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(tickets)
    }

    fn count_outstanding(&self, holder_id: &str) -> Result<u64, TicketError> {
        let conn = db::lock(&self.conn)?;

        let count = conn.query_row(
            "SELECT COUNT(*) FROM tickets WHERE holder_id = ?1 AND state IN (?2, ?3)",
            params![holder_id, TicketState::Active, TicketState::TransferPending],
            |row| db::count_at(row, 0),
        )?;

        Ok(count)
    }
}

fn close_open_transfer(
    conn: &Connection,
    ticket_id: &str,
    outcome: TransferOutcome,
    at: DateTime<Utc>,
) -> rusqlite::Result<usize> {
    conn.execute(
        "UPDATE ticket_transfers SET closed_at_ms = ?1, outcome = ?2
         WHERE ticket_id = ?3 AND outcome IS NULL",
        params![db::to_millis(at), outcome, ticket_id],
    )
}

fn ticket_from_row(row: &Row<'_>) -> rusqlite::Result<Ticket> {
    let state: TicketState = row.get(2)?;
    let used_at = db::opt_millis_at(row, 4)?;
    let used_by: Option<String> = row.get(5)?;

    let redemption = match (used_at, used_by) {
        (Some(used_at), Some(context_id)) => Some(RedemptionEvidence {
            used_at,
            context_id,
            route_id: row.get(6)?,
            location: GeoPoint::from_parts(row.get(7)?, row.get(8)?),
        }),
        _ => None,
    };

    Ok(Ticket {
        id: row.get(0)?,
        holder_id: row.get(1)?,
        state,
        issued_at: db::millis_at(row, 3)?,
        redemption,
        transfer_expires_at: db::opt_millis_at(row, 9)?,
    })
}

fn transfer_from_row(row: &Row<'_>) -> rusqlite::Result<TransferRecord> {
    Ok(TransferRecord {
        transfer_token: row.get(0)?,
        ticket_id: row.get(1)?,
        requester_id: row.get(2)?,
        created_at: db::millis_at(row, 3)?,
        expires_at: db::millis_at(row, 4)?,
        closed_at: db::opt_millis_at(row, 5)?,
        outcome: row.get(6)?,
    })
}

fn check_invariants(ticket: &Ticket) -> Result<(), StoreError> {
    let used = ticket.state == TicketState::Used;
    let pending = ticket.state == TicketState::TransferPending;

    let details = if used != ticket.redemption.is_some() {
        "redemption evidence does not match state"
    } else if pending != ticket.transfer_expires_at.is_some() {
        "transfer window does not match state"
    } else {
        return Ok(());
    };

    Err(StoreError::CorruptRow {
        table: "tickets",
        id: ticket.id.clone(),
        details: format!("{details} ({})", ticket.state),
    })
}
