//! Account ledger: per-holder balance of unredeemed ticket credits.
//!
//! Debit and credit are not idempotent. Each call moves the balance, so the
//! redemption engine calls [`AccountLedger::debit`] exactly once per
//! successful compare-and-swap on the ticket, never on retries.

use std::sync::{Arc, Mutex};

use rusqlite::{Connection, OptionalExtension, params};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::db::{self, Database, StoreError};

/// Errors that can occur during ledger operations.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum AccountError {
    /// The holder has no credit left to debit.
    #[error("holder {holder_id} has insufficient credit (balance {credit_count})")]
    InsufficientCredit {
        /// The holder being debited.
        holder_id: String,
        /// Balance at the time of the attempt.
        credit_count: u64,
    },

    /// Credit amounts must be positive.
    #[error("invalid credit amount {amount} for holder {holder_id}")]
    InvalidAmount {
        /// The holder being credited.
        holder_id: String,
        /// The rejected amount.
        amount: u64,
    },

    /// Underlying storage failure.
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl From<rusqlite::Error> for AccountError {
    fn from(err: rusqlite::Error) -> Self {
        Self::Store(StoreError::Database(err))
    }
}

/// Balance of one holder.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerEntry {
    /// The account.
    pub holder_id: String,
    /// Credits not yet consumed by a redemption.
    pub credit_count: u64,
    /// Lifetime count of successful redemptions.
    pub total_redeemed_count: u64,
}

impl LedgerEntry {
    /// An entry for a holder the ledger has never seen.
    #[must_use]
    pub fn empty(holder_id: impl Into<String>) -> Self {
        Self {
            holder_id: holder_id.into(),
            credit_count: 0,
            total_redeemed_count: 0,
        }
    }
}

/// Per-holder credit balances.
pub trait AccountLedger: Send + Sync {
    /// Consumes one credit and counts one redemption.
    ///
    /// # Errors
    ///
    /// Returns [`AccountError::InsufficientCredit`] if the balance is zero.
    fn debit(&self, holder_id: &str) -> Result<LedgerEntry, AccountError>;

    /// Adds `amount` credits.
    ///
    /// # Errors
    ///
    /// Returns [`AccountError::InvalidAmount`] for a zero amount.
    fn credit(&self, holder_id: &str, amount: u64) -> Result<LedgerEntry, AccountError>;

    /// Returns the holder's balance; unknown holders have an empty entry.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    fn balance(&self, holder_id: &str) -> Result<LedgerEntry, AccountError>;
}

/// `SQLite`-backed [`AccountLedger`].
#[derive(Debug, Clone)]
pub struct SqliteAccountLedger {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteAccountLedger {
    /// Creates a ledger over the given connection.
    #[must_use]
    pub const fn new(conn: Arc<Mutex<Connection>>) -> Self {
        Self { conn }
    }

    /// Creates a ledger sharing `db`'s connection.
    #[must_use]
    pub fn from_database(db: &Database) -> Self {
        Self::new(db.connection())
    }

    fn read(conn: &Connection, holder_id: &str) -> Result<LedgerEntry, AccountError> {
        let entry = conn
            .query_row(
                "SELECT credit_count, total_redeemed_count FROM account_ledger WHERE holder_id = ?1",
                params![holder_id],
                |row| {
                    Ok(LedgerEntry {
                        holder_id: holder_id.to_string(),
                        credit_count: db::count_at(row, 0)?,
                        total_redeemed_count: db::count_at(row, 1)?,
                    })
                },
            )
            .optional()?;

        Ok(entry.unwrap_or_else(|| LedgerEntry::empty(holder_id)))
    }
}

impl AccountLedger for SqliteAccountLedger {
    fn debit(&self, holder_id: &str) -> Result<LedgerEntry, AccountError> {
        let conn = db::lock(&self.conn)?;

        // The balance check and the decrement are one statement.
        let changed = conn.execute(
            "UPDATE account_ledger
             SET credit_count = credit_count - 1,
                 total_redeemed_count = total_redeemed_count + 1
             WHERE holder_id = ?1 AND credit_count > 0",
            params![holder_id],
        )?;

        let entry = Self::read(&conn, holder_id)?;
        if changed == 0 {
            return Err(AccountError::InsufficientCredit {
                holder_id: holder_id.to_string(),
                credit_count: entry.credit_count,
            });
        }

        Ok(entry)
    }

    fn credit(&self, holder_id: &str, amount: u64) -> Result<LedgerEntry, AccountError> {
        if amount == 0 {
            return Err(AccountError::InvalidAmount {
                holder_id: holder_id.to_string(),
                amount,
            });
        }

        let conn = db::lock(&self.conn)?;
        conn.execute(
            "INSERT INTO account_ledger (holder_id, credit_count) VALUES (?1, ?2)
             ON CONFLICT (holder_id) DO UPDATE SET credit_count = credit_count + excluded.credit_count",
            params![holder_id, db::to_sql_count(amount)],
        )?;

        Self::read(&conn, holder_id)
    }

    fn balance(&self, holder_id: &str) -> Result<LedgerEntry, AccountError> {
        let conn = db::lock(&self.conn)?;
        Self::read(&conn, holder_id)
    }
}
