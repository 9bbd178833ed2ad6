//! Ticket issuance against prepaid credit.
//!
//! A holder may carry at most as many redeemable tickets as they have
//! credits. Issuing does not move the balance; the credit is consumed when
//! the ticket is redeemed.

use std::sync::Arc;

use thiserror::Error;

use crate::account::{AccountError, AccountLedger};
use crate::clock::Clock;
use crate::ticket::{Ticket, TicketError, TicketStore};

/// Errors that can occur while issuing a ticket.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum IssuanceError {
    /// Every credit is already backing an outstanding ticket.
    #[error(
        "holder {holder_id} has {credit_count} credits and {outstanding} outstanding tickets"
    )]
    InsufficientCredit {
        /// The holder requesting a ticket.
        holder_id: String,
        /// Current balance.
        credit_count: u64,
        /// Tickets still redeemable.
        outstanding: u64,
    },

    /// Ticket store failure.
    #[error(transparent)]
    Ticket(#[from] TicketError),

    /// Ledger failure.
    #[error(transparent)]
    Account(#[from] AccountError),
}

/// Issues tickets backed by a holder's credit balance.
pub struct TicketIssuer {
    tickets: Arc<dyn TicketStore>,
    ledger: Arc<dyn AccountLedger>,
    clock: Arc<dyn Clock>,
}

impl TicketIssuer {
    /// Creates an issuer.
    #[must_use]
    pub fn new(
        tickets: Arc<dyn TicketStore>,
        ledger: Arc<dyn AccountLedger>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            tickets,
            ledger,
            clock,
        }
    }

    /// Issues a new `active` ticket to `holder_id`.
    ///
    /// # Errors
    ///
    /// Returns [`IssuanceError::InsufficientCredit`] unless the holder has
    /// more credits than outstanding tickets.
    pub fn issue(&self, holder_id: &str) -> Result<Ticket, IssuanceError> {
        let credit_count = self.ledger.balance(holder_id)?.credit_count;
        let outstanding = self.tickets.count_outstanding(holder_id)?;

        if credit_count <= outstanding {
            return Err(IssuanceError::InsufficientCredit {
                holder_id: holder_id.to_string(),
                credit_count,
                outstanding,
            });
        }

        let ticket = self.tickets.create(holder_id, self.clock.now())?;
        tracing::info!(ticket_id = %ticket.id, holder_id, "issued ticket");
        Ok(ticket)
    }
}

impl std::fmt::Debug for TicketIssuer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TicketIssuer").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use chrono::{TimeZone, Utc};

    use super::*;
    use crate::account::SqliteAccountLedger;
    use crate::clock::ManualClock;
    use crate::db::Database;
    use crate::ticket::{SqliteTicketStore, TicketState, Transition};

    struct Fixture {
        tickets: Arc<SqliteTicketStore>,
        ledger: Arc<SqliteAccountLedger>,
        issuer: TicketIssuer,
    }

    fn fixture() -> Fixture {
        let db = Database::in_memory().unwrap();
        let tickets = Arc::new(SqliteTicketStore::from_database(&db));
        let ledger = Arc::new(SqliteAccountLedger::from_database(&db));
        let clock = Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2026, 3, 1, 8, 0, 0).unwrap()));
        let issuer = TicketIssuer::new(tickets.clone(), ledger.clone(), clock);
        Fixture {
            tickets,
            ledger,
            issuer,
        }
    }

    #[test]
    fn test_issue_requires_credit() {
        let fx = fixture();
        let err = fx.issuer.issue("holder-1").unwrap_err();
        assert!(matches!(
            err,
            IssuanceError::InsufficientCredit {
                credit_count: 0,
                outstanding: 0,
                ..
            }
        ));
    }

    #[test]
    fn test_issue_up_to_balance() {
        let fx = fixture();
        fx.ledger.credit("holder-1", 2).unwrap();

        let first = fx.issuer.issue("holder-1").unwrap();
        fx.issuer.issue("holder-1").unwrap();
        assert!(matches!(
            fx.issuer.issue("holder-1"),
            Err(IssuanceError::InsufficientCredit { outstanding: 2, .. })
        ));

        assert_eq!(first.state, TicketState::Active);
        assert_eq!(first.holder_id, "holder-1");
        // Issuing never touches the balance.
        assert_eq!(fx.ledger.balance("holder-1").unwrap().credit_count, 2);
    }

    #[test]
    fn test_expired_ticket_frees_a_slot() {
        let fx = fixture();
        fx.ledger.credit("holder-1", 1).unwrap();
        let ticket = fx.issuer.issue("holder-1").unwrap();

        fx.tickets
            .transition(&ticket.id, TicketState::Active, &Transition::Expire)
            .unwrap();

        assert!(fx.issuer.issue("holder-1").is_ok());
    }
}
