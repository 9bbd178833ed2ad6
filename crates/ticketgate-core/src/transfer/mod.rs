//! Time-boxed ticket transfers.
//!
//! A holder can hand a ticket to someone else for a limited window. The
//! second party receives a transfer token, which the redemption engine
//! resolves back to the ticket. When the window closes without a
//! redemption the ticket returns to its holder, either lazily at the next
//! redemption attempt or through [`TransferManager::sweep_expired`].
//!
//! Expiry is strict: a transfer is overdue only once `now > expires_at`.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::clock::Clock;
use crate::ticket::{Ticket, TicketError, TicketState, TicketStore, Transition};

/// Prefix that keeps transfer tokens disjoint from ticket ids.
pub const TRANSFER_TOKEN_PREFIX: &str = "xfer-";

/// Errors that can occur while managing transfers.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum TransferError {
    /// No ticket with this id exists.
    #[error("ticket not found: {ticket_id}")]
    TicketNotFound {
        /// The id that did not resolve.
        ticket_id: String,
    },

    /// Only the holder may transfer a ticket.
    #[error("{requester_id} does not hold ticket {ticket_id}")]
    NotHolder {
        /// The ticket.
        ticket_id: String,
        /// Who asked.
        requester_id: String,
    },

    /// The ticket is not `active`.
    #[error("ticket {ticket_id} cannot be transferred while {state}")]
    NotTransferable {
        /// The ticket.
        ticket_id: String,
        /// State observed when the transfer was refused.
        state: TicketState,
    },

    /// Ticket store failure.
    #[error(transparent)]
    Ticket(TicketError),
}

impl From<TicketError> for TransferError {
    fn from(err: TicketError) -> Self {
        match err {
            TicketError::NotFound { ticket_id } => Self::TicketNotFound { ticket_id },
            other => Self::Ticket(other),
        }
    }
}

/// Credentials handed to the second party.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferGrant {
    /// The transferred ticket.
    pub ticket_id: String,
    /// Token the second party presents at redemption.
    pub transfer_token: String,
    /// End of the window.
    pub expires_at: DateTime<Utc>,
}

/// Result of [`TransferManager::reclaim_if_expired`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReclaimOutcome {
    /// The ticket went back to `active`.
    Reclaimed,
    /// No transfer is pending.
    NotPending,
    /// The window is still open.
    NotExpired,
    /// Another caller moved the ticket first.
    LostRace,
}

/// Begins, reclaims and sweeps transfers.
pub struct TransferManager {
    tickets: Arc<dyn TicketStore>,
    clock: Arc<dyn Clock>,
    window: Duration,
}

impl TransferManager {
    /// Creates a manager granting windows of `window`.
    #[must_use]
    pub fn new(tickets: Arc<dyn TicketStore>, clock: Arc<dyn Clock>, window: Duration) -> Self {
        Self {
            tickets,
            clock,
            window,
        }
    }

    /// Length of the windows this manager grants.
    #[must_use]
    pub const fn window(&self) -> Duration {
        self.window
    }

    /// Delegates an `active` ticket until `now + window`.
    ///
    /// # Errors
    ///
    /// Returns [`TransferError::NotHolder`] if `requester_id` does not hold
    /// the ticket, or [`TransferError::NotTransferable`] if it is not
    /// `active` (including when a concurrent change wins the swap).
    pub fn begin_transfer(
        &self,
        ticket_id: &str,
        requester_id: &str,
    ) -> Result<TransferGrant, TransferError> {
        let ticket = self.tickets.get(ticket_id)?;

        if ticket.holder_id != requester_id {
            return Err(TransferError::NotHolder {
                ticket_id: ticket_id.to_string(),
                requester_id: requester_id.to_string(),
            });
        }
        if ticket.state != TicketState::Active {
            return Err(TransferError::NotTransferable {
                ticket_id: ticket_id.to_string(),
                state: ticket.state,
            });
        }

        let now = self.clock.now();
        let grant = TransferGrant {
            ticket_id: ticket_id.to_string(),
            transfer_token: format!("{TRANSFER_TOKEN_PREFIX}{}", Uuid::new_v4().simple()),
            expires_at: now + self.window,
        };

        let change = Transition::BeginTransfer {
            transfer_token: grant.transfer_token.clone(),
            requester_id: requester_id.to_string(),
            requested_at: now,
            expires_at: grant.expires_at,
        };
        if !self.tickets.transition(ticket_id, TicketState::Active, &change)? {
            let state = self.tickets.get(ticket_id)?.state;
            return Err(TransferError::NotTransferable {
                ticket_id: ticket_id.to_string(),
                state,
            });
        }

        tracing::info!(
            ticket_id,
            requester_id,
            expires_at = %grant.expires_at,
            "transfer started"
        );
        Ok(grant)
    }

    /// Returns an overdue transfer to its holder.
    ///
    /// A ticket that is not `transfer_pending` is left alone and reported as
    /// [`ReclaimOutcome::NotPending`]; calling this repeatedly is harmless.
    /// Nothing is re-credited.
    ///
    /// # Errors
    ///
    /// Returns [`TransferError::TicketNotFound`] for an unknown ticket, or a
    /// storage error.
    pub fn reclaim_if_expired(&self, ticket_id: &str) -> Result<ReclaimOutcome, TransferError> {
        let ticket = self.tickets.get(ticket_id)?;
        self.reclaim(&ticket, self.clock.now())
    }

    /// Reclaims every overdue transfer and returns how many were reclaimed.
    ///
    /// Lazy reclaim at redemption time is sufficient on its own; the sweep
    /// only keeps `transfer_pending` from lingering on idle tickets.
    ///
    /// # Errors
    ///
    /// Returns a storage error; tickets reclaimed before the error stay
    /// reclaimed.
    pub fn sweep_expired(&self) -> Result<usize, TransferError> {
        let now = self.clock.now();
        let overdue = self.tickets.list_expired_transfers(now)?;

        let mut reclaimed = 0;
        for ticket in &overdue {
            if self.reclaim(ticket, now)? == ReclaimOutcome::Reclaimed {
                reclaimed += 1;
            }
        }

        if reclaimed > 0 {
            tracing::info!(reclaimed, overdue = overdue.len(), "swept expired transfers");
        }
        Ok(reclaimed)
    }

    fn reclaim(&self, ticket: &Ticket, now: DateTime<Utc>) -> Result<ReclaimOutcome, TransferError> {
        if ticket.state != TicketState::TransferPending {
            return Ok(ReclaimOutcome::NotPending);
        }
        if !ticket.transfer_expired_at(now) {
            return Ok(ReclaimOutcome::NotExpired);
        }

        let change = Transition::Reclaim { reclaimed_at: now };
        if !self
            .tickets
            .transition(&ticket.id, TicketState::TransferPending, &change)?
        {
            return Ok(ReclaimOutcome::LostRace);
        }

        tracing::info!(ticket_id = %ticket.id, holder_id = %ticket.holder_id, "transfer reclaimed");
        Ok(ReclaimOutcome::Reclaimed)
    }
}

impl std::fmt::Debug for TransferManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransferManager")
            .field("window", &self.window)
            .finish_non_exhaustive()
    }
}
