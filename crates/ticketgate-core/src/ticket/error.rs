//! Ticket store error types.

use thiserror::Error;

use super::state::TicketState;
use crate::db::StoreError;

/// Errors that can occur during ticket store operations.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum TicketError {
    /// No ticket with this id exists.
    #[error("ticket not found: {ticket_id}")]
    NotFound {
        /// The id that did not resolve.
        ticket_id: String,
    },

    /// The requested transition is not an edge of the lifecycle.
    #[error("illegal ticket transition {from} -> {to}")]
    IllegalTransition {
        /// Expected current state.
        from: TicketState,
        /// Requested new state.
        to: TicketState,
    },

    /// Unknown state string.
    #[error("invalid ticket state: {value}")]
    InvalidState {
        /// The invalid value.
        value: String,
    },

    /// Underlying storage failure.
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl From<rusqlite::Error> for TicketError {
    fn from(err: rusqlite::Error) -> Self {
        Self::Store(StoreError::Database(err))
    }
}
