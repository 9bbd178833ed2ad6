//! Ticket store.
//!
//! Durable record of every issued ticket and its lifecycle state.
//!
//! # Compare-and-swap
//!
//! [`TicketStore::transition`] is the only path that changes a ticket's
//! state. It executes `UPDATE ... WHERE id = ? AND state = ?` and reports
//! whether a row changed. A `false` result is not an error: it tells the
//! caller that somebody else moved the ticket first. The redemption engine
//! relies on this as the sole arbiter of who redeemed a ticket.
//!
//! ```text
//! (none) --create--> Active
//! Active --Redeem--> Used
//! Active --BeginTransfer--> TransferPending --Redeem--> Used
//!                           TransferPending --Reclaim--> Active
//! Active --Expire--> Expired
//! ```

mod error;
mod state;
mod store;


pub use error::TicketError;
pub use state::{RedemptionEvidence, Ticket, TicketState, short_code};
pub use store::{SqliteTicketStore, TicketStore, TransferOutcome, TransferRecord, Transition};
