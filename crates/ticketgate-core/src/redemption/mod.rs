//! Redemption engine.
//!
//! Given a presented token and the redeeming context, the engine:
//!
//! 1. Resolves the token as a ticket id or a transfer token. Lookups are
//!    retried on transient storage failures; nothing else is. An unknown
//!    token is `invalid`.
//! 2. Reclaims an overdue transfer. A transfer token whose window has
//!    closed answers `expired_transfer`; the holder's own ticket id logs the
//!    reclaim as `expired_transfer` and carries on as `active`.
//! 3. Sends a `used` ticket to fraud forensics.
//! 4. Refuses any other non-redeemable state as `inactive`.
//! 5. Swaps the ticket to `used`. A lost swap re-reads the ticket once: a
//!    `used` ticket goes to forensics, anything else is `inactive`.
//! 6. On a won swap, debits the holder, logs the attempt and returns a
//!    receipt with the context's operating-day counters. An empty balance
//!    is tolerated; a debit that fails in storage is logged as `valid` and
//!    returned as [`RedemptionError::DebitFailed`].
//!
//! ```text
//!            redeem                      redeem
//! Active ───────────────> Used <─────────────── TransferPending
//!   │  ^                                            │
//!   │  └──────────── reclaim (now > expires_at) ────┤
//!   └──────────────── begin_transfer ───────────────┘
//! ```

mod engine;
mod response;

#[cfg(test)]
mod tests;

pub use engine::{EngineStores, RedemptionEngine, RedemptionError};
pub use response::{RedemptionReceipt, RedemptionRequest, RedemptionResponse, RejectionKind};
