//! Fraud forensics.
//!
//! A ticket that is presented after it was used produces one
//! [`FraudAttemptRecord`]. The record compares the original redemption with
//! the repeat attempt:
//!
//! - `minutes_elapsed`: whole minutes since the original redemption, never
//!   negative.
//! - `distance_km`: haversine distance when both attempts carried a
//!   location.
//! - `fraud_type`: [`FraudType::SameContext`] iff the context ids match.
//! - `ticket_attempts` / `holder_attempts`: running totals including this
//!   attempt, counted in the same write transaction as the insert.
//!
//! Severity is derived from `holder_attempts` through a configurable
//! [`SeverityPolicy`]. Records are append-only.

mod scorer;
mod severity;
mod store;


pub use scorer::{FraudAlert, FraudScorer};
pub use severity::{Severity, SeverityPolicy};
pub use store::{
    FraudAttemptRecord, FraudDraft, FraudRecordStore, FraudType, SqliteFraudStore, minutes_between,
};
