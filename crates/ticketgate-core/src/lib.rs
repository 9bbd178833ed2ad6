//! Ticketgate core: single-use ticket redemption with fraud forensics.
//!
//! A ticket is issued against a holder's prepaid credit, may be handed to
//! someone else for a bounded transfer window, and is redeemed exactly once
//! at a point of use. Every later presentation of the same ticket is
//! recorded as a scored fraud attempt.
//!
//! # Components
//!
//! - [`ticket`]: ticket rows and the compare-and-swap state transition
//! - [`account`]: per-holder credit balances
//! - [`issuance`]: credit-checked ticket issuance
//! - [`transfer`]: time-boxed delegation and lazy reclaim
//! - [`redemption`]: the exactly-once redemption engine
//! - [`forensics`]: fraud attempt scoring and persistence
//! - [`validation`]: the append-only attempt log and daily counters
//!
//! All components persist through [`db::Database`], a `SQLite` file in WAL
//! mode that several processes may open at once.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use ticketgate_core::account::AccountLedger;
//! use ticketgate_core::clock::SystemClock;
//! use ticketgate_core::config::EngineConfig;
//! use ticketgate_core::db::{Database, DEFAULT_BUSY_TIMEOUT};
//! use ticketgate_core::redemption::{RedemptionEngine, RedemptionRequest};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let db = Database::open("ticketgate.db", DEFAULT_BUSY_TIMEOUT)?;
//! let engine = RedemptionEngine::sqlite(&db, EngineConfig::default(), Arc::new(SystemClock));
//!
//! engine.stores().ledger.credit("holder-1", 5)?;
//! let ticket = engine.issuer().issue("holder-1")?;
//!
//! let response = engine.redeem(&RedemptionRequest::new(&ticket.id, "unit-12").at(29.0, -110.9))?;
//! println!("{}", serde_json::to_string(&response)?);
//! # Ok(())
//! # }
//! ```

pub mod account;
pub mod clock;
pub mod config;
pub mod db;
pub mod forensics;
pub mod geo;
pub mod issuance;
pub mod redemption;
pub mod ticket;
pub mod transfer;
pub mod validation;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::EngineConfig;
pub use db::{Database, StoreError};
pub use redemption::{RedemptionEngine, RedemptionRequest, RedemptionResponse};
