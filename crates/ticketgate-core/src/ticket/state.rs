//! Ticket lifecycle types.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, ValueRef};
use serde::{Deserialize, Serialize};

use super::error::TicketError;
use crate::geo::GeoPoint;

/// Lifecycle state of a ticket.
///
/// ```text
/// Active --redeem--> Used (terminal)
/// Active --begin_transfer--> TransferPending --redeem--> Used
///                            TransferPending --expiry reclaim--> Active
/// Active --expire--> Expired (terminal)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TicketState {
    /// Issued and redeemable by its holder.
    Active,
    /// Redeemed. Any further presentation is a fraud attempt.
    Used,
    /// Administratively retired without redemption.
    Expired,
    /// Delegated to a second party until the transfer window closes.
    TransferPending,
}

impl TicketState {
    /// Returns the persisted string form.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Used => "used",
            Self::Expired => "expired",
            Self::TransferPending => "transfer_pending",
        }
    }

    /// Returns `true` if `self -> to` is an edge of the lifecycle.
    #[must_use]
    pub const fn can_transition_to(&self, to: Self) -> bool {
        matches!(
            (self, to),
            (Self::Active | Self::TransferPending, Self::Used)
                | (Self::Active, Self::TransferPending | Self::Expired)
                | (Self::TransferPending, Self::Active)
        )
    }
}

impl fmt::Display for TicketState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TicketState {
    type Err = TicketError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(Self::Active),
            "used" => Ok(Self::Used),
            "expired" => Ok(Self::Expired),
            "transfer_pending" => Ok(Self::TransferPending),
            _ => Err(TicketError::InvalidState {
                value: s.to_string(),
            }),
        }
    }
}

impl ToSql for TicketState {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.as_str()))
    }
}

impl FromSql for TicketState {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        value
            .as_str()?
            .parse()
            .map_err(|e: TicketError| FromSqlError::Other(Box::new(e)))
    }
}

/// Where and by whom a ticket was redeemed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RedemptionEvidence {
    /// When the redemption was accepted.
    pub used_at: DateTime<Utc>,
    /// The validating unit (vehicle, terminal) that redeemed the ticket.
    pub context_id: String,
    /// Route the unit was serving, if reported.
    pub route_id: Option<String>,
    /// Where the redemption happened, if reported.
    pub location: Option<GeoPoint>,
}

/// A single-use ticket.
///
/// Redemption evidence is present iff the state is [`TicketState::Used`];
/// `transfer_expires_at` is present iff the state is
/// [`TicketState::TransferPending`]. The schema enforces both.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Ticket {
    /// Opaque redeemable token.
    pub id: String,
    /// Account that bought the ticket. Never changes, even across transfers.
    pub holder_id: String,
    /// Current lifecycle state.
    pub state: TicketState,
    /// When the ticket was issued.
    pub issued_at: DateTime<Utc>,
    /// Redemption evidence, once used.
    pub redemption: Option<RedemptionEvidence>,
    /// End of the current transfer window, while a transfer is pending.
    pub transfer_expires_at: Option<DateTime<Utc>>,
}

impl Ticket {
    /// Returns `true` if a pending transfer window has closed at `now`.
    #[must_use]
    pub fn transfer_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.state == TicketState::TransferPending
            && self.transfer_expires_at.is_some_and(|expires| now > expires)
    }

    /// Short code shown to the holder and the operator: the last six
    /// alphanumeric characters of the id, upper-cased.
    #[must_use]
    pub fn short_code(&self) -> String {
        short_code(&self.id)
    }
}

/// Computes the display code for a ticket id.
#[must_use]
pub fn short_code(ticket_id: &str) -> String {
    let alnum: Vec<char> = ticket_id
        .chars()
        .filter(char::is_ascii_alphanumeric)
        .collect();
    let start = alnum.len().saturating_sub(6);
    alnum[start..].iter().collect::<String>().to_ascii_uppercase()
}
