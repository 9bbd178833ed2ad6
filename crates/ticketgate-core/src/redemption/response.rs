//! Redemption request and response shapes.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize, Serializer};

use crate::forensics::{FraudAlert, Severity};
use crate::geo::GeoPoint;

/// A redemption attempt as submitted by a front-line validator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RedemptionRequest {
    /// Ticket id or transfer token.
    pub ticket_token: String,
    /// Where the attempt happened, if the reader knows.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub geolocation: Option<GeoPoint>,
    /// The redeeming unit.
    pub context_id: String,
    /// Route the unit is serving.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub route_id: Option<String>,
}

impl RedemptionRequest {
    /// A request without route or location.
    #[must_use]
    pub fn new(ticket_token: impl Into<String>, context_id: impl Into<String>) -> Self {
        Self {
            ticket_token: ticket_token.into(),
            geolocation: None,
            context_id: context_id.into(),
            route_id: None,
        }
    }

    /// Sets the route.
    #[must_use]
    pub fn with_route(mut self, route_id: impl Into<String>) -> Self {
        self.route_id = Some(route_id.into());
        self
    }

    /// Sets the location.
    #[must_use]
    pub fn at(mut self, lat: f64, lon: f64) -> Self {
        self.geolocation = Some(GeoPoint::new(lat, lon));
        self
    }
}

/// Proof of a successful redemption.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RedemptionReceipt {
    /// The redeemed ticket.
    pub ticket_id: String,
    /// Display code of the ticket.
    pub short_code: String,
    /// When the redemption was accepted.
    pub redeemed_at: DateTime<Utc>,
    /// Fare, in minor currency units.
    pub amount: u64,
    /// Valid redemptions by this context in its current operating day.
    pub daily_context_count: u64,
    /// `daily_context_count * amount`.
    pub daily_context_total: u64,
}

/// Why a non-fraudulent attempt was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectionKind {
    /// The token does not resolve to a ticket.
    Invalid,
    /// The ticket exists but is not redeemable.
    Inactive,
    /// The transfer token's window has closed.
    ExpiredTransfer,
}

impl RejectionKind {
    /// Returns the wire form used as `error_type`.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Invalid => "invalid",
            Self::Inactive => "inactive",
            Self::ExpiredTransfer => "expired_transfer",
        }
    }
}

impl fmt::Display for RejectionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of a redemption attempt.
///
/// Serializes to the flat wire shape validators consume: `valid` is always
/// present, `error_type` names the rejection, and fraud alerts carry a
/// `fraud_details` object.
#[derive(Debug, Clone, PartialEq)]
pub enum RedemptionResponse {
    /// The ticket was redeemed by this request.
    Valid(RedemptionReceipt),
    /// The attempt was refused without fraud.
    Rejected {
        /// Why.
        kind: RejectionKind,
        /// Operator-facing explanation.
        message: String,
    },
    /// The ticket had already been redeemed.
    Fraud(Box<FraudAlert>),
}

impl RedemptionResponse {
    /// Returns `true` for a successful redemption.
    #[must_use]
    pub const fn is_valid(&self) -> bool {
        matches!(self, Self::Valid(_))
    }

    /// The `error_type` reported on the wire, if any.
    #[must_use]
    pub const fn error_type(&self) -> Option<&'static str> {
        match self {
            Self::Valid(_) => None,
            Self::Rejected { kind, .. } => Some(kind.as_str()),
            Self::Fraud(_) => Some("fraud"),
        }
    }

    /// The receipt, for a successful redemption.
    #[must_use]
    pub const fn receipt(&self) -> Option<&RedemptionReceipt> {
        match self {
            Self::Valid(receipt) => Some(receipt),
            _ => None,
        }
    }

    /// The alert, for a fraud outcome.
    #[must_use]
    pub fn fraud(&self) -> Option<&FraudAlert> {
        match self {
            Self::Fraud(alert) => Some(alert.as_ref()),
            _ => None,
        }
    }
}

#[derive(Serialize)]
struct FraudDetails<'a> {
    original_used_at: DateTime<Utc>,
    original_context: &'a str,
    original_route: Option<&'a str>,
    minutes_elapsed: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    distance_km: Option<f64>,
    same_context: bool,
    short_code: &'a str,
    holder_total_attempts: u64,
    ticket_total_attempts: u64,
}

#[derive(Serialize)]
struct Wire<'a> {
    valid: bool,
    #[serde(flatten)]
    receipt: Option<&'a RedemptionReceipt>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error_type: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    severity: Option<Severity>,
    #[serde(skip_serializing_if = "Option::is_none")]
    message: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    fraud_details: Option<FraudDetails<'a>>,
}

impl Serialize for RedemptionResponse {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let wire = match self {
            Self::Valid(receipt) => Wire {
                valid: true,
                receipt: Some(receipt),
                error_type: None,
                severity: None,
                message: None,
                fraud_details: None,
            },
            Self::Rejected { kind, message } => Wire {
                valid: false,
                receipt: None,
                error_type: Some(kind.as_str()),
                severity: None,
                message: Some(message),
                fraud_details: None,
            },
            Self::Fraud(alert) => {
                let record = &alert.record;
                Wire {
                    valid: false,
                    receipt: None,
                    error_type: Some("fraud"),
                    severity: Some(record.severity),
                    message: Some(&alert.message),
                    fraud_details: Some(FraudDetails {
                        original_used_at: record.original.used_at,
                        original_context: &record.original.context_id,
                        original_route: record.original.route_id.as_deref(),
                        minutes_elapsed: record.minutes_elapsed,
                        distance_km: record.distance_km,
                        same_context: alert.same_context(),
                        short_code: &alert.short_code,
                        holder_total_attempts: record.holder_attempts,
                        ticket_total_attempts: record.ticket_attempts,
                    }),
                }
            },
        };
        wire.serialize(serializer)
    }
}
