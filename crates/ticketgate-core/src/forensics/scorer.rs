//! Turns a repeat redemption into a persisted, scored alert.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use super::severity::{Severity, SeverityPolicy};
use super::store::{FraudAttemptRecord, FraudDraft, FraudRecordStore, FraudType, minutes_between};
use crate::db::StoreError;
use crate::geo;
use crate::ticket::{RedemptionEvidence, Ticket};

/// Outcome of scoring one repeat attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FraudAlert {
    /// The persisted attempt.
    pub record: FraudAttemptRecord,
    /// Display code of the ticket.
    pub short_code: String,
    /// Operator-facing summary.
    pub message: String,
}

impl FraudAlert {
    /// Severity of the attempt.
    #[must_use]
    pub const fn severity(&self) -> Severity {
        self.record.severity
    }

    /// Returns `true` if the attempt came from the unit that first redeemed.
    #[must_use]
    pub fn same_context(&self) -> bool {
        self.record.fraud_type == FraudType::SameContext
    }
}

/// Scores repeat presentations of used tickets.
///
/// The scorer reads the ticket's redemption evidence as the baseline. A
/// ticket's transfer history plays no part in it.
pub struct FraudScorer {
    store: Arc<dyn FraudRecordStore>,
    policy: SeverityPolicy,
}

impl FraudScorer {
    /// Creates a scorer.
    #[must_use]
    pub fn new(store: Arc<dyn FraudRecordStore>, policy: SeverityPolicy) -> Self {
        Self { store, policy }
    }

    /// Active severity thresholds.
    #[must_use]
    pub const fn policy(&self) -> &SeverityPolicy {
        &self.policy
    }

    /// Records a repeat attempt on a used ticket and returns the alert.
    ///
    /// `detected.used_at` is the time the attempt was processed. The record
    /// and its `fraud` log entry are written together or not at all.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::CorruptRow`] if the ticket carries no redemption
    /// evidence, or a storage error if the attempt cannot be persisted.
    pub fn score(
        &self,
        ticket: &Ticket,
        detected: RedemptionEvidence,
        presented_token: &str,
    ) -> Result<FraudAlert, StoreError> {
        let original = ticket.redemption.clone().ok_or_else(|| StoreError::CorruptRow {
            table: "tickets",
            id: ticket.id.clone(),
            details: format!("no redemption evidence ({})", ticket.state),
        })?;

        let draft = FraudDraft {
            ticket_id: ticket.id.clone(),
            holder_id: ticket.holder_id.clone(),
            presented_token: presented_token.to_string(),
            fraud_type: FraudType::between(&original.context_id, &detected.context_id),
            distance_km: geo::distance_between(original.location, detected.location),
            minutes_elapsed: minutes_between(original.used_at, detected.used_at),
            original,
            detected,
        };

        let record = self.store.record_attempt(&draft, &self.policy)?;

        tracing::warn!(
            ticket_id = %record.ticket_id,
            holder_id = %record.holder_id,
            context_id = %record.detected.context_id,
            original_context_id = %record.original.context_id,
            severity = %record.severity,
            fraud_type = %record.fraud_type,
            minutes_elapsed = record.minutes_elapsed,
            holder_attempts = record.holder_attempts,
            "used ticket presented again"
        );

        let short_code = ticket.short_code();
        let message = format!(
            "ticket {short_code} was already used {} min ago by {}",
            record.minutes_elapsed, record.original.context_id
        );

        Ok(FraudAlert {
            record,
            short_code,
            message,
        })
    }
}

impl std::fmt::Debug for FraudScorer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FraudScorer")
            .field("policy", &self.policy)
            .finish_non_exhaustive()
    }
}
