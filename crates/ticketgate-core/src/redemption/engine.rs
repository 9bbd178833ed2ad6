//! The redemption state machine.

use std::sync::Arc;

use thiserror::Error;

use super::response::{RedemptionReceipt, RedemptionRequest, RedemptionResponse, RejectionKind};
use crate::account::{AccountError, AccountLedger, SqliteAccountLedger};
use crate::clock::Clock;
use crate::config::EngineConfig;
use crate::db::{Database, StoreError};
use crate::forensics::{FraudRecordStore, FraudScorer, SqliteFraudStore};
use crate::geo::GeoPoint;
use crate::issuance::TicketIssuer;
use crate::ticket::{
    RedemptionEvidence, SqliteTicketStore, Ticket, TicketError, TicketState, TicketStore, Transition,
};
use crate::transfer::{ReclaimOutcome, TransferError, TransferManager};
use crate::validation::{
    self, DailyCounters, SqliteValidationLog, ValidationEntry, ValidationLog, ValidationResult,
};

/// Infrastructure failures during redemption.
///
/// Business outcomes (`invalid`, `inactive`, `expired_transfer`, fraud) are
/// [`RedemptionResponse`] values, never errors.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum RedemptionError {
    /// Storage failure.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Ticket store failure.
    #[error(transparent)]
    Ticket(#[from] TicketError),

    /// Transfer reclaim failure.
    #[error(transparent)]
    Transfer(#[from] TransferError),

    /// The ticket was redeemed but the holder's ledger could not be
    /// debited. The `valid` log entry is written before this is returned,
    /// so the redemption can be reconciled against the ledger.
    #[error("ticket {ticket_id} redeemed but the ledger debit failed")]
    DebitFailed {
        /// The redeemed ticket.
        ticket_id: String,
        /// Why the debit failed.
        source: AccountError,
    },
}

/// The storage seams the engine is built from.
#[derive(Clone)]
pub struct EngineStores {
    /// Ticket rows.
    pub tickets: Arc<dyn TicketStore>,
    /// Holder balances.
    pub ledger: Arc<dyn AccountLedger>,
    /// Fraud attempts.
    pub fraud: Arc<dyn FraudRecordStore>,
    /// Redemption attempts.
    pub log: Arc<dyn ValidationLog>,
}

impl EngineStores {
    /// `SQLite` stores sharing `db`'s connection.
    #[must_use]
    pub fn sqlite(db: &Database) -> Self {
        Self {
            tickets: Arc::new(SqliteTicketStore::from_database(db)),
            ledger: Arc::new(SqliteAccountLedger::from_database(db)),
            fraud: Arc::new(SqliteFraudStore::from_database(db)),
            log: Arc::new(SqliteValidationLog::from_database(db)),
        }
    }
}

impl std::fmt::Debug for EngineStores {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineStores").finish_non_exhaustive()
    }
}

/// How a presented token resolved.
struct Resolved {
    ticket: Ticket,
    /// Set when the token was a transfer token rather than the ticket id.
    via_transfer: Option<String>,
}

/// Redeems tickets exactly once.
///
/// The engine holds no per-ticket state. Whether a request wins a ticket is
/// decided by a single compare-and-swap in the ticket store; a lost swap
/// sends the request down the fraud path rather than retrying it.
pub struct RedemptionEngine {
    stores: EngineStores,
    scorer: FraudScorer,
    transfers: TransferManager,
    clock: Arc<dyn Clock>,
    config: EngineConfig,
}

impl RedemptionEngine {
    /// Creates an engine over the given stores.
    #[must_use]
    pub fn new(stores: EngineStores, config: EngineConfig, clock: Arc<dyn Clock>) -> Self {
        let scorer = FraudScorer::new(Arc::clone(&stores.fraud), config.severity.clone());
        let transfers = TransferManager::new(
            Arc::clone(&stores.tickets),
            Arc::clone(&clock),
            config.transfer.window(),
        );

        Self {
            stores,
            scorer,
            transfers,
            clock,
            config,
        }
    }

    /// Creates an engine over `SQLite` stores sharing `db`'s connection.
    #[must_use]
    pub fn sqlite(db: &Database, config: EngineConfig, clock: Arc<dyn Clock>) -> Self {
        Self::new(EngineStores::sqlite(db), config, clock)
    }

    /// The stores this engine reads and writes.
    #[must_use]
    pub const fn stores(&self) -> &EngineStores {
        &self.stores
    }

    /// The transfer manager, sharing this engine's clock and window.
    #[must_use]
    pub const fn transfers(&self) -> &TransferManager {
        &self.transfers
    }

    /// Active configuration.
    #[must_use]
    pub const fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// An issuer over this engine's stores.
    #[must_use]
    pub fn issuer(&self) -> TicketIssuer {
        TicketIssuer::new(
            Arc::clone(&self.stores.tickets),
            Arc::clone(&self.stores.ledger),
            Arc::clone(&self.clock),
        )
    }

    /// Operating-day counters for a context, as of now.
    ///
    /// # Errors
    ///
    /// Returns an error if the validation log cannot be queried.
    pub fn daily_counters(&self, context_id: &str) -> Result<DailyCounters, StoreError> {
        validation::daily_counters(
            self.stores.log.as_ref(),
            context_id,
            self.clock.now(),
            self.config.day_offset_for(context_id),
            self.config.redemption.fare_amount,
        )
    }

    /// Processes one redemption attempt.
    ///
    /// Every attempt is appended to the validation log, whatever its
    /// outcome.
    ///
    /// # Errors
    ///
    /// Returns an error only for storage failures. Refusals and fraud are
    /// reported through [`RedemptionResponse`].
    pub fn redeem(&self, request: &RedemptionRequest) -> Result<RedemptionResponse, RedemptionError> {
        let now = self.clock.now();
        let attempt = RedemptionEvidence {
            used_at: now,
            context_id: request.context_id.clone(),
            route_id: request.route_id.clone(),
            location: accepted_location(request),
        };
        let token = request.ticket_token.as_str();

        let Some(Resolved {
            mut ticket,
            via_transfer,
        }) = self.resolve(token)?
        else {
            return self.reject(
                None,
                token,
                &attempt,
                RejectionKind::Invalid,
                "ticket not found".to_string(),
            );
        };

        if ticket.transfer_expired_at(now) {
            let outcome = self.transfers.reclaim_if_expired(&ticket.id)?;
            tracing::debug!(ticket_id = %ticket.id, ?outcome, "lazy transfer reclaim");
            // A transfer token is refused below with its own entry; the
            // holder's id carries on, so the reclaim is logged here.
            if outcome == ReclaimOutcome::Reclaimed && via_transfer.is_none() {
                self.append(Some(&ticket.id), token, &attempt, ValidationResult::ExpiredTransfer)?;
            }
            ticket = self.lookup(|| self.stores.tickets.get(&ticket.id))?;
        }

        if let Some(transfer_token) = via_transfer {
            if ticket.state != TicketState::Used && !self.transfer_usable(&transfer_token, &ticket)? {
                return self.reject(
                    Some(&ticket.id),
                    token,
                    &attempt,
                    RejectionKind::ExpiredTransfer,
                    "transfer window has closed; the ticket was returned to its holder".to_string(),
                );
            }
        }

        self.evaluate(ticket, token, attempt)
    }

    /// Routes a resolved ticket to fraud, refusal or the compare-and-swap.
    fn evaluate(
        &self,
        ticket: Ticket,
        token: &str,
        attempt: RedemptionEvidence,
    ) -> Result<RedemptionResponse, RedemptionError> {
        match ticket.state {
            TicketState::Used => self.fraud(&ticket, token, attempt),
            TicketState::Expired => self.reject(
                Some(&ticket.id),
                token,
                &attempt,
                RejectionKind::Inactive,
                inactive_message(ticket.state),
            ),
            TicketState::Active | TicketState::TransferPending => {
                let change = Transition::Redeem(attempt.clone());
                if self.stores.tickets.transition(&ticket.id, ticket.state, &change)? {
                    return self.accept(&ticket, token, &attempt);
                }

                // Lost the swap. Read once to learn why; never retry.
                let current = self.stores.tickets.get(&ticket.id)?;
                if current.state == TicketState::Used {
                    self.fraud(&current, token, attempt)
                } else {
                    self.reject(
                        Some(&current.id),
                        token,
                        &attempt,
                        RejectionKind::Inactive,
                        inactive_message(current.state),
                    )
                }
            },
        }
    }

    fn accept(
        &self,
        ticket: &Ticket,
        token: &str,
        attempt: &RedemptionEvidence,
    ) -> Result<RedemptionResponse, RedemptionError> {
        // The swap already committed, so a failed debit cannot undo the
        // redemption. An empty balance is tolerated; a storage failure is not.
        match self.stores.ledger.debit(&ticket.holder_id) {
            Ok(_) => {},
            Err(err @ AccountError::InsufficientCredit { .. }) => {
                tracing::warn!(
                    ticket_id = %ticket.id,
                    holder_id = %ticket.holder_id,
                    error = %err,
                    "ledger debit refused after redemption"
                );
            },
            Err(source) => {
                tracing::error!(
                    ticket_id = %ticket.id,
                    holder_id = %ticket.holder_id,
                    error = %source,
                    "ledger debit failed after redemption"
                );
                self.append(Some(&ticket.id), token, attempt, ValidationResult::Valid)?;
                return Err(RedemptionError::DebitFailed {
                    ticket_id: ticket.id.clone(),
                    source,
                });
            },
        }

        self.append(Some(&ticket.id), token, attempt, ValidationResult::Valid)?;

        let amount = self.config.redemption.fare_amount;
        let counters = validation::daily_counters(
            self.stores.log.as_ref(),
            &attempt.context_id,
            attempt.used_at,
            self.config.day_offset_for(&attempt.context_id),
            amount,
        )?;

        tracing::info!(
            ticket_id = %ticket.id,
            holder_id = %ticket.holder_id,
            context_id = %attempt.context_id,
            daily_context_count = counters.count,
            "ticket redeemed"
        );

        Ok(RedemptionResponse::Valid(RedemptionReceipt {
            ticket_id: ticket.id.clone(),
            short_code: ticket.short_code(),
            redeemed_at: attempt.used_at,
            amount,
            daily_context_count: counters.count,
            daily_context_total: counters.total,
        }))
    }

    fn fraud(
        &self,
        ticket: &Ticket,
        token: &str,
        attempt: RedemptionEvidence,
    ) -> Result<RedemptionResponse, RedemptionError> {
        let alert = self.scorer.score(ticket, attempt, token)?;
        Ok(RedemptionResponse::Fraud(Box::new(alert)))
    }

    fn reject(
        &self,
        ticket_id: Option<&str>,
        token: &str,
        attempt: &RedemptionEvidence,
        kind: RejectionKind,
        message: String,
    ) -> Result<RedemptionResponse, RedemptionError> {
        let result = match kind {
            RejectionKind::Invalid => ValidationResult::Invalid,
            RejectionKind::Inactive => ValidationResult::Inactive,
            RejectionKind::ExpiredTransfer => ValidationResult::ExpiredTransfer,
        };
        self.append(ticket_id, token, attempt, result)?;

        tracing::debug!(ticket_id, context_id = %attempt.context_id, %kind, "redemption refused");
        Ok(RedemptionResponse::Rejected { kind, message })
    }

    fn append(
        &self,
        ticket_id: Option<&str>,
        token: &str,
        attempt: &RedemptionEvidence,
        result: ValidationResult,
    ) -> Result<u64, StoreError> {
        self.stores.log.append(&ValidationEntry {
            seq_id: None,
            ticket_id: ticket_id.map(str::to_string),
            presented_token: token.to_string(),
            result,
            context_id: attempt.context_id.clone(),
            route_id: attempt.route_id.clone(),
            location: attempt.location,
            recorded_at: attempt.used_at,
        })
    }

    /// Resolves a ticket id or a transfer token.
    fn resolve(&self, token: &str) -> Result<Option<Resolved>, RedemptionError> {
        match self.lookup(|| self.stores.tickets.get(token)) {
            Ok(ticket) => {
                return Ok(Some(Resolved {
                    ticket,
                    via_transfer: None,
                }));
            },
            Err(TicketError::NotFound { .. }) => {},
            Err(err) => return Err(err.into()),
        }

        let Some(transfer) = self.lookup(|| self.stores.tickets.find_transfer(token))? else {
            return Ok(None);
        };

        let ticket = self.lookup(|| self.stores.tickets.get(&transfer.ticket_id))?;
        Ok(Some(Resolved {
            ticket,
            via_transfer: Some(transfer.transfer_token),
        }))
    }

    /// A transfer token redeems only while its own window is the open one.
    fn transfer_usable(&self, transfer_token: &str, ticket: &Ticket) -> Result<bool, RedemptionError> {
        if ticket.state != TicketState::TransferPending {
            return Ok(false);
        }
        let record = self.lookup(|| self.stores.tickets.find_transfer(transfer_token))?;
        Ok(record.is_some_and(|r| r.is_open()))
    }

    /// Runs a read, retrying transient storage failures up to the
    /// configured number of times.
    fn lookup<T>(&self, mut read: impl FnMut() -> Result<T, TicketError>) -> Result<T, TicketError> {
        let mut retries = 0;
        loop {
            match read() {
                Err(TicketError::Store(err))
                    if err.is_transient() && retries < self.config.redemption.lookup_retries =>
                {
                    retries += 1;
                    tracing::debug!(retries, error = %err, "retrying ticket lookup");
                },
                other => return other,
            }
        }
    }
}

impl std::fmt::Debug for RedemptionEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedemptionEngine")
            .field("scorer", &self.scorer)
            .field("transfers", &self.transfers)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

fn accepted_location(request: &RedemptionRequest) -> Option<GeoPoint> {
    let point = request.geolocation?;
    if point.is_valid() {
        return Some(point);
    }
    tracing::warn!(
        context_id = %request.context_id,
        lat = point.lat,
        lon = point.lon,
        "dropping invalid geolocation"
    );
    None
}

fn inactive_message(state: TicketState) -> String {
    format!("ticket is {state} and cannot be redeemed")
}
