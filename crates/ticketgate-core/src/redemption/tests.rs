//! Tests for the redemption engine.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use chrono::{DateTime, Duration, TimeZone, Utc};

use super::*;
use crate::account::{AccountError, AccountLedger, LedgerEntry, SqliteAccountLedger};
use crate::clock::ManualClock;
use crate::config::{ContextConfig, EngineConfig};
use crate::db::{Database, StoreError};
use crate::forensics::Severity;
use crate::geo::GeoPoint;
use crate::ticket::{
    RedemptionEvidence, SqliteTicketStore, Ticket, TicketError, TicketState, TicketStore,
    TransferOutcome, TransferRecord, Transition,
};
use crate::transfer::ReclaimOutcome;
use crate::validation::{ValidationLog, ValidationResult};

fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 3, 1, 15, 0, 0).unwrap()
}

struct Fixture {
    db: Database,
    clock: ManualClock,
    engine: RedemptionEngine,
}

impl Fixture {
    fn new() -> Self {
        Self::with_config(EngineConfig::default())
    }

    fn with_config(config: EngineConfig) -> Self {
        let db = Database::in_memory().expect("failed to create database");
        let clock = ManualClock::new(t0());
        let engine = RedemptionEngine::sqlite(&db, config, Arc::new(clock.clone()));
        Self { db, clock, engine }
    }

    fn with_tickets(tickets: Arc<dyn TicketStore>, db: Database) -> Self {
        let clock = ManualClock::new(t0());
        let mut stores = EngineStores::sqlite(&db);
        stores.tickets = tickets;
        let engine = RedemptionEngine::new(stores, EngineConfig::default(), Arc::new(clock.clone()));
        Self { db, clock, engine }
    }

    /// Credits `credits` and issues one ticket.
    fn issue(&self, holder_id: &str, credits: u64) -> Ticket {
        self.engine.stores().ledger.credit(holder_id, credits).unwrap();
        self.engine.issuer().issue(holder_id).unwrap()
    }

    fn redeem(&self, token: &str, context_id: &str) -> RedemptionResponse {
        self.engine
            .redeem(&RedemptionRequest::new(token, context_id))
            .expect("redeem failed")
    }

    fn ticket(&self, id: &str) -> Ticket {
        self.engine.stores().tickets.get(id).unwrap()
    }

    fn credits(&self, holder_id: &str) -> u64 {
        self.engine.stores().ledger.balance(holder_id).unwrap().credit_count
    }

    fn log_results(&self, ticket_id: &str) -> Vec<ValidationResult> {
        self.engine
            .stores()
            .log
            .entries_for_ticket(ticket_id)
            .unwrap()
            .into_iter()
            .map(|e| e.result)
            .collect()
    }
}

fn kind(response: &RedemptionResponse) -> Option<RejectionKind> {
    match response {
        RedemptionResponse::Rejected { kind, .. } => Some(*kind),
        _ => None,
    }
}

#[test]
fn test_first_redemption_is_valid() {
    let fx = Fixture::new();
    let ticket = fx.issue("holder-1", 3);

    let response = fx
        .engine
        .redeem(
            &RedemptionRequest::new(&ticket.id, "unit-1")
                .with_route("route-7")
                .at(29.0, -110.9),
        )
        .unwrap();

    let receipt = response.receipt().expect("valid receipt");
    assert_eq!(receipt.ticket_id, ticket.id);
    assert_eq!(receipt.short_code, ticket.short_code());
    assert_eq!(receipt.redeemed_at, t0());
    assert_eq!(receipt.amount, 1_000);
    assert_eq!(receipt.daily_context_count, 1);
    assert_eq!(receipt.daily_context_total, 1_000);

    let used = fx.ticket(&ticket.id);
    assert_eq!(used.state, TicketState::Used);
    let evidence = used.redemption.unwrap();
    assert_eq!(evidence.context_id, "unit-1");
    assert_eq!(evidence.route_id.as_deref(), Some("route-7"));
    assert_eq!(evidence.location, Some(GeoPoint::new(29.0, -110.9)));

    assert_eq!(fx.credits("holder-1"), 2);
    assert_eq!(fx.log_results(&ticket.id), vec![ValidationResult::Valid]);
}

#[test]
fn test_unknown_token_is_invalid() {
    let fx = Fixture::new();

    let response = fx.redeem("not-a-ticket", "unit-1");

    assert!(!response.is_valid());
    assert_eq!(kind(&response), Some(RejectionKind::Invalid));
    assert_eq!(response.error_type(), Some("invalid"));
    assert_eq!(fx.engine.daily_counters("unit-1").unwrap().count, 0);
}

#[test]
fn test_second_redemption_is_fraud_and_debits_once() {
    let fx = Fixture::new();
    let ticket = fx.issue("holder-1", 2);

    assert!(fx.redeem(&ticket.id, "unit-1").is_valid());
    fx.clock.advance(Duration::minutes(4));
    let response = fx.redeem(&ticket.id, "unit-1");

    let alert = response.fraud().expect("fraud alert");
    assert!(alert.same_context());
    assert_eq!(alert.record.minutes_elapsed, 4);
    assert_eq!(alert.severity(), Severity::Low);
    assert_eq!(response.error_type(), Some("fraud"));

    assert_eq!(fx.credits("holder-1"), 1);
    assert_eq!(
        fx.engine.stores().ledger.balance("holder-1").unwrap().total_redeemed_count,
        1
    );
    assert_eq!(
        fx.log_results(&ticket.id),
        vec![ValidationResult::Valid, ValidationResult::Fraud]
    );
}

#[test]
fn test_expired_ticket_is_inactive() {
    let fx = Fixture::new();
    let ticket = fx.issue("holder-1", 1);
    fx.engine
        .stores()
        .tickets
        .transition(&ticket.id, TicketState::Active, &Transition::Expire)
        .unwrap();

    let response = fx.redeem(&ticket.id, "unit-1");

    assert_eq!(kind(&response), Some(RejectionKind::Inactive));
    assert_eq!(fx.log_results(&ticket.id), vec![ValidationResult::Inactive]);
    assert_eq!(fx.credits("holder-1"), 1);
}

#[test]
fn test_invalid_geolocation_is_dropped() {
    let fx = Fixture::new();
    let ticket = fx.issue("holder-1", 1);

    for (lat, lon) in [(91.0, 0.0), (0.0, -180.5), (f64::NAN, 0.0)] {
        let request = RedemptionRequest::new(&ticket.id, "unit-1").at(lat, lon);
        let response = fx.engine.redeem(&request).unwrap();
        if response.is_valid() {
            assert!(fx.ticket(&ticket.id).redemption.unwrap().location.is_none());
        } else {
            assert!(response.fraud().unwrap().record.detected.location.is_none());
        }
    }
}

#[test]
fn test_transfer_token_redeems_within_window() {
    let fx = Fixture::new();
    let ticket = fx.issue("holder-1", 1);
    let grant = fx.engine.transfers().begin_transfer(&ticket.id, "holder-1").unwrap();

    fx.clock.advance(Duration::hours(23));
    let response = fx.redeem(&grant.transfer_token, "unit-5");

    assert_eq!(response.receipt().unwrap().ticket_id, ticket.id);
    assert_eq!(fx.credits("holder-1"), 0);

    let history = fx.engine.stores().tickets.transfers_for(&ticket.id).unwrap();
    assert_eq!(history[0].outcome, Some(TransferOutcome::Redeemed));
}

#[test]
fn test_expired_transfer_then_holder_redeems() {
    let fx = Fixture::new();
    let ticket = fx.issue("holder-1", 1);
    let grant = fx.engine.transfers().begin_transfer(&ticket.id, "holder-1").unwrap();

    fx.clock.set(t0() + Duration::hours(25));
    let response = fx.redeem(&grant.transfer_token, "unit-5");
    assert_eq!(kind(&response), Some(RejectionKind::ExpiredTransfer));
    assert_eq!(fx.ticket(&ticket.id).state, TicketState::Active);
    assert_eq!(fx.credits("holder-1"), 1);

    fx.clock.set(t0() + Duration::hours(26));
    assert!(fx.redeem(&ticket.id, "unit-1").is_valid());
    assert_eq!(fx.credits("holder-1"), 0);
    assert_eq!(
        fx.log_results(&ticket.id),
        vec![ValidationResult::ExpiredTransfer, ValidationResult::Valid]
    );
}

#[test]
fn test_holder_id_after_expiry_reclaims_and_redeems() {
    let fx = Fixture::new();
    let ticket = fx.issue("holder-1", 1);
    fx.engine.transfers().begin_transfer(&ticket.id, "holder-1").unwrap();

    fx.clock.advance(Duration::hours(24) + Duration::seconds(1));
    assert!(fx.redeem(&ticket.id, "unit-1").is_valid());

    let history = fx.engine.stores().tickets.transfers_for(&ticket.id).unwrap();
    assert_eq!(history[0].outcome, Some(TransferOutcome::Reclaimed));
    assert_eq!(
        fx.log_results(&ticket.id),
        vec![ValidationResult::ExpiredTransfer, ValidationResult::Valid]
    );
    assert_eq!(fx.engine.daily_counters("unit-1").unwrap().count, 1);
}

#[test]
fn test_transfer_token_after_sweep_is_expired_transfer() {
    let fx = Fixture::new();
    let ticket = fx.issue("holder-1", 1);
    let grant = fx.engine.transfers().begin_transfer(&ticket.id, "holder-1").unwrap();

    fx.clock.advance(Duration::hours(30));
    assert_eq!(fx.engine.transfers().sweep_expired().unwrap(), 1);

    let response = fx.redeem(&grant.transfer_token, "unit-5");
    assert_eq!(kind(&response), Some(RejectionKind::ExpiredTransfer));
}

#[test]
fn test_stale_transfer_token_after_retransfer() {
    let fx = Fixture::new();
    let ticket = fx.issue("holder-1", 1);
    let first = fx.engine.transfers().begin_transfer(&ticket.id, "holder-1").unwrap();

    fx.clock.advance(Duration::hours(25));
    assert_eq!(
        fx.engine.transfers().reclaim_if_expired(&ticket.id).unwrap(),
        ReclaimOutcome::Reclaimed
    );
    let second = fx.engine.transfers().begin_transfer(&ticket.id, "holder-1").unwrap();

    let stale = fx.redeem(&first.transfer_token, "unit-5");
    assert_eq!(kind(&stale), Some(RejectionKind::ExpiredTransfer));
    assert!(fx.redeem(&second.transfer_token, "unit-6").is_valid());
}

#[test]
fn test_transfer_token_on_used_ticket_is_fraud() {
    let fx = Fixture::new();
    let ticket = fx.issue("holder-1", 1);
    let grant = fx.engine.transfers().begin_transfer(&ticket.id, "holder-1").unwrap();

    fx.clock.advance(Duration::hours(25));
    assert!(fx.redeem(&ticket.id, "unit-1").is_valid());

    fx.clock.advance(Duration::minutes(30));
    let response = fx.redeem(&grant.transfer_token, "unit-5");
    let alert = response.fraud().expect("fraud alert");
    assert!(!alert.same_context());
    assert_eq!(alert.record.minutes_elapsed, 30);
}

#[test]
fn test_debit_refusal_still_redeems() {
    let fx = Fixture::new();
    // Issued straight through the store, bypassing the credit check.
    let ticket = fx.engine.stores().tickets.create("holder-1", t0()).unwrap();

    let response = fx.redeem(&ticket.id, "unit-1");

    assert!(response.is_valid());
    assert_eq!(fx.ticket(&ticket.id).state, TicketState::Used);
    assert_eq!(fx.credits("holder-1"), 0);
}

/// Ledger whose debits fail as if the database were unreachable.
struct OfflineLedger {
    inner: SqliteAccountLedger,
}

impl AccountLedger for OfflineLedger {
    fn debit(&self, _holder_id: &str) -> Result<LedgerEntry, AccountError> {
        Err(AccountError::Store(StoreError::LockPoisoned))
    }

    fn credit(&self, holder_id: &str, amount: u64) -> Result<LedgerEntry, AccountError> {
        self.inner.credit(holder_id, amount)
    }

    fn balance(&self, holder_id: &str) -> Result<LedgerEntry, AccountError> {
        self.inner.balance(holder_id)
    }
}

#[test]
fn test_debit_storage_failure_is_reported() {
    let db = Database::in_memory().unwrap();
    let mut stores = EngineStores::sqlite(&db);
    stores.ledger = Arc::new(OfflineLedger {
        inner: SqliteAccountLedger::from_database(&db),
    });
    let clock = ManualClock::new(t0());
    let engine = RedemptionEngine::new(stores, EngineConfig::default(), Arc::new(clock.clone()));
    let fx = Fixture { db, clock, engine };
    let ticket = fx.issue("holder-1", 1);

    let err = fx
        .engine
        .redeem(&RedemptionRequest::new(&ticket.id, "unit-1"))
        .unwrap_err();

    assert!(matches!(
        err,
        RedemptionError::DebitFailed {
            source: AccountError::Store(StoreError::LockPoisoned),
            ..
        }
    ));
    // The ticket is consumed and the redemption is on record for
    // reconciliation; the balance is untouched.
    assert_eq!(fx.ticket(&ticket.id).state, TicketState::Used);
    assert_eq!(fx.log_results(&ticket.id), vec![ValidationResult::Valid]);
    assert_eq!(fx.credits("holder-1"), 1);
}

#[test]
fn test_daily_counters_reset_at_context_midnight() {
    let config = EngineConfig {
        contexts: vec![ContextConfig {
            id: "unit-12".to_string(),
            utc_offset_minutes: -420,
        }],
        ..EngineConfig::default()
    };
    let fx = Fixture::with_config(config);

    // 06:30 UTC is 23:30 the previous day at UTC-7.
    fx.clock.set(Utc.with_ymd_and_hms(2026, 3, 2, 6, 30, 0).unwrap());
    let a = fx.issue("holder-1", 2);
    let b = fx.engine.issuer().issue("holder-1").unwrap();
    assert_eq!(
        fx.redeem(&a.id, "unit-12").receipt().unwrap().daily_context_count,
        1
    );

    // 07:30 UTC is 00:30 local: a new operating day.
    fx.clock.set(Utc.with_ymd_and_hms(2026, 3, 2, 7, 30, 0).unwrap());
    let receipt = fx.redeem(&b.id, "unit-12");
    let receipt = receipt.receipt().unwrap();
    assert_eq!(receipt.daily_context_count, 1);
    assert_eq!(receipt.daily_context_total, 1_000);
}

#[test]
fn test_valid_response_wire_shape() {
    let fx = Fixture::new();
    let ticket = fx.issue("holder-1", 1);

    let json = serde_json::to_value(fx.redeem(&ticket.id, "unit-1")).unwrap();

    assert_eq!(json["valid"], true);
    assert_eq!(json["ticket_id"], ticket.id.as_str());
    assert_eq!(json["short_code"], ticket.short_code().as_str());
    assert_eq!(json["amount"], 1_000);
    assert_eq!(json["daily_context_count"], 1);
    assert_eq!(json["daily_context_total"], 1_000);
    assert!(json.get("error_type").is_none());
}

#[test]
fn test_rejected_response_wire_shape() {
    let fx = Fixture::new();

    let json = serde_json::to_value(fx.redeem("missing", "unit-1")).unwrap();

    assert_eq!(json["valid"], false);
    assert_eq!(json["error_type"], "invalid");
    assert!(json["message"].is_string());
    assert!(json.get("fraud_details").is_none());
}

#[test]
fn test_fraud_response_wire_shape() {
    let fx = Fixture::new();
    let ticket = fx.issue("holder-1", 1);
    fx.engine
        .redeem(&RedemptionRequest::new(&ticket.id, "unit-1").with_route("route-7"))
        .unwrap();
    fx.clock.advance(Duration::minutes(10));

    let json = serde_json::to_value(fx.redeem(&ticket.id, "unit-2")).unwrap();

    assert_eq!(json["valid"], false);
    assert_eq!(json["error_type"], "fraud");
    assert_eq!(json["severity"], "low");
    let details = &json["fraud_details"];
    assert_eq!(details["original_context"], "unit-1");
    assert_eq!(details["original_route"], "route-7");
    assert_eq!(details["minutes_elapsed"], 10);
    assert_eq!(details["same_context"], false);
    assert_eq!(details["holder_total_attempts"], 1);
    assert_eq!(details["ticket_total_attempts"], 1);
    assert!(details.get("distance_km").is_none());
}

#[test]
fn test_request_deserializes_from_wire() {
    let request: RedemptionRequest = serde_json::from_str(
        r#"{"ticket_token":"abc","geolocation":{"lat":29.0,"lon":-110.9},"context_id":"unit-1"}"#,
    )
    .unwrap();

    assert_eq!(request.ticket_token, "abc");
    assert_eq!(request.geolocation, Some(GeoPoint::new(29.0, -110.9)));
    assert!(request.route_id.is_none());
}

/// Ticket store whose first compare-and-swap is pre-empted by a competitor.
struct PreemptedStore {
    inner: SqliteTicketStore,
    competitor: Transition,
    fired: AtomicU32,
}

impl TicketStore for PreemptedStore {
    fn create(&self, holder_id: &str, issued_at: DateTime<Utc>) -> Result<Ticket, TicketError> {
        self.inner.create(holder_id, issued_at)
    }

    fn get(&self, ticket_id: &str) -> Result<Ticket, TicketError> {
        self.inner.get(ticket_id)
    }

    fn transition(
        &self,
        ticket_id: &str,
        expected: TicketState,
        change: &Transition,
    ) -> Result<bool, TicketError> {
        if self.fired.fetch_add(1, Ordering::SeqCst) == 0 {
            assert!(self.inner.transition(ticket_id, expected, &self.competitor)?);
        }
        self.inner.transition(ticket_id, expected, change)
    }

    fn find_transfer(&self, transfer_token: &str) -> Result<Option<TransferRecord>, TicketError> {
        self.inner.find_transfer(transfer_token)
    }

    fn transfers_for(&self, ticket_id: &str) -> Result<Vec<TransferRecord>, TicketError> {
        self.inner.transfers_for(ticket_id)
    }

    fn list_expired_transfers(&self, now: DateTime<Utc>) -> Result<Vec<Ticket>, TicketError> {
        self.inner.list_expired_transfers(now)
    }

    fn count_outstanding(&self, holder_id: &str) -> Result<u64, TicketError> {
        self.inner.count_outstanding(holder_id)
    }
}

fn preempted(competitor: Transition) -> (Fixture, Ticket) {
    let db = Database::in_memory().unwrap();
    let inner = SqliteTicketStore::from_database(&db);
    let ticket = inner.create("holder-1", t0()).unwrap();
    SqliteAccountLedger::from_database(&db).credit("holder-1", 1).unwrap();

    let store = Arc::new(PreemptedStore {
        inner,
        competitor,
        fired: AtomicU32::new(0),
    });
    (Fixture::with_tickets(store, db), ticket)
}

#[test]
fn test_lost_swap_to_redemption_is_fraud() {
    let (fx, ticket) = preempted(Transition::Redeem(RedemptionEvidence {
        used_at: t0(),
        context_id: "unit-9".to_string(),
        route_id: None,
        location: None,
    }));

    let response = fx.redeem(&ticket.id, "unit-1");

    let alert = response.fraud().expect("lost swap goes to forensics");
    assert_eq!(alert.record.original.context_id, "unit-9");
    // The competitor's debit is not simulated; this request must not debit.
    assert_eq!(fx.credits("holder-1"), 1);
    assert_eq!(fx.log_results(&ticket.id), vec![ValidationResult::Fraud]);
}

#[test]
fn test_lost_swap_to_transfer_is_inactive() {
    let (fx, ticket) = preempted(Transition::BeginTransfer {
        transfer_token: "xfer-competitor".to_string(),
        requester_id: "holder-1".to_string(),
        requested_at: t0(),
        expires_at: t0() + Duration::hours(24),
    });

    let response = fx.redeem(&ticket.id, "unit-1");

    assert_eq!(kind(&response), Some(RejectionKind::Inactive));
    assert_eq!(fx.ticket(&ticket.id).state, TicketState::TransferPending);
    assert_eq!(fx.credits("holder-1"), 1);
}

/// Ticket store whose reads fail with `SQLITE_BUSY` a fixed number of times.
struct BusyStore {
    inner: SqliteTicketStore,
    failures_left: AtomicU32,
}

impl BusyStore {
    fn busy() -> TicketError {
        TicketError::Store(StoreError::Database(rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_BUSY),
            None,
        )))
    }
}

impl TicketStore for BusyStore {
    fn create(&self, holder_id: &str, issued_at: DateTime<Utc>) -> Result<Ticket, TicketError> {
        self.inner.create(holder_id, issued_at)
    }

    fn get(&self, ticket_id: &str) -> Result<Ticket, TicketError> {
        let left = self.failures_left.load(Ordering::SeqCst);
        if left > 0 {
            self.failures_left.store(left - 1, Ordering::SeqCst);
            return Err(Self::busy());
        }
        self.inner.get(ticket_id)
    }

    fn transition(
        &self,
        ticket_id: &str,
        expected: TicketState,
        change: &Transition,
    ) -> Result<bool, TicketError> {
        self.inner.transition(ticket_id, expected, change)
    }

    fn find_transfer(&self, transfer_token: &str) -> Result<Option<TransferRecord>, TicketError> {
        self.inner.find_transfer(transfer_token)
    }

    fn transfers_for(&self, ticket_id: &str) -> Result<Vec<TransferRecord>, TicketError> {
        self.inner.transfers_for(ticket_id)
    }

    fn list_expired_transfers(&self, now: DateTime<Utc>) -> Result<Vec<Ticket>, TicketError> {
        self.inner.list_expired_transfers(now)
    }

    fn count_outstanding(&self, holder_id: &str) -> Result<u64, TicketError> {
        self.inner.count_outstanding(holder_id)
    }
}

fn busy_fixture(failures: u32) -> (Fixture, Ticket) {
    let db = Database::in_memory().unwrap();
    let inner = SqliteTicketStore::from_database(&db);
    let ticket = inner.create("holder-1", t0()).unwrap();
    let store = Arc::new(BusyStore {
        inner,
        failures_left: AtomicU32::new(failures),
    });
    (Fixture::with_tickets(store, db), ticket)
}

#[test]
fn test_lookup_retried_once_on_busy() {
    let (fx, ticket) = busy_fixture(1);
    assert!(fx.redeem(&ticket.id, "unit-1").is_valid());
}

#[test]
fn test_lookup_gives_up_after_retry() {
    let (fx, ticket) = busy_fixture(2);

    let err = fx
        .engine
        .redeem(&RedemptionRequest::new(&ticket.id, "unit-1"))
        .unwrap_err();
    assert!(matches!(err, RedemptionError::Ticket(TicketError::Store(_))));

    // Nothing was redeemed or logged.
    assert_eq!(fx.ticket(&ticket.id).state, TicketState::Active);
    assert!(fx.log_results(&ticket.id).is_empty());
    drop(fx.db);
}
