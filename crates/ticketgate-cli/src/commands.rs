//! Subcommand implementations.
//!
//! Each command returns the JSON document `main` prints, so the commands can
//! be exercised without capturing stdout.

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use serde_json::{Value, json};
use ticketgate_core::config::EngineConfig;
use ticketgate_core::forensics::{FraudRecordStore, SqliteFraudStore};
use ticketgate_core::geo::GeoPoint;
use ticketgate_core::{Clock, Database, RedemptionEngine, RedemptionRequest};

/// An open database and the engine built over it.
pub struct Session {
    db: Database,
    engine: RedemptionEngine,
}

impl Session {
    /// Opens the configured database, creating it if needed.
    pub fn open(config: EngineConfig, clock: Arc<dyn Clock>) -> Result<Self> {
        let path = config.database.path.clone();
        let db = Database::open(&path, config.database.busy_timeout())
            .with_context(|| format!("failed to open database {}", path.display()))?;
        let engine = RedemptionEngine::sqlite(&db, config, clock);
        Ok(Self { db, engine })
    }
}

/// Creates the database and optionally writes a default config file.
pub fn init(session: &Session, write_config: Option<&Path>) -> Result<Value> {
    let wal = session
        .db
        .verify_wal_mode()
        .context("failed to query journal mode")?;

    if let Some(path) = write_config {
        if path.exists() {
            bail!("refusing to overwrite existing config {}", path.display());
        }
        let toml = session
            .engine
            .config()
            .to_toml()
            .context("failed to serialize config")?;
        std::fs::write(path, toml)
            .with_context(|| format!("failed to write config {}", path.display()))?;
    }

    Ok(json!({
        "database": session.db.path(),
        "wal": wal,
        "config_written": write_config,
    }))
}

/// Adds credits to a holder.
pub fn credit(session: &Session, holder_id: &str, amount: u64) -> Result<Value> {
    let entry = session
        .engine
        .stores()
        .ledger
        .credit(holder_id, amount)
        .with_context(|| format!("failed to credit {holder_id}"))?;
    Ok(serde_json::to_value(entry)?)
}

/// Shows a holder's balance and outstanding tickets.
pub fn balance(session: &Session, holder_id: &str) -> Result<Value> {
    let stores = session.engine.stores();
    let entry = stores
        .ledger
        .balance(holder_id)
        .context("failed to read balance")?;
    let outstanding = stores
        .tickets
        .count_outstanding(holder_id)
        .context("failed to count tickets")?;

    Ok(json!({
        "holder_id": entry.holder_id,
        "credit_count": entry.credit_count,
        "total_redeemed_count": entry.total_redeemed_count,
        "outstanding_tickets": outstanding,
    }))
}

/// Issues a ticket against the holder's credit.
pub fn issue(session: &Session, holder_id: &str) -> Result<Value> {
    let ticket = session
        .engine
        .issuer()
        .issue(holder_id)
        .with_context(|| format!("failed to issue ticket to {holder_id}"))?;

    Ok(json!({
        "ticket": ticket,
        "short_code": ticket.short_code(),
    }))
}

/// Shows a ticket with its transfer history and fraud attempts.
pub fn show(session: &Session, ticket_id: &str) -> Result<Value> {
    let tickets = &session.engine.stores().tickets;
    let ticket = tickets
        .get(ticket_id)
        .with_context(|| format!("failed to load ticket {ticket_id}"))?;
    let transfers = tickets
        .transfers_for(ticket_id)
        .context("failed to load transfer history")?;
    let fraud_attempts = SqliteFraudStore::from_database(&session.db)
        .attempts_for_ticket(ticket_id)
        .context("failed to load fraud attempts")?;

    Ok(json!({
        "short_code": ticket.short_code(),
        "ticket": ticket,
        "transfers": transfers,
        "fraud_attempts": fraud_attempts,
    }))
}

/// Starts a transfer on behalf of the holder.
pub fn transfer(session: &Session, ticket_id: &str, requester_id: &str) -> Result<Value> {
    let grant = session
        .engine
        .transfers()
        .begin_transfer(ticket_id, requester_id)
        .with_context(|| format!("failed to transfer ticket {ticket_id}"))?;
    Ok(serde_json::to_value(grant)?)
}

/// Presents a token for redemption.
pub fn redeem(
    session: &Session,
    token: &str,
    context_id: &str,
    route_id: Option<String>,
    location: Option<(f64, f64)>,
) -> Result<Value> {
    let request = RedemptionRequest {
        ticket_token: token.to_string(),
        geolocation: location.map(|(lat, lon)| GeoPoint::new(lat, lon)),
        context_id: context_id.to_string(),
        route_id,
    };

    let response = session
        .engine
        .redeem(&request)
        .context("redemption failed")?;
    Ok(serde_json::to_value(response)?)
}

/// Reclaims every overdue transfer.
pub fn sweep(session: &Session) -> Result<Value> {
    let reclaimed = session
        .engine
        .transfers()
        .sweep_expired()
        .context("failed to sweep transfers")?;
    Ok(json!({ "reclaimed": reclaimed }))
}

/// Shows a context's operating-day counters.
pub fn daily(session: &Session, context_id: &str) -> Result<Value> {
    let counters = session
        .engine
        .daily_counters(context_id)
        .with_context(|| format!("failed to count redemptions for {context_id}"))?;

    Ok(json!({
        "context_id": context_id,
        "since": counters.since,
        "daily_context_count": counters.count,
        "daily_context_total": counters.total,
    }))
}
