//! ticketgate - operator CLI for the ticket redemption engine.
//!
//! Every subcommand opens the configured `SQLite` database, performs one
//! operation and prints the result as JSON on stdout. Logs go to stderr.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use ticketgate_core::config::EngineConfig;
use ticketgate_core::SystemClock;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

mod commands;

/// ticketgate - single-use ticket redemption
#[derive(Parser, Debug)]
#[command(name = "ticketgate")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Path to engine configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Path to the database file (overrides the configuration)
    #[arg(long)]
    db: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "warn")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    // === Setup ===
    /// Create the database
    Init {
        /// Also write the effective configuration to this path
        #[arg(long)]
        write_config: Option<PathBuf>,
    },

    // === Accounts ===
    /// Add prepaid credits to a holder
    Credit {
        /// Holder account
        #[arg(long)]
        holder: String,

        /// Number of credits
        #[arg(long)]
        amount: u64,
    },

    /// Show a holder's balance
    Balance {
        /// Holder account
        #[arg(long)]
        holder: String,
    },

    // === Tickets ===
    /// Issue a ticket against the holder's credit
    Issue {
        /// Holder account
        #[arg(long)]
        holder: String,
    },

    /// Show a ticket with its transfer and fraud history
    Show {
        /// Ticket id
        #[arg(long)]
        ticket: String,
    },

    /// Hand a ticket to someone else for the transfer window
    Transfer {
        /// Ticket id
        #[arg(long)]
        ticket: String,

        /// Holder requesting the transfer
        #[arg(long)]
        requester: String,
    },

    // === Redemption ===
    /// Present a ticket id or transfer token
    Redeem {
        /// Ticket id or transfer token
        #[arg(long)]
        token: String,

        /// Redeeming context (vehicle, terminal)
        #[arg(long)]
        context: String,

        /// Route served by the context
        #[arg(long)]
        route: Option<String>,

        /// Latitude in degrees
        #[arg(long, requires = "lon", allow_negative_numbers = true)]
        lat: Option<f64>,

        /// Longitude in degrees
        #[arg(long, requires = "lat", allow_negative_numbers = true)]
        lon: Option<f64>,
    },

    /// Reclaim every overdue transfer
    Sweep,

    /// Show a context's redemptions for its current operating day
    Daily {
        /// Redeeming context
        #[arg(long)]
        context: String,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = EnvFilter::try_new(&cli.log_level).unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_writer(std::io::stderr),
        )
        .init();

    let config = load_config(cli.config.as_deref(), cli.db)?;
    tracing::debug!(database = %config.database.path.display(), "opening database");
    let session = commands::Session::open(config, Arc::new(SystemClock))?;

    let output = match cli.command {
        Commands::Init { write_config } => commands::init(&session, write_config.as_deref()),
        Commands::Credit { holder, amount } => commands::credit(&session, &holder, amount),
        Commands::Balance { holder } => commands::balance(&session, &holder),
        Commands::Issue { holder } => commands::issue(&session, &holder),
        Commands::Show { ticket } => commands::show(&session, &ticket),
        Commands::Transfer { ticket, requester } => {
            commands::transfer(&session, &ticket, &requester)
        },
        Commands::Redeem {
            token,
            context,
            route,
            lat,
            lon,
        } => commands::redeem(&session, &token, &context, route, lat.zip(lon)),
        Commands::Sweep => commands::sweep(&session),
        Commands::Daily { context } => commands::daily(&session, &context),
    }?;

    println!(
        "{}",
        serde_json::to_string_pretty(&output).context("failed to render output")?
    );
    Ok(())
}

/// Loads the configuration file, if any, and applies the `--db` override.
fn load_config(path: Option<&Path>, db: Option<PathBuf>) -> Result<EngineConfig> {
    let mut config = match path {
        Some(path) => EngineConfig::from_file(path)
            .with_context(|| format!("failed to load config {}", path.display()))?,
        None => EngineConfig::default(),
    };

    if let Some(db) = db {
        config.database.path = db;
    }
    Ok(config)
}
