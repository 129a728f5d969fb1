use anyhow::{bail, Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use support_funnel::import::parse_date;
use support_funnel::{
    load_roster_csv, AppConfig, Applied, Direction, FacilityConfig, Forward, FunnelService,
    GateResolution, LostReason, MoveRequest, ServiceMode, SqliteStore,
};

#[derive(Debug, Parser)]
#[command(name = "support-funnel", version, about = "Client lifecycle and retention rate tools")]
struct Cli {
    /// JSON config file (database_path, workplace_id)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Write logs to this file instead of stderr
    #[arg(long)]
    log_file: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Save facility capacity and start date
    Init {
        #[arg(long)]
        capacity: u32,
        #[arg(long)]
        start_date: String,
    },
    /// Import clients from a CSV export
    Import { csv: PathBuf },
    /// Retention rate for a fiscal year
    Retention { fiscal_year: i32 },
    /// Lost counter per funnel stage
    Lost,
    /// Show the moves available to a client
    Moves { client_id: String },
    /// Move a client forward or backward
    Move { client_id: String, direction: Direction },
    /// Resolve a gate: onsite | remote | complete:YYYY-MM-DD
    Resolve { client_id: String, resolution: String },
    /// Start follow-up after employment
    FollowUp {
        client_id: String,
        employment_date: String,
        company: String,
    },
    /// Close (lose) a client
    Close {
        client_id: String,
        reason: LostReason,
        details: Option<String>,
    },
    /// Mark a client as retired
    Retire {
        client_id: String,
        /// Also move the client to the RETIRED stage
        #[arg(long)]
        terminal: bool,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.log_file.as_deref())?;

    let config = AppConfig::load(cli.config.as_deref())?;
    let store = SqliteStore::open(&config.database_path)
        .with_context(|| format!("Failed to open store: {:?}", config.database_path))?;
    let service = FunnelService::with_workplace(store, &config.workplace_id);

    run(&service, cli.command)
}

fn init_logging(log_file: Option<&Path>) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("support_funnel=info"));

    if let Some(log_file) = log_file {
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(log_file)
            .context("failed to open log file")?;

        tracing_subscriber::registry()
            .with(filter)
            .with(
                tracing_subscriber::fmt::layer()
                    .with_writer(file)
                    .with_ansi(false),
            )
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init();
    }

    Ok(())
}

fn run(service: &FunnelService<SqliteStore>, command: Command) -> Result<()> {
    match command {
        Command::Init {
            capacity,
            start_date,
        } => {
            let facility = FacilityConfig::new(capacity, parse_date(&start_date)?);
            service.save_facility(&facility)?;
            println!("✓ Facility saved: capacity {}, started {}", capacity, start_date);
        }

        Command::Import { csv } => {
            let clients = load_roster_csv(&csv)?;
            for client in &clients {
                service.add_client(client)?;
            }
            println!("✓ Imported {} clients", clients.len());
        }

        Command::Retention { fiscal_year } => {
            let cohort = service.retention(fiscal_year)?;
            println!("📈 {}", cohort.summary());
            for entry in &cohort.breakdown {
                println!("   {}: {}", entry.label, entry.value);
            }
        }

        Command::Lost => {
            let counts = service.lost_counts()?;
            println!("📉 Lost counter");
            for (stage, count) in &counts.counts {
                println!("   {:<12} {}", stage.label(), count);
            }
            if counts.unmapped > 0 {
                println!("   unmapped     {}", counts.unmapped);
            }
        }

        Command::Moves { client_id } => {
            let client = service.load_client(&client_id)?;
            let moves = service.transitions().legal_moves(client.stage);
            println!("{} ({})", client.stage.label(), client.stage);
            println!("   ← {}", describe(moves.backward.map(Forward::Stage)));
            println!("   → {}", describe(moves.forward));
        }

        Command::Move {
            client_id,
            direction,
        } => {
            let from = service.load_client(&client_id)?.stage;
            match service.move_client(&client_id, MoveRequest { from, direction })? {
                Applied::Moved(client) => println!("✓ {} → {}", from, client.stage),
                Applied::Unchanged(client) => println!("· No move, still {}", client.stage),
                Applied::GateOpened { gate, .. } => {
                    println!("⚠️  {:?} gate: run `resolve {} <choice>`", gate, client_id)
                }
            }
        }

        Command::Resolve {
            client_id,
            resolution,
        } => {
            let resolution = parse_resolution(&resolution)?;
            match service.resolve_gate(&client_id, resolution)? {
                Applied::Moved(client) => println!("✓ Now {}", client.stage),
                other => println!("· No change, still {}", other.client().stage),
            }
        }

        Command::FollowUp {
            client_id,
            employment_date,
            company,
        } => {
            let client =
                service.start_follow_up(&client_id, parse_date(&employment_date)?, &company)?;
            println!("✓ {} in follow-up ({})", client_id, client.stage);
        }

        Command::Close {
            client_id,
            reason,
            details,
        } => {
            let client =
                service.close_client(&client_id, None, reason, details.as_deref().unwrap_or(""))?;
            println!(
                "✓ Closed {} (lost at {})",
                client_id,
                client.lost_at_phase.map(|p| p.to_string()).unwrap_or_default()
            );
        }

        Command::Retire {
            client_id,
            terminal,
        } => {
            let client = service.retire_client(&client_id, Utc::now(), terminal)?;
            println!("✓ {} retired (stage {})", client_id, client.stage);
        }
    }

    Ok(())
}

fn describe(forward: Option<Forward>) -> String {
    match forward {
        Some(Forward::Stage(stage)) => format!("{} ({})", stage.label(), stage),
        Some(Forward::Gate(gate)) => format!("{:?} gate", gate),
        None => "-".to_string(),
    }
}

fn parse_resolution(raw: &str) -> Result<GateResolution> {
    if let Some(date) = raw.strip_prefix("complete:") {
        return Ok(GateResolution::Completion(parse_date(date)?));
    }

    match raw.parse::<ServiceMode>() {
        Ok(mode) => Ok(GateResolution::ServiceMode(mode)),
        Err(_) => bail!("Unknown resolution: {} (onsite | remote | complete:YYYY-MM-DD)", raw),
    }
}
