//! Administrative CLI for kolbase maintenance operations.
//!
//! The standing replacement for one-off repair scripts: audits, rebuilds,
//! reconciliation, repair-queue draining, and lock cleanup, all against the
//! same storage layer the application uses.

use clap::{Parser, Subcommand};
use kolbase_core::{Config, EntityStore, StoreError};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "kolctl", about = "kolbase maintenance CLI", version)]
struct Cli {
    /// Database directory (can also be set via KOLBASE_DB_PATH)
    #[arg(short, long)]
    db: Option<String>,

    /// Output reports as JSON
    #[arg(short, long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Audit one index for drift between members and live documents
    Audit { kind: String, field: String },
    /// Rebuild one index via versioned build, verify, and atomic swap
    Rebuild { kind: String, field: String },
    /// List duplicate natural keys with merge-priority scores, without mutating
    Duplicates { kind: String },
    /// Merge duplicate entities and sweep invalid key artifacts
    Reconcile { kind: String },
    /// Re-apply queued index repairs and finish interrupted deletes
    Repair { kind: String },
    /// Show one entity by natural key
    Inspect { kind: String, natural_key: String },
    /// Remove expired advisory locks; live locks are refused
    Unlock {
        /// Lock key prefix to sweep
        #[arg(default_value = "lock:")]
        prefix: String,
    },
}

fn main() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "kolbase=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    if let Err(err) = run(cli) {
        eprintln!("error: {}", err);
        std::process::exit(1);
    }
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<(), StoreError> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn run(cli: Cli) -> Result<(), StoreError> {
    let mut config = Config::from_env();
    if let Some(db) = cli.db {
        config.db_path = db;
    }
    let drift_threshold = config.drift_threshold_pct;
    let store = EntityStore::open(config)?;

    match cli.command {
        Commands::Audit { kind, field } => {
            let report = store.run_audit(&kind, &field)?;
            if cli.json {
                print_json(&report)?;
            } else {
                println!(
                    "audit {}:{}  orphans={}  gaps={} (sample {:.0}%)  drift={:.2}%",
                    report.kind,
                    report.field,
                    report.orphaned_members.len(),
                    report.missing_members.len(),
                    100.0 * report.sample_ratio,
                    report.drift_pct()
                );
                if report.exceeds(drift_threshold) {
                    println!(
                        "drift exceeds {:.1}% threshold; run `kolctl rebuild {} {}`",
                        drift_threshold, report.kind, report.field
                    );
                }
            }
        }
        Commands::Rebuild { kind, field } => {
            let report = store.run_rebuild(&kind, &field)?;
            if cli.json {
                print_json(&report)?;
            } else {
                println!(
                    "rebuild {}:{}  {:?}  members {} -> {} (generation g{})",
                    report.kind,
                    report.field,
                    report.status,
                    report.previous_count,
                    report.new_count,
                    report.generation
                );
                if let Some(reason) = &report.failure_reason {
                    println!("rolled back: {}", reason);
                }
            }
        }
        Commands::Duplicates { kind } => {
            let groups = store.find_duplicates(&kind)?;
            if cli.json {
                print_json(&groups)?;
            } else if groups.is_empty() {
                println!("no duplicate natural keys");
            } else {
                for group in &groups {
                    println!("{} ({} members):", group.natural_key, group.members.len());
                    for member in &group.members {
                        println!("  {}  score={}", member.primary_key, member.score);
                    }
                }
            }
        }
        Commands::Reconcile { kind } => {
            let records = store.run_reconciliation(&kind)?;
            if cli.json {
                print_json(&records)?;
            } else {
                println!("merged {} duplicate group(s)", records.len());
                for record in &records {
                    println!(
                        "  {}  survivor={}  removed={}  conflicts={}",
                        record.natural_key,
                        record.survivor,
                        record.removed.len(),
                        record.conflicts.len()
                    );
                }
            }
        }
        Commands::Repair { kind } => {
            let summary = store.run_repair(&kind)?;
            if cli.json {
                print_json(&summary)?;
            } else {
                println!(
                    "repaired {} index entr(ies), finished {} delete(s)",
                    summary.repaired_indexes, summary.finished_deletes
                );
            }
        }
        Commands::Inspect { kind, natural_key } => {
            match store.get_by_natural_key(&kind, &natural_key)? {
                Some(entity) => print_json(&entity)?,
                None => println!("not found"),
            }
        }
        Commands::Unlock { prefix } => {
            let (removed, still_held) = store.sweep_expired_locks(&prefix)?;
            println!(
                "removed {} expired lock(s); {} still held",
                removed, still_held
            );
        }
    }
    Ok(())
}
