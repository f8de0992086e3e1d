//! oxide-evolve CLI
//!
//! Command-line tool for evolving a database schema to match the declared
//! models.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context};
use clap::{Parser, Subcommand};
use sqlx::sqlite::SqlitePoolOptions;
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;

use oxide_evolution::evolution::next_label;
use oxide_evolution::diff::app_order;
use oxide_evolution::hint::HintedEvolution;
use oxide_evolution::prelude::*;

/// Signature-based schema evolution for Rust.
#[derive(Parser)]
#[command(name = "oxide-evolve")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Database URL (SQLite path or connection string).
    #[arg(short, long, env = "DATABASE_URL", default_value = "sqlite:db.sqlite3")]
    database: String,

    /// Backend used to generate statements.
    #[arg(short, long, env = "OXIDE_BACKEND", default_value = "sqlite")]
    backend: String,

    /// Directory holding one sub-directory of evolution files per app.
    #[arg(short, long, env = "OXIDE_EVOLUTIONS_DIR", default_value = "evolutions")]
    evolutions_dir: PathBuf,

    /// JSON file describing the declared models.
    #[arg(short, long, env = "OXIDE_SIGNATURE", default_value = "signature.json")]
    signature: PathBuf,

    /// Enable verbose output.
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the evolution ledger.
    Init,

    /// Show changes between the last recorded and the declared signature.
    Diff,

    /// Generate starting-point evolutions for the pending changes.
    Hint {
        /// App to generate an evolution for (all if not specified).
        #[arg(short, long)]
        app: Option<String>,

        /// Evolution name, appended to the sequence number.
        #[arg(short, long, default_value = "auto")]
        name: String,

        /// Write the evolutions to the evolutions directory.
        #[arg(short, long)]
        write: bool,
    },

    /// Apply pending evolutions.
    Evolve {
        /// App to evolve (all if not specified).
        #[arg(short, long)]
        app: Option<String>,

        /// Drop the tables and history of deleted applications.
        #[arg(long)]
        purge: bool,

        /// Show SQL without executing (dry run).
        #[arg(long)]
        dry_run: bool,
    },

    /// Show SQL for pending evolutions without executing.
    Sql {
        /// App name (all if not specified).
        #[arg(short, long)]
        app: Option<String>,

        /// Include statements that drop deleted applications.
        #[arg(long)]
        purge: bool,
    },

    /// Show applied evolutions.
    History {
        /// App to show (all if not specified).
        #[arg(short, long)]
        app: Option<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Setup logging
    let log_level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .without_time()
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let backend = backend_by_name(&cli.backend)
        .ok_or_else(|| anyhow!("Unknown backend '{}'", cli.backend))?;
    if backend.name() != "sqlite" && !plans_only(&cli.command) {
        anyhow::bail!(
            "Backend '{}' can only be used with diff, sql and evolve --dry-run",
            backend.name()
        );
    }

    // Connect to database
    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .connect(&cli.database)
        .await
        .with_context(|| format!("Failed to connect to {}", cli.database))?;

    let options = match &cli.command {
        Commands::Evolve { purge, dry_run, .. } => EvolverOptions::new()
            .with_purge(*purge)
            .with_dry_run(*dry_run),
        Commands::Sql { purge, .. } => EvolverOptions::new().with_purge(*purge).with_dry_run(true),
        _ => EvolverOptions::new(),
    };
    let evolver = Evolver::new(backend, SqliteLedger::new(pool.clone()), pool).with_options(options);
    evolver.init().await?;

    match cli.command {
        Commands::Init => {
            info!("Evolution ledger ready.");
        }

        Commands::Diff => {
            let declared = declared_signature(&cli.signature)?;
            let changes = evolver.pending_changes(&declared).await?;
            if changes.is_empty() {
                info!("No changes.");
            } else {
                for mutation in &changes {
                    println!("  {}", mutation.description());
                }
            }
        }

        Commands::Hint { app, name, write } => {
            let declared = declared_signature(&cli.signature)?;
            let hinted = evolver.hint(&declared).await?;
            if hinted.is_empty() {
                info!("No changes.");
                return Ok(());
            }

            let apps: BTreeSet<String> = hinted
                .mutations
                .iter()
                .map(|m| m.mutation.app().to_string())
                .filter(|a| app.as_ref().map_or(true, |wanted| wanted == a))
                .collect();

            for app_name in apps {
                let existing = load_evolutions(&cli.evolutions_dir, &app_name)?;
                let evolution = HintedEvolution {
                    mutations: hinted
                        .mutations
                        .iter()
                        .filter(|m| m.mutation.app() == app_name)
                        .cloned()
                        .collect(),
                }
                .into_evolution(next_label(&existing, &name));

                for note in &evolution.notes {
                    warn!(app = %app_name, "Needs review: {}", note);
                }
                if write {
                    let path = write_evolution(&cli.evolutions_dir, &app_name, &evolution)?;
                    info!(app = %app_name, path = %path.display(), "Wrote evolution");
                } else {
                    println!("{}", evolution.to_json()?);
                }
            }
        }

        Commands::Evolve { app, dry_run, .. } => {
            let declared = declared_signature(&cli.signature)?;
            let base = evolver.base_signature().await?;

            for app_name in target_apps(app, &declared, &base) {
                let evolutions = load_evolutions(&cli.evolutions_dir, &app_name)?;
                match evolver.evolve(&app_name, &evolutions, &declared).await? {
                    EvolveOutcome::Applied(report) => {
                        if dry_run {
                            print_statements(&report.statements);
                        }
                        info!(
                            app = %app_name,
                            evolutions = report.labels.len(),
                            statements = report.statements.len(),
                            state = ?report.state,
                            "Evolved"
                        );
                    }
                    EvolveOutcome::AlreadyApplied { .. } => {
                        info!(app = %app_name, "Already up to date.");
                    }
                }
            }
        }

        Commands::Sql { app, .. } => {
            let declared = declared_signature(&cli.signature)?;
            let base = evolver.base_signature().await?;

            for app_name in target_apps(app, &declared, &base) {
                let evolutions = load_evolutions(&cli.evolutions_dir, &app_name)?;
                let report = evolver.simulate(&app_name, &evolutions, &declared).await?;
                if !report.statements.is_empty() {
                    println!("-- {}", app_name);
                    print_statements(&report.statements);
                }
            }
        }

        Commands::History { app } => {
            let records = evolver.ledger().records(app.as_deref()).await?;
            if records.is_empty() {
                info!("No evolutions have been applied yet.");
            } else {
                println!("\nApplied evolutions:");
                println!("{:-<60}", "");
                for record in &records {
                    println!(
                        " [X] {}/{} ({})",
                        record.app,
                        record.label,
                        record.applied_at.format("%Y-%m-%d %H:%M:%S")
                    );
                }
                println!();
            }
        }
    }

    Ok(())
}

/// Whether the command leaves the database untouched apart from the ledger
/// storage.
fn plans_only(command: &Commands) -> bool {
    matches!(
        command,
        Commands::Diff | Commands::Sql { .. } | Commands::Evolve { dry_run: true, .. }
    )
}

fn declared_signature(path: &Path) -> anyhow::Result<ProjectSignature> {
    JsonSignatureSource::new(path)
        .current_signature()
        .with_context(|| format!("Failed to read declared signature from {}", path.display()))
}

/// Apps to evolve: the requested one, or every declared app in dependency
/// order followed by recorded apps that are no longer declared.
fn target_apps(app: Option<String>, declared: &ProjectSignature, base: &ProjectSignature) -> Vec<String> {
    if let Some(app) = app {
        return vec![app];
    }
    let mut apps = app_order(declared);
    apps.extend(
        base.apps
            .keys()
            .filter(|name| !declared.apps.contains_key(*name))
            .cloned(),
    );
    apps
}

fn print_statements(statements: &[String]) {
    for sql in statements {
        println!("{};", sql);
    }
}
