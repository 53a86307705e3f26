//! oxide-reconcile CLI
//!
//! Command-line tool for reconciling a SQLite database with descriptor files.

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use clap::{Parser, Subcommand};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;

use oxide_reconcile::prelude::*;

/// Declarative schema reconciliation for SQLite.
#[derive(Parser)]
#[command(name = "oxide-reconcile")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Database URL (SQLite path or connection string).
    #[arg(short, long, env = "DATABASE_URL", default_value = "sqlite:db.sqlite3")]
    database: String,

    /// Enable verbose output.
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Bring the database in line with a descriptor file.
    Migrate {
        /// JSON file holding a list of table descriptors.
        #[arg(short, long)]
        schema: PathBuf,

        /// Drop live tables the file does not declare.
        #[arg(long)]
        allow_drop: bool,

        /// Plan and trace without applying (dry run).
        #[arg(long)]
        dry_run: bool,

        /// Give up after waiting this many seconds for another run.
        #[arg(long)]
        lock_timeout_secs: Option<u64>,
    },

    /// Show the steps and SQL a descriptor file would need.
    Plan {
        /// JSON file holding a list of table descriptors.
        #[arg(short, long)]
        schema: PathBuf,

        /// Plan drops of live tables the file does not declare.
        #[arg(long)]
        allow_drop: bool,
    },

    /// Print the live schema as descriptor JSON.
    Inspect,

    /// List stored table fingerprints.
    Status,
}

fn load_schema(path: &Path) -> Result<Vec<TableDescriptor>> {
    let text = std::fs::read_to_string(path)?;
    let tables: Vec<TableDescriptor> = serde_json::from_str(&text)?;
    SchemaSet::from(tables.clone()).validate()?;
    Ok(tables)
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

    // Connect to database
    let options = SqliteConnectOptions::from_str(&cli.database)?.create_if_missing(true);
    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .connect_with(options)
        .await?;

    let engine = MigrationEngine::new(pool);

    match cli.command {
        Commands::Migrate {
            schema,
            allow_drop,
            dry_run,
            lock_timeout_secs,
        } => {
            let tables = load_schema(&schema)?;
            info!(tables = tables.len(), file = %schema.display(), "Loaded descriptors");

            let mut options = MigrateOptions::new()
                .allow_destructive_drop(allow_drop)
                .dry_run(dry_run)
                .trace_listener(TracingListener);
            if let Some(secs) = lock_timeout_secs {
                options = options.lock_timeout(Duration::from_secs(secs));
            }

            match engine.migrate(&tables, options).await {
                Ok(report) if report.is_noop() => info!("Database is up to date."),
                Ok(report) if report.dry_run => {
                    info!(steps = report.plan.len(), "Dry run complete, nothing applied.");
                }
                Ok(report) => {
                    info!(
                        steps = report.plan.len(),
                        dropped = report.tables_dropped.len(),
                        "Migration applied successfully."
                    );
                }
                Err(err) => {
                    for event in err.trace().iter().filter(|e| !e.is_success()) {
                        for sql in &event.statements {
                            warn!(table = %event.table_name, sql = %sql, "Attempted");
                        }
                    }
                    return Err(err.into());
                }
            }
        }

        Commands::Plan { schema, allow_drop } => {
            let tables = load_schema(&schema)?;
            let plan = engine
                .plan(
                    &tables,
                    MigrateOptions::new().allow_destructive_drop(allow_drop),
                )
                .await?;

            if plan.is_empty() {
                info!("No changes.");
            } else {
                let dialect = SqliteDialect::new();
                for step in &plan {
                    if step.is_destructive() {
                        println!("-- {step} [destructive]");
                    } else {
                        println!("-- {step}");
                    }
                    for sql in dialect.generate_sql(step) {
                        println!("{sql};");
                    }
                }
            }
        }

        Commands::Inspect => {
            let live = engine.inspect().await?;
            let tables: Vec<TableDescriptor> = live.into_values().collect();
            println!("{}", serde_json::to_string_pretty(&tables)?);
        }

        Commands::Status => {
            let records = engine.fingerprints().await?;

            if records.is_empty() {
                info!("No tables have been reconciled yet.");
            } else {
                println!("\nReconciled tables:");
                println!("{:-<60}", "");

                for record in &records {
                    println!(
                        " {:<30} {} ({})",
                        record.table_name,
                        &record.fingerprint.to_hex()[..16],
                        record.updated_at.format("%Y-%m-%d %H:%M:%S")
                    );
                }
                println!();
            }
        }
    }

    Ok(())
}
