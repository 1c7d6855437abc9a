//! # mailtrace CLI
//!
//! ## Usage
//!
//! ```bash
//! mailtrace --config ./config/mailtrace.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `mailtrace init` | Create the SQLite database and run schema migrations |
//! | `mailtrace process <paths...>` | Run one batch over JSON message records |
//! | `mailtrace rules <path>` | Evaluate the rule catalog against one record |
//! | `mailtrace health` | Probe the configured generative backend |
//! | `mailtrace stats` | Show persisted totals and open anomalies |
//! | `mailtrace audit-export <out>` | Export the audit log as a JSON array |
//!
//! Logs go to stderr and are filtered with `RUST_LOG` (default `info`).

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

use mailtrace::audit::AuditLog;
use mailtrace::config;
use mailtrace::db;
use mailtrace::generator::create_adapter;
use mailtrace::migrate;
use mailtrace::models::Message;
use mailtrace::parser::{load_raw_emails, JsonRecordParser, MessageParser, RawEmail};
use mailtrace::pipeline::Pipeline;
use mailtrace::report;
use mailtrace::rules::RuleEvaluator;
use mailtrace::stats;
use mailtrace::store::sqlite::SqliteStore;

/// mailtrace — traceable action-item extraction from e-mail.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file.
#[derive(Parser)]
#[command(
    name = "mailtrace",
    about = "mailtrace — traceable action-item extraction from e-mail",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/mailtrace.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema. Idempotent.
    Init,

    /// Process message records as one batch.
    ///
    /// Each path is a JSON record, a JSON array of records, or a directory
    /// walked for `*.json`.
    Process {
        #[arg(required = true)]
        paths: Vec<PathBuf>,

        /// Print the batch outcome as JSON instead of a report.
        #[arg(long)]
        json: bool,
    },

    /// Run the rule catalog against a single record and print the result.
    Rules { path: PathBuf },

    /// Check that the configured generative backend is reachable.
    Health,

    /// Show persisted totals.
    Stats,

    /// Export the audit log to a JSON file.
    AuditExport { output: PathBuf },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let cfg = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Init => {
            migrate::run_migrations(&cfg).await?;
            println!("Database initialized successfully.");
        }
        Commands::Process { paths, json } => {
            let raws = load_raw_emails(&paths)?;

            let pool = db::connect(&cfg).await?;
            migrate::migrate_pool(&pool).await?;
            let store = Arc::new(SqliteStore::new(pool.clone()));
            let pipeline = Pipeline::from_config(&cfg, store)?;

            let outcome = pipeline.process_batch(&raws).await;
            pool.close().await;

            if json {
                println!("{}", serde_json::to_string_pretty(&outcome)?);
            } else {
                println!(
                    "Processed {} of {} messages ({} skipped: {} unparseable, {} same-batch, {} cross-batch duplicates)",
                    outcome.processed_emails,
                    outcome.total_emails,
                    outcome.skipped_emails,
                    outcome.parse_failures,
                    outcome.same_batch_duplicates,
                    outcome.cross_batch_duplicates,
                );
                println!(
                    "Message-ID extraction rate: {:.0}%",
                    outcome.message_id_extraction_rate * 100.0
                );
                if outcome.degraded {
                    println!("Generative output failed validation; items are degraded.");
                }
                println!();
                for item in &outcome.items {
                    println!("{}", report::format_item(item, &outcome.sources));
                }
                println!();
                println!(
                    "{} item(s), {} anomaly record(s), {} ms",
                    outcome.items.len(),
                    outcome.anomalies,
                    outcome.elapsed_ms
                );
            }

            if !outcome.success {
                bail!(
                    "batch failed: {}",
                    outcome.error.unwrap_or_else(|| "unknown error".to_string())
                );
            }
        }
        Commands::Rules { path } => {
            let content = std::fs::read_to_string(&path)
                .with_context(|| format!("Failed to read message file: {}", path.display()))?;
            let record =
                JsonRecordParser.parse(&RawEmail::new(path.display().to_string(), content))?;
            let message = Message::from_record(record, cfg.pipeline.max_body_bytes);
            let evaluator = RuleEvaluator::from_config(&cfg.sandbox)?;
            let result = evaluator.execute(&message).await?;
            println!("{}", serde_json::to_string_pretty(&result)?);
        }
        Commands::Health => {
            let adapter = create_adapter(&cfg.generator)?;
            adapter.health_check().await.with_context(|| {
                format!(
                    "{} backend ({}) is not healthy",
                    adapter.backend(),
                    adapter.model_name()
                )
            })?;
            println!(
                "{} backend ok: {}",
                adapter.backend(),
                adapter.model_name()
            );
        }
        Commands::Stats => {
            stats::run_stats(&cfg).await?;
        }
        Commands::AuditExport { output } => {
            let Some(path) = &cfg.audit.path else {
                bail!("audit.path is not configured");
            };
            let n = AuditLog::open(path)?.export(&output)?;
            println!("Exported {} event(s) to {}", n, output.display());
        }
    }

    Ok(())
}
