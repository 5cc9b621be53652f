//! # LeadSearch CLI (`leads`)
//!
//! The `leads` binary drives the whole system: database initialization,
//! archive ingestion, hybrid search, deferred vectorization, and stats.
//!
//! ## Usage
//!
//! ```bash
//! leads --config ./config/leads.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `leads init` | Create the SQLite database and run schema migrations |
//! | `leads ingest <zip>` | Stream a zipped dataset into the store |
//! | `leads search "<query>"` | Hybrid (lexical + vector) search |
//! | `leads vectors pending` | Embed the stored-but-unvectorized backlog |
//! | `leads vectors rebuild` | Delete and regenerate the vector index |
//! | `leads stats` | Row counts, vector coverage, ledger |

mod archive;
mod config;
mod db;
mod embedding;
mod error;
mod ingest;
mod migrate;
mod models;
mod normalize;
mod progress;
mod search;
mod stats;
mod store;
mod vector_index;
mod vectors;

use clap::{Parser, Subcommand};
use std::path::PathBuf;

use crate::progress::ProgressMode;

/// LeadSearch — ingest zipped lead spreadsheets and search them with
/// fused lexical + vector ranking.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file. See `config/leads.example.toml` for a full example.
#[derive(Parser)]
#[command(
    name = "leads",
    about = "LeadSearch — batched ingestion and hybrid retrieval for lead datasets",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/leads.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema.
    ///
    /// Creates the SQLite database file and all required tables (leads,
    /// leads_fts, processed_files, meta). Idempotent — running it multiple
    /// times is safe.
    Init,

    /// Ingest a zipped dataset.
    ///
    /// Streams CSV/XLSX members out of the archive, normalizes rows into
    /// the canonical schema, commits them in transactional batches, and
    /// (unless `--no-vectors`) embeds each batch into the vector index.
    /// Files already recorded in the completion ledger are skipped, so an
    /// interrupted run resumes where it left off.
    Ingest {
        /// Path to the zip archive.
        zip: PathBuf,

        /// Dataset name recorded on every row (used for filtering).
        #[arg(long)]
        dataset: String,

        /// Glob selecting archive members (default from config,
        /// e.g. `*.{csv,xlsx}`).
        #[arg(long)]
        pattern: Option<String>,

        /// Stop each file after this many rows (smoke-testing).
        #[arg(long)]
        limit: Option<u64>,

        /// Skip embedding; vectors can be backfilled later with
        /// `leads vectors pending`.
        #[arg(long)]
        no_vectors: bool,

        /// Progress output on stderr: off, human, or json.
        /// Defaults to human when stderr is a TTY.
        #[arg(long)]
        progress: Option<String>,
    },

    /// Search ingested rows.
    ///
    /// Runs the lexical and vector paths concurrently, fuses the two
    /// rankings, applies filters, and prints the top results with fused
    /// and per-path scores.
    Search {
        /// The search query.
        query: String,

        /// Results to return.
        #[arg(long)]
        k: Option<i64>,

        /// Search mode: `hybrid` (default), `lexical`, or `vector`.
        #[arg(long, default_value = "hybrid")]
        mode: String,

        /// Fusion strategy override: `weighted` or `rrf`.
        #[arg(long)]
        fusion: Option<String>,

        /// Restrict to one or more datasets (repeatable).
        #[arg(long = "dataset")]
        datasets: Vec<String>,

        /// Keep only rows with this category (case-insensitive).
        #[arg(long)]
        category: Option<String>,

        /// Keep only rows with at least this many followers.
        #[arg(long)]
        min_followers: Option<i64>,
    },

    /// Manage the vector index.
    Vectors {
        #[command(subcommand)]
        action: VectorsAction,
    },

    /// Show row counts, vector coverage, and the completion ledger.
    Stats,
}

/// Vector index subcommands.
#[derive(Subcommand)]
enum VectorsAction {
    /// Embed rows that were stored without vectors.
    ///
    /// Processes the backlog above the vectorization watermark in batches;
    /// safe to interrupt and re-run.
    Pending {
        /// Maximum rows to vectorize in this run.
        #[arg(long)]
        limit: Option<u64>,

        /// Show the backlog size without embedding anything.
        #[arg(long)]
        dry_run: bool,
    },

    /// Delete and regenerate the whole index.
    ///
    /// The supported correction path after changing embedding models or
    /// fixing bad rows — the index itself is append-only.
    Rebuild,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
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
        Commands::Ingest {
            zip,
            dataset,
            pattern,
            limit,
            no_vectors,
            progress,
        } => {
            let progress = match progress.as_deref() {
                None => ProgressMode::default_for_tty(),
                Some("off") => ProgressMode::Off,
                Some("human") => ProgressMode::Human,
                Some("json") => ProgressMode::Json,
                Some(other) => anyhow::bail!(
                    "Unknown progress mode: {}. Use off, human, or json.",
                    other
                ),
            };
            ingest::run_ingest(
                &cfg,
                ingest::IngestOptions {
                    zip_path: zip,
                    dataset,
                    pattern,
                    limit,
                    no_vectors,
                    progress,
                },
            )
            .await?;
        }
        Commands::Search {
            query,
            k,
            mode,
            fusion,
            datasets,
            category,
            min_followers,
        } => {
            search::run_search(
                &cfg,
                &query,
                &mode,
                k,
                fusion,
                datasets,
                category,
                min_followers,
            )
            .await?;
        }
        Commands::Vectors { action } => match action {
            VectorsAction::Pending { limit, dry_run } => {
                vectors::run_vectors_pending(&cfg, limit, dry_run).await?;
            }
            VectorsAction::Rebuild => {
                vectors::run_vectors_rebuild(&cfg).await?;
            }
        },
        Commands::Stats => {
            stats::run_stats(&cfg).await?;
        }
    }

    Ok(())
}
