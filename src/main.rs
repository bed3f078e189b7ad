//! # Newsroom CLI (`newsroom`)
//!
//! The `newsroom` binary drives every job of the aggregator backend:
//! database initialization, the source registry, polling, embedding,
//! duplicate clustering and ranking. Jobs are meant to be run from cron.
//!
//! ## Usage
//!
//! ```bash
//! newsroom --config ./config/newsroom.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `newsroom init` | Create the SQLite database and run schema migrations |
//! | `newsroom sources` | List registered sources (`--sync` loads them from config) |
//! | `newsroom poll` | Poll every active, due source |
//! | `newsroom runs` | Show the latest poll audit rows |
//! | `newsroom embed pending` | Embed articles stored since the last run |
//! | `newsroom cluster` | Print near-duplicate article sets as JSON |
//! | `newsroom rank` | Rebuild personalized article lists |
//!
//! Logs go to stderr and are filtered with `RUST_LOG` (default `info`).

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::{fmt as tfmt, EnvFilter};

use newsroom::rank::RankVariant;
use newsroom::{audit, cluster, config, embed_cmd, migrate, poll, rank, sources};

/// Newsroom: feed polling, canonicalization, clustering and ranking.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file. See `config/newsroom.example.toml` for a full example.
#[derive(Parser)]
#[command(
    name = "newsroom",
    about = "Newsroom: feed polling, canonicalization, clustering and ranking for a news aggregator",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/newsroom.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema.
    ///
    /// Idempotent: running it on an existing database is safe.
    Init,

    /// List registered sources.
    Sources {
        /// Upsert the `[[sources]]` entries from the config file first.
        #[arg(long)]
        sync: bool,
    },

    /// Poll every active source whose schedule allows it.
    Poll {
        /// Only consider this source id.
        #[arg(long)]
        source: Option<i64>,
    },

    /// Show the latest poll runs, newest first.
    Runs {
        /// Only show runs for this source id.
        #[arg(long)]
        source: Option<i64>,

        #[arg(long, default_value_t = 20)]
        limit: i64,
    },

    /// Manage article embeddings.
    Embed {
        #[command(subcommand)]
        action: EmbedAction,
    },

    /// Group near-duplicate articles and print the sets as JSON.
    Cluster {
        /// Cosine distance below which two articles are duplicates.
        #[arg(long)]
        threshold: Option<f64>,

        /// Only consider articles with an id greater than this one.
        #[arg(long)]
        min_id: Option<i64>,
    },

    /// Rebuild personalized article lists.
    Rank {
        #[arg(long, value_enum, default_value_t = RankVariant::Pool)]
        variant: RankVariant,

        /// Rank only this subscriber.
        #[arg(long)]
        subscriber: Option<i64>,

        /// Start after this subscriber id instead of the stored checkpoint.
        #[arg(long)]
        from: Option<i64>,
    },
}

#[derive(Subcommand)]
enum EmbedAction {
    /// Embed articles above the stored floor that have no vector yet.
    Pending {
        /// Maximum number of articles to embed in this run.
        #[arg(long)]
        limit: Option<usize>,

        /// Override the batch size from config (number of texts per API call).
        #[arg(long)]
        batch_size: Option<usize>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tfmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(std::io::stderr)
        .with_timer(tracing_subscriber::fmt::time::UtcTime::rfc_3339())
        .init();

    let cli = Cli::parse();
    let cfg = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Init => {
            migrate::run_migrations(&cfg).await?;
            println!("Database initialized successfully.");
        }
        Commands::Sources { sync } => {
            sources::run_sources(&cfg, sync).await?;
        }
        Commands::Poll { source } => {
            poll::run_poll(&cfg, source).await?;
        }
        Commands::Runs { source, limit } => {
            audit::run_runs(&cfg, source, limit).await?;
        }
        Commands::Embed { action } => match action {
            EmbedAction::Pending { limit, batch_size } => {
                embed_cmd::run_embed_pending(&cfg, limit, batch_size).await?;
            }
        },
        Commands::Cluster { threshold, min_id } => {
            cluster::run_cluster(&cfg, threshold, min_id).await?;
        }
        Commands::Rank {
            variant,
            subscriber,
            from,
        } => {
            rank::run_rank(&cfg, variant, subscriber, from).await?;
        }
    }

    Ok(())
}
