//! # docdupe CLI (`ddup`)
//!
//! The `ddup` binary drives near-duplicate detection over a local SQLite
//! corpus.
//!
//! ## Usage
//!
//! ```bash
//! ddup --config ./config/ddup.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `ddup init` | Create the SQLite database and run schema migrations |
//! | `ddup import <dir>` | Import text files; new or changed files become `pending` |
//! | `ddup analyze` | Run incremental (or `--force`) duplicate analysis |
//! | `ddup reanalyze <id>...` | Queue documents for re-analysis |
//! | `ddup groups list` | List duplicate groups |
//! | `ddup groups recalc` | Recalculate group confidence under the configured weights |
//! | `ddup stats` | Processing and group summary |
//! | `ddup runs` | Recent analysis runs |
//!
//! ## Examples
//!
//! ```bash
//! ddup init
//! ddup import ./scans
//! ddup analyze --progress human
//! ddup groups list --json --limit 20
//! ```

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::error;
use tracing_subscriber::EnvFilter;

use docdupe::progress::ProgressMode;
use docdupe::{analysis, config, groups, import, migrate, stats};

/// docdupe: near-duplicate detection for OCR'd document corpora.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file. See `config/ddup.example.toml` for a full example.
#[derive(Parser)]
#[command(
    name = "ddup",
    about = "Near-duplicate detection for OCR'd document corpora",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/ddup.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema.
    ///
    /// Idempotent; running it multiple times is safe.
    Init,

    /// Import text files from a directory.
    ///
    /// Files are matched with the `[import]` globs. The relative path is the
    /// document's external id; unchanged files are left alone.
    Import {
        /// Directory to scan.
        dir: PathBuf,
    },

    /// Run duplicate analysis.
    Analyze {
        /// Recompute every document and rebuild all groups.
        #[arg(long)]
        force: bool,

        /// Progress output on stderr. Defaults to `human` on a TTY, else `off`.
        #[arg(long, value_enum)]
        progress: Option<ProgressMode>,

        /// Start even if another run is recorded as active.
        #[arg(long)]
        ignore_active: bool,
    },

    /// Mark documents pending so the next analysis recomputes them.
    Reanalyze {
        /// Document ids.
        #[arg(required = true)]
        ids: Vec<i64>,
    },

    /// Inspect and rescore duplicate groups.
    Groups {
        #[command(subcommand)]
        action: GroupsAction,
    },

    /// Show database statistics.
    Stats,

    /// List recent analysis runs.
    Runs {
        #[arg(long, default_value_t = 10)]
        limit: i64,
    },
}

#[derive(Subcommand)]
enum GroupsAction {
    /// List groups with their members and component scores.
    List {
        /// Print JSON instead of a table.
        #[arg(long)]
        json: bool,

        #[arg(long)]
        limit: Option<usize>,
    },

    /// Recompute every group's confidence from its stored component scores.
    Recalc {
        /// Persist the new confidences (default is a dry run).
        #[arg(long)]
        apply: bool,
    },
}

#[tokio::main]
async fn main() {
    init_tracing();

    if let Err(err) = run().await {
        error!(error = %err, "command failed");
        for cause in err.chain().skip(1) {
            error!(cause = %cause, "caused by");
        }
        std::process::exit(1);
    }
}

async fn run() -> Result<()> {
    let cli = Cli::parse();
    let cfg = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Init => {
            migrate::run_migrations(&cfg).await?;
            println!("Database initialized successfully.");
        }
        Commands::Import { dir } => {
            import::run_import(&cfg, &dir).await?;
        }
        Commands::Analyze {
            force,
            progress,
            ignore_active,
        } => {
            analysis::run_analyze(&cfg, force, progress, ignore_active).await?;
        }
        Commands::Reanalyze { ids } => {
            analysis::run_reanalyze(&cfg, &ids).await?;
        }
        Commands::Groups { action } => match action {
            GroupsAction::List { json, limit } => {
                groups::run_list(&cfg, json, limit).await?;
            }
            GroupsAction::Recalc { apply } => {
                groups::run_recalc(&cfg, apply).await?;
            }
        },
        Commands::Stats => {
            stats::run_stats(&cfg).await?;
        }
        Commands::Runs { limit } => {
            stats::run_runs(&cfg, limit).await?;
        }
    }

    Ok(())
}

fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}
