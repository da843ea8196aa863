//! hubcache - local Hub cache administration

mod browse;
mod cache;
mod watch;

use anyhow::Result;
use clap::{Parser, Subcommand};
use hubcache_core::{CacheFileSystem, CacheStore, HubConfig, RepoId, RepoType};
use std::io::Write;
use std::path::PathBuf;
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::cache::OutputFormat;

#[derive(Parser, Debug)]
#[command(name = "hubcache")]
#[command(author = "hubcache Contributors")]
#[command(version)]
#[command(about = "Inspect and clean the local Hub cache", long_about = None)]
struct Cli {
    /// Cache directory (defaults to HF_HUB_CACHE)
    #[arg(long, global = true)]
    cache_dir: Option<PathBuf>,

    /// Print debug logs and scan warning details
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Only log warnings and errors
    #[arg(short, long, global = true, conflicts_with = "verbose")]
    quiet: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// List cached repositories
    Scan {
        #[arg(long, value_enum, default_value_t = OutputFormat::Table)]
        format: OutputFormat,

        /// One row per revision instead of per repository
        #[arg(long)]
        revisions: bool,
    },

    /// Delete cached revisions by commit hash
    Delete {
        #[arg(required = true)]
        hashes: Vec<String>,

        #[arg(long)]
        dry_run: bool,
    },

    /// Delete revisions no ref points to
    Prune {
        #[arg(long)]
        dry_run: bool,
    },

    /// Check blobs, snapshots and markers
    Verify,

    /// List a cached directory (hf://...), or the matches of a glob
    Ls {
        url: String,

        #[arg(long)]
        revision: Option<String>,

        /// Show kind and size
        #[arg(short, long)]
        long: bool,
    },

    /// Print a cached file (hf://...)
    Cat {
        url: String,

        #[arg(long)]
        revision: Option<String>,
    },

    /// Commit a folder into a cached repository on a schedule
    Watch {
        folder: PathBuf,

        repo_id: String,

        #[arg(long, default_value = "model")]
        repo_type: String,

        /// Seconds between commits
        #[arg(long, default_value_t = 300)]
        every: u64,

        #[arg(long, default_value = "")]
        path_in_repo: String,

        #[arg(long, default_value = "main")]
        revision: String,

        #[arg(long = "allow")]
        allow_patterns: Vec<String>,

        #[arg(long = "ignore")]
        ignore_patterns: Vec<String>,
    },

    /// Print the environment configuration
    Env,
}

/// `RUST_LOG` when set, otherwise info logs from our own crates only
fn default_filter() -> tracing_subscriber::EnvFilter {
    tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(DEFAULT_LOG_FILTER))
}

const DEFAULT_LOG_FILTER: &str = "hubcache=info,hubcache_core=info";

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let env_filter = if cli.verbose {
        tracing_subscriber::EnvFilter::new("debug")
    } else if cli.quiet {
        tracing_subscriber::EnvFilter::new("warn")
    } else {
        default_filter()
    };
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(env_filter)
        .init();

    let mut config = HubConfig::from_env();
    if let Some(cache_dir) = cli.cache_dir {
        config.hub_cache = cache_dir;
    }
    let cache_dir = config.hub_cache.clone();
    let store = CacheStore::from_config(&config);
    let mut out = std::io::stdout().lock();

    match cli.command {
        Commands::Scan { format, revisions } => {
            cache::scan(&mut out, &cache_dir, format, revisions, cli.verbose)?;
        }

        Commands::Delete { hashes, dry_run } => {
            cache::delete(&mut out, &cache_dir, &hashes, dry_run)?;
        }

        Commands::Prune { dry_run } => {
            cache::prune(&mut out, &cache_dir, dry_run)?;
        }

        Commands::Verify => {
            cache::verify(&mut out, &cache_dir, cli.quiet)?;
        }

        Commands::Ls { url, revision, long } => {
            let fs = CacheFileSystem::new(store);
            let url = browse::with_revision(&fs, &url, revision.as_deref())?;
            browse::ls(&mut out, &fs, &url, long)?;
        }

        Commands::Cat { url, revision } => {
            let fs = CacheFileSystem::new(store);
            let url = browse::with_revision(&fs, &url, revision.as_deref())?;
            browse::cat(&mut out, &fs, &url)?;
        }

        Commands::Watch {
            folder,
            repo_id,
            repo_type,
            every,
            path_in_repo,
            revision,
            allow_patterns,
            ignore_patterns,
        } => {
            let args = watch::WatchArgs {
                folder,
                repo_id: RepoId::parse(&repo_id)?,
                repo_type: repo_type.parse::<RepoType>()?,
                every: Duration::from_secs(every.max(1)),
                path_in_repo,
                revision,
                allow_patterns,
                ignore_patterns,
            };
            watch::watch(store, args).await?;
        }

        Commands::Env => {
            writeln!(out, "- hubcache version: {}", env!("CARGO_PKG_VERSION"))?;
            writeln!(out, "- Platform: {}-{}", std::env::consts::OS, std::env::consts::ARCH)?;
            for (key, value) in config.summary() {
                writeln!(out, "- {}: {}", key, value)?;
            }
        }
    }

    Ok(())
}
