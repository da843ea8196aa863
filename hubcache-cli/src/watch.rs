//! Periodically commit a local folder into a cached repository

use anyhow::Result;
use hubcache_core::{
    CacheStore, CommitScheduler, LocalCacheSink, RepoId, RepoType, SchedulerOptions,
};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

pub struct WatchArgs {
    pub folder: PathBuf,
    pub repo_id: RepoId,
    pub repo_type: RepoType,
    pub every: Duration,
    pub path_in_repo: String,
    pub revision: String,
    pub allow_patterns: Vec<String>,
    pub ignore_patterns: Vec<String>,
}

/// Runs until Ctrl-C, then commits what is left
pub async fn watch(store: CacheStore, args: WatchArgs) -> Result<()> {
    let repo = store.repo(args.repo_type, &args.repo_id);
    let options = SchedulerOptions {
        every: args.every,
        path_in_repo: args.path_in_repo,
        allow_patterns: args.allow_patterns,
        ignore_patterns: args.ignore_patterns,
        revision: args.revision,
    };
    let scheduler = CommitScheduler::start(args.folder, options, Arc::new(LocalCacheSink::new(repo)))?;
    info!(
        "Watching {} (Ctrl-C to stop)",
        scheduler.folder().display()
    );

    tokio::signal::ctrl_c().await?;
    info!("Stopping, committing remaining changes");
    if let Some(commit) = scheduler.shutdown().await? {
        info!("Last commit: {} ({} file(s))", commit.commit, commit.files);
    }
    Ok(())
}
