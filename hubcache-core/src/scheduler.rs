//! Background commits of a local folder
//!
//! A [`CommitScheduler`] watches a folder and, every `every`, commits the
//! files modified since the previous commit through a [`CommitSink`].
//! Writers that must not race a commit take [`CommitScheduler::lock`].

use async_trait::async_trait;
use bytes::Bytes;
use regex::Regex;
use serde::Serialize;
use sha1::{Digest, Sha1};
use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;

use walkdir::WalkDir;

use crate::error::{CacheError, Result};
use crate::fs::pattern_regex;
use crate::hash::BlobHash;
use crate::layout::DEFAULT_REVISION;
use crate::store::{RepoCache, to_repo_path};

pub const DEFAULT_COMMIT_EVERY: Duration = Duration::from_secs(5 * 60);
pub const SCHEDULED_COMMIT_MESSAGE: &str = "Scheduled Commit";

/// Always ignored, on top of user patterns
pub const DEFAULT_IGNORE_PATTERNS: &[&str] = &[
    ".git",
    ".git/*",
    "*/.git",
    "**/.git/**",
    ".cache/huggingface",
    ".cache/huggingface/*",
    "*/.cache/huggingface",
    "**/.cache/huggingface/**",
];

/// A file to add (or overwrite) in the commit
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitOperation {
    pub path_in_repo: String,
    pub content: Bytes,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CommitInfo {
    pub commit: String,
    pub revision: String,
    pub message: String,
    pub files: usize,
}

/// Destination of scheduled commits
#[async_trait]
pub trait CommitSink: Send + Sync {
    async fn create_commit(
        &self,
        revision: &str,
        operations: Vec<CommitOperation>,
        message: &str,
    ) -> Result<CommitInfo>;
}

#[derive(Debug, Clone)]
pub struct SchedulerOptions {
    pub every: Duration,
    /// Prefix prepended to every committed path
    pub path_in_repo: String,
    pub allow_patterns: Vec<String>,
    pub ignore_patterns: Vec<String>,
    pub revision: String,
}

impl Default for SchedulerOptions {
    fn default() -> Self {
        Self {
            every: DEFAULT_COMMIT_EVERY,
            path_in_repo: String::new(),
            allow_patterns: Vec::new(),
            ignore_patterns: Vec::new(),
            revision: DEFAULT_REVISION.to_string(),
        }
    }
}

struct SchedulerState {
    folder: PathBuf,
    options: SchedulerOptions,
    allow: Vec<Regex>,
    ignore: Vec<Regex>,
    sink: Arc<dyn CommitSink>,
    lock: Mutex<()>,
    last_uploaded: Mutex<HashMap<String, SystemTime>>,
}

pub struct CommitScheduler {
    state: Arc<SchedulerState>,
    stop_tx: watch::Sender<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl CommitScheduler {
    /// Start the periodic loop; must be called from within a tokio runtime.
    ///
    /// The folder is created if missing. The first commit happens after
    /// one full period, which must not be zero.
    pub fn start(
        folder: impl Into<PathBuf>,
        options: SchedulerOptions,
        sink: Arc<dyn CommitSink>,
    ) -> Result<Self> {
        if options.every.is_zero() {
            return Err(CacheError::InvalidInterval(options.every));
        }
        let folder = folder.into();
        if folder.is_file() {
            return Err(CacheError::NotADirectory(folder));
        }
        fs::create_dir_all(&folder)?;

        let allow = compile_patterns(options.allow_patterns.iter().map(String::as_str))?;
        let ignore = compile_patterns(
            DEFAULT_IGNORE_PATTERNS
                .iter()
                .copied()
                .chain(options.ignore_patterns.iter().map(String::as_str)),
        )?;

        let every = options.every;
        let state = Arc::new(SchedulerState {
            folder,
            options,
            allow,
            ignore,
            sink,
            lock: Mutex::new(()),
            last_uploaded: Mutex::new(HashMap::new()),
        });

        let (stop_tx, mut stop_rx) = watch::channel(false);
        let loop_state = state.clone();
        let task = tokio::spawn(async move {
            let mut interval = tokio::time::interval(every);
            interval.tick().await;
            loop {
                tokio::select! {
                    _ = interval.tick() => {}
                    _ = stop_rx.changed() => break,
                }
                if let Err(e) = loop_state.push().await {
                    tracing::error!("Scheduled commit of {} failed: {}", loop_state.folder.display(), e);
                }
            }
            tracing::debug!("Commit scheduler for {} stopped", loop_state.folder.display());
        });

        tracing::info!(
            "Scheduled commits of {} every {}s",
            state.folder.display(),
            every.as_secs()
        );
        Ok(Self {
            state,
            stop_tx,
            task: Mutex::new(Some(task)),
        })
    }

    pub fn folder(&self) -> &Path {
        &self.state.folder
    }

    /// Held for the whole duration of a commit
    pub fn lock(&self) -> &Mutex<()> {
        &self.state.lock
    }

    /// Commit files changed since the last commit; `None` when nothing changed
    pub async fn push(&self) -> Result<Option<CommitInfo>> {
        self.state.push().await
    }

    /// Run a push in the background now
    pub fn trigger(&self) -> JoinHandle<Result<Option<CommitInfo>>> {
        let state = self.state.clone();
        tokio::spawn(async move { state.push().await })
    }

    /// End the periodic loop; pushes can still be made by hand
    pub fn stop(&self) {
        self.stop_tx.send_replace(true);
    }

    pub fn is_stopped(&self) -> bool {
        *self.stop_tx.borrow()
    }

    /// Stop the loop, wait for it and push whatever is left
    pub async fn shutdown(&self) -> Result<Option<CommitInfo>> {
        self.stop();
        if let Some(task) = self.task.lock().await.take() {
            task.await
                .map_err(|e| CacheError::Commit(format!("scheduler task failed: {}", e)))?;
        }
        self.state.push().await
    }
}

impl Drop for CommitScheduler {
    fn drop(&mut self) {
        self.stop_tx.send_replace(true);
    }
}

/// Files picked for a commit, with the mtime they had when read
type Changes = (Vec<(String, SystemTime)>, Vec<CommitOperation>);

impl SchedulerState {
    async fn push(self: &Arc<Self>) -> Result<Option<CommitInfo>> {
        let _guard = self.lock.lock().await;
        let mut last_uploaded = self.last_uploaded.lock().await;

        let state = Arc::clone(self);
        let seen = last_uploaded.clone();
        let (changed, operations) = tokio::task::spawn_blocking(move || state.collect_changes(&seen))
            .await
            .map_err(|e| CacheError::Commit(e.to_string()))??;
        if changed.is_empty() {
            tracing::debug!("Nothing to commit in {}", self.folder.display());
            return Ok(None);
        }

        let info = self
            .sink
            .create_commit(&self.options.revision, operations, SCHEDULED_COMMIT_MESSAGE)
            .await?;
        for (rel, mtime) in changed {
            last_uploaded.insert(rel, mtime);
        }
        tracing::info!("Committed {} file(s) as {}", info.files, info.commit);
        Ok(Some(info))
    }

    /// List the folder and read every selected file modified since `seen`
    fn collect_changes(&self, seen: &HashMap<String, SystemTime>) -> Result<Changes> {
        let mut changed = Vec::new();
        let mut operations = Vec::new();
        for (rel, path, mtime, size) in list_files(&self.folder)? {
            if !self.is_selected(&rel) || seen.get(&rel) == Some(&mtime) {
                continue;
            }
            operations.push(CommitOperation {
                path_in_repo: self.repo_path(&rel),
                content: read_prefix(&path, size)?,
            });
            changed.push((rel, mtime));
        }
        Ok((changed, operations))
    }

    fn is_selected(&self, rel: &str) -> bool {
        let allowed = self.allow.is_empty() || self.allow.iter().any(|p| p.is_match(rel));
        allowed && !self.ignore.iter().any(|p| p.is_match(rel))
    }

    fn repo_path(&self, rel: &str) -> String {
        let prefix = self.options.path_in_repo.trim_matches('/');
        if prefix.is_empty() {
            rel.to_string()
        } else {
            format!("{}/{}", prefix, rel)
        }
    }
}

fn compile_patterns<'a>(patterns: impl Iterator<Item = &'a str>) -> Result<Vec<Regex>> {
    patterns
        .map(|p| {
            // A trailing slash selects everything under the folder
            if p.ends_with('/') {
                pattern_regex(&format!("{}*", p), true)
            } else {
                pattern_regex(p, true)
            }
        })
        .collect()
}

/// Regular files under `folder` as `(path_in_folder, path, mtime, size)`, sorted
fn list_files(folder: &Path) -> Result<Vec<(String, PathBuf, SystemTime, u64)>> {
    let mut files = Vec::new();
    for entry in WalkDir::new(folder).sort_by_file_name() {
        let entry = entry.map_err(|e| CacheError::Io(e.into()))?;
        if !entry.file_type().is_file() {
            continue;
        }
        let metadata = entry.metadata().map_err(|e| CacheError::Io(e.into()))?;
        let rel = entry
            .path()
            .strip_prefix(folder)
            .map_err(|_| CacheError::InvalidPath(entry.path().display().to_string()))?;
        files.push((
            to_repo_path(rel),
            entry.path().to_path_buf(),
            metadata.modified()?,
            metadata.len(),
        ));
    }
    Ok(files)
}

/// Read at most `size` bytes; a file still being appended to is cut at
/// its size when listed
fn read_prefix(path: &Path, size: u64) -> Result<Bytes> {
    let mut content = Vec::with_capacity(size as usize);
    fs::File::open(path)?.take(size).read_to_end(&mut content)?;
    Ok(Bytes::from(content))
}

/// Commits into a local cache repository, the way a download of the
/// resulting revision would have laid it out
pub struct LocalCacheSink {
    repo: RepoCache,
}

impl LocalCacheSink {
    pub fn new(repo: RepoCache) -> Self {
        Self { repo }
    }
}

#[async_trait]
impl CommitSink for LocalCacheSink {
    async fn create_commit(
        &self,
        revision: &str,
        operations: Vec<CommitOperation>,
        message: &str,
    ) -> Result<CommitInfo> {
        let repo = self.repo.clone();
        let revision = revision.to_string();
        let message = message.to_string();
        tokio::task::spawn_blocking(move || commit_to_cache(&repo, &revision, operations, &message))
            .await
            .map_err(|e| CacheError::Commit(e.to_string()))?
    }
}

fn commit_to_cache(
    repo: &RepoCache,
    revision: &str,
    operations: Vec<CommitOperation>,
    message: &str,
) -> Result<CommitInfo> {
    let parent = repo.resolve_revision(revision)?;

    let mut entries: BTreeMap<String, BlobHash> = BTreeMap::new();
    if let Some(parent) = &parent {
        for (path_in_repo, snapshot_path) in repo.snapshot_files(parent)? {
            entries.insert(path_in_repo, snapshot_blob(repo, &snapshot_path)?);
        }
    }

    let files = operations.len();
    for op in operations {
        let hash = BlobHash::git_sha1(&op.content);
        repo.write_blob(&hash, &op.content)?;
        entries.insert(op.path_in_repo, hash);
    }

    let commit = commit_hash(parent.as_deref(), &entries);
    for (path_in_repo, hash) in &entries {
        repo.link_snapshot(&commit, path_in_repo, hash)?;
    }
    repo.write_ref(revision, &commit)?;

    Ok(CommitInfo {
        commit,
        revision: revision.to_string(),
        message: message.to_string(),
        files,
    })
}

/// Blob behind a snapshot entry; a copy with no blob left is stored again
fn snapshot_blob(repo: &RepoCache, snapshot_path: &Path) -> Result<BlobHash> {
    if let Ok(target) = fs::read_link(snapshot_path) {
        let name = target.file_name().and_then(|n| n.to_str()).unwrap_or_default();
        if let Ok(hash) = BlobHash::from_hex(name) {
            return Ok(hash);
        }
    }
    for hash in BlobHash::candidates_for_file(snapshot_path)? {
        if repo.layout().blob_path(&hash).is_file() {
            return Ok(hash);
        }
    }
    let data = fs::read(snapshot_path)?;
    let hash = BlobHash::git_sha1(&data);
    repo.write_blob(&hash, &data)?;
    Ok(hash)
}

fn commit_hash(parent: Option<&str>, entries: &BTreeMap<String, BlobHash>) -> String {
    let mut hasher = Sha1::new();
    if let Some(parent) = parent {
        hasher.update(b"parent ");
        hasher.update(parent.as_bytes());
        hasher.update(b"\n");
    }
    for (path, hash) in entries {
        hasher.update(path.as_bytes());
        hasher.update([0u8]);
        hasher.update(hash.to_hex().as_bytes());
        hasher.update(b"\n");
    }
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::CacheFileSystem;
    use crate::repo::{RepoId, RepoType};
    use crate::store::CacheStore;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    #[derive(Default)]
    struct RecordingSink {
        commits: Mutex<Vec<Vec<CommitOperation>>>,
    }

    #[async_trait]
    impl CommitSink for RecordingSink {
        async fn create_commit(
            &self,
            revision: &str,
            operations: Vec<CommitOperation>,
            message: &str,
        ) -> Result<CommitInfo> {
            let files = operations.len();
            let mut commits = self.commits.lock().await;
            commits.push(operations);
            Ok(CommitInfo {
                commit: format!("{:040x}", commits.len()),
                revision: revision.to_string(),
                message: message.to_string(),
                files,
            })
        }
    }

    #[derive(Default)]
    struct FailingSink {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl CommitSink for FailingSink {
        async fn create_commit(&self, _: &str, _: Vec<CommitOperation>, _: &str) -> Result<CommitInfo> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Err(CacheError::Commit("remote unavailable".to_string()))
        }
    }

    fn hourly() -> SchedulerOptions {
        SchedulerOptions {
            every: Duration::from_secs(3600),
            ..Default::default()
        }
    }

    fn paths(ops: &[CommitOperation]) -> Vec<&str> {
        ops.iter().map(|o| o.path_in_repo.as_str()).collect()
    }

    #[tokio::test]
    async fn test_push_only_changed_files() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("a.txt"), b"a").unwrap();
        fs::create_dir(dir.path().join("logs")).unwrap();
        fs::write(dir.path().join("logs/run.log"), b"1").unwrap();

        let sink = Arc::new(RecordingSink::default());
        let scheduler = CommitScheduler::start(dir.path(), hourly(), sink.clone()).unwrap();

        let info = scheduler.push().await.unwrap().unwrap();
        assert_eq!(info.files, 2);
        assert_eq!(info.message, SCHEDULED_COMMIT_MESSAGE);
        assert!(scheduler.push().await.unwrap().is_none());

        let log = fs::OpenOptions::new().append(true).open(dir.path().join("logs/run.log")).unwrap();
        log.set_modified(SystemTime::now() + Duration::from_secs(10)).unwrap();
        drop(log);
        scheduler.push().await.unwrap().unwrap();

        let commits = sink.commits.lock().await;
        assert_eq!(commits.len(), 2);
        assert_eq!(paths(&commits[0]), vec!["a.txt", "logs/run.log"]);
        assert_eq!(paths(&commits[1]), vec!["logs/run.log"]);
        scheduler.stop();
    }

    #[tokio::test]
    async fn test_patterns_and_prefix() {
        let dir = TempDir::new().unwrap();
        for path in ["keep.txt", "drop.bin", "sub/also.txt", ".git/HEAD", "sub/.cache/huggingface/x.txt"] {
            let path = dir.path().join(path);
            fs::create_dir_all(path.parent().unwrap()).unwrap();
            fs::write(path, b"x").unwrap();
        }

        let sink = Arc::new(RecordingSink::default());
        let options = SchedulerOptions {
            path_in_repo: "/data/".to_string(),
            allow_patterns: vec!["*.txt".to_string(), ".git/".to_string()],
            ignore_patterns: vec!["sub/also*".to_string()],
            ..hourly()
        };
        let scheduler = CommitScheduler::start(dir.path(), options, sink.clone()).unwrap();
        scheduler.push().await.unwrap();

        let commits = sink.commits.lock().await;
        assert_eq!(paths(&commits[0]), vec!["data/keep.txt"]);
        assert_eq!(commits[0][0].content, Bytes::from_static(b"x"));
    }

    #[tokio::test]
    async fn test_zero_interval_is_rejected() {
        let dir = TempDir::new().unwrap();
        let options = SchedulerOptions {
            every: Duration::ZERO,
            ..Default::default()
        };
        let folder = dir.path().join("never-created");
        let result = CommitScheduler::start(&folder, options, Arc::new(RecordingSink::default()));
        assert!(matches!(result, Err(CacheError::InvalidInterval(_))));
        assert!(!folder.exists());
    }

    #[test]
    fn test_changes_are_collected_outside_the_runtime() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("a.txt"), b"a").unwrap();
        fs::write(dir.path().join("b.txt"), b"bb").unwrap();
        let state = SchedulerState {
            folder: dir.path().to_path_buf(),
            options: hourly(),
            allow: Vec::new(),
            ignore: Vec::new(),
            sink: Arc::new(RecordingSink::default()),
            lock: Mutex::new(()),
            last_uploaded: Mutex::new(HashMap::new()),
        };

        let (changed, operations) = state.collect_changes(&HashMap::new()).unwrap();
        assert_eq!(paths(&operations), vec!["a.txt", "b.txt"]);
        assert_eq!(operations[1].content, Bytes::from_static(b"bb"));

        let seen: HashMap<String, SystemTime> = changed.into_iter().take(1).collect();
        let (changed, _) = state.collect_changes(&seen).unwrap();
        assert_eq!(changed.len(), 1);
        assert_eq!(changed[0].0, "b.txt");
    }

    #[tokio::test]
    async fn test_shutdown_pushes_remaining_files() {
        let dir = TempDir::new().unwrap();
        let sink = Arc::new(RecordingSink::default());
        let scheduler = CommitScheduler::start(dir.path().join("new"), hourly(), sink.clone()).unwrap();
        {
            let _guard = scheduler.lock().lock().await;
            fs::write(scheduler.folder().join("late.txt"), b"late").unwrap();
        }

        let info = scheduler.shutdown().await.unwrap();
        assert!(info.is_some());
        assert!(scheduler.is_stopped());
        assert_eq!(sink.commits.lock().await.len(), 1);
    }

    #[tokio::test]
    async fn test_trigger() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("a.txt"), b"a").unwrap();
        let sink = Arc::new(RecordingSink::default());
        let scheduler = CommitScheduler::start(dir.path(), hourly(), sink.clone()).unwrap();
        let info = scheduler.trigger().await.unwrap().unwrap();
        assert_eq!(info.unwrap().files, 1);
    }

    #[tokio::test]
    async fn test_loop_survives_sink_errors() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("a.txt"), b"a").unwrap();
        let sink = Arc::new(FailingSink::default());
        let options = SchedulerOptions {
            every: Duration::from_millis(20),
            ..Default::default()
        };
        let scheduler = CommitScheduler::start(dir.path(), options, sink.clone()).unwrap();

        tokio::time::sleep(Duration::from_millis(300)).await;
        scheduler.stop();
        assert!(sink.calls.load(Ordering::SeqCst) >= 2);
        assert!(scheduler.push().await.is_err());
    }

    #[tokio::test]
    async fn test_local_cache_sink_builds_revisions() {
        let cache = TempDir::new().unwrap();
        let work = TempDir::new().unwrap();
        let store = CacheStore::new(cache.path());
        let repo = store.repo(RepoType::Dataset, &RepoId::parse("me/logs").unwrap());
        let sink = Arc::new(LocalCacheSink::new(repo.clone()));
        let scheduler = CommitScheduler::start(work.path(), hourly(), sink).unwrap();

        fs::write(work.path().join("a.txt"), b"first").unwrap();
        let first = scheduler.push().await.unwrap().unwrap();
        fs::write(work.path().join("b.txt"), b"second").unwrap();
        let second = scheduler.push().await.unwrap().unwrap();

        assert_ne!(first.commit, second.commit);
        assert_eq!(second.files, 1);
        assert_eq!(repo.read_ref("main").unwrap().as_deref(), Some(second.commit.as_str()));

        let fs = CacheFileSystem::new(store);
        assert_eq!(fs.read("hf://datasets/me/logs/a.txt").unwrap(), Bytes::from_static(b"first"));
        assert_eq!(fs.read("hf://datasets/me/logs/b.txt").unwrap(), Bytes::from_static(b"second"));
        let old = format!("hf://datasets/me/logs@{}/b.txt", first.commit);
        assert!(!fs.exists(&old));
        scheduler.stop();
    }

    #[test]
    fn test_commit_hash_depends_on_parent_and_entries() {
        let mut entries = BTreeMap::new();
        entries.insert("a".to_string(), BlobHash::git_sha1(b"a"));
        let root = commit_hash(None, &entries);
        assert_eq!(root.len(), 40);
        assert_ne!(root, commit_hash(Some(&root), &entries));
        entries.insert("b".to_string(), BlobHash::git_sha1(b"b"));
        assert_ne!(root, commit_hash(None, &entries));
    }
}
