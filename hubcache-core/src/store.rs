//! Cache writer and lookups
//!
//! Writes follow the order a download would: the blob first (atomically,
//! through `blobs/<hash>.incomplete`), then the snapshot pointer, then the
//! ref. A reader never sees a pointer to a partially written blob.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use walkdir::WalkDir;

use crate::config::HubConfig;
use crate::error::{CacheError, Result};
use crate::hash::BlobHash;
use crate::layout::{DEFAULT_REVISION, RepoLayout, relative_path};
use crate::repo::{RepoId, RepoType};

/// How snapshot entries point at blobs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Symlinks {
    /// Use symlinks when the platform allows, copies otherwise
    Auto,
    /// Always copy blobs into snapshots
    Disabled,
}

/// Outcome of looking a file up in the cache without touching the network
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheLookup {
    /// The file is cached at this snapshot path
    Cached(PathBuf),
    /// The Hub confirmed the file does not exist at this revision
    KnownMissing,
    /// Nothing is known locally
    NotCached,
}

/// Handle on a cache directory
#[derive(Debug, Clone)]
pub struct CacheStore {
    cache_dir: PathBuf,
    symlinks: Symlinks,
    warn_on_copy: bool,
    warned: Arc<AtomicBool>,
}

impl CacheStore {
    pub fn new(cache_dir: impl Into<PathBuf>) -> Self {
        Self {
            cache_dir: cache_dir.into(),
            symlinks: Symlinks::Auto,
            warn_on_copy: true,
            warned: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Store rooted at the configured hub cache
    pub fn from_config(config: &HubConfig) -> Self {
        let mut store = Self::new(config.hub_cache.clone());
        store.warn_on_copy = !config.disable_symlinks_warning;
        store
    }

    pub fn with_symlinks(mut self, symlinks: Symlinks) -> Self {
        self.symlinks = symlinks;
        self
    }

    pub fn cache_dir(&self) -> &Path {
        &self.cache_dir
    }

    /// Handle on one repository (the folder need not exist yet)
    pub fn repo(&self, repo_type: RepoType, repo_id: &RepoId) -> RepoCache {
        RepoCache {
            layout: RepoLayout::new(&self.cache_dir, repo_type, repo_id),
            repo_type,
            repo_id: repo_id.clone(),
            store: self.clone(),
        }
    }

    /// Whether the repository folder is present in the cache
    pub fn contains_repo(&self, repo_type: RepoType, repo_id: &RepoId) -> bool {
        self.cache_dir.join(repo_id.folder_name(repo_type)).is_dir()
    }

    fn warn_copy_fallback(&self, reason: &str) {
        if self.warn_on_copy && !self.warned.swap(true, Ordering::Relaxed) {
            tracing::warn!(
                "Symlinks are not available ({}); snapshots will contain copies of blobs and use more disk space. \
                 Set HF_HUB_DISABLE_SYMLINKS_WARNING=1 to silence this warning.",
                reason
            );
        }
    }
}

/// Read/write access to a single cached repository
#[derive(Debug, Clone)]
pub struct RepoCache {
    store: CacheStore,
    repo_type: RepoType,
    repo_id: RepoId,
    layout: RepoLayout,
}

impl RepoCache {
    pub fn repo_type(&self) -> RepoType {
        self.repo_type
    }

    pub fn repo_id(&self) -> &RepoId {
        &self.repo_id
    }

    pub fn layout(&self) -> &RepoLayout {
        &self.layout
    }

    /// Store `data` under `blobs/<hash>`; an existing blob is left untouched
    pub fn write_blob(&self, hash: &BlobHash, data: &[u8]) -> Result<PathBuf> {
        let blob_path = self.layout.blob_path(hash);
        if blob_path.is_file() {
            return Ok(blob_path);
        }
        hash.verify(data)?;

        fs::create_dir_all(self.layout.blobs_dir())?;
        let tmp_path = self.layout.incomplete_blob_path(hash);
        fs::write(&tmp_path, data)?;
        fs::rename(&tmp_path, &blob_path)?;
        tracing::debug!("Stored blob {} ({} bytes)", hash, data.len());
        Ok(blob_path)
    }

    /// Point `snapshots/<commit>/<path_in_repo>` at an existing blob
    pub fn link_snapshot(&self, commit: &str, path_in_repo: &str, hash: &BlobHash) -> Result<PathBuf> {
        let blob_path = self.layout.blob_path(hash);
        if !blob_path.is_file() {
            return Err(CacheError::EntryNotFound(blob_path.display().to_string()));
        }

        let pointer = self.layout.snapshot_path(commit, path_in_repo)?;
        if let Some(parent) = pointer.parent() {
            fs::create_dir_all(parent)?;
        }
        if pointer.symlink_metadata().is_ok() {
            fs::remove_file(&pointer)?;
        }

        // From snapshots/<commit>/<a>/<b>/<file>, climb back to the repo root
        let depth = relative_path(path_in_repo)?.components().count() + 1;
        let mut target = PathBuf::new();
        for _ in 0..depth {
            target.push("..");
        }
        target.push(crate::layout::BLOBS_DIR);
        target.push(hash.to_hex());

        self.create_pointer(&blob_path, &target, &pointer)?;

        let marker = self.layout.no_exist_path(commit, path_in_repo)?;
        if marker.is_file() {
            fs::remove_file(&marker)?;
        }
        Ok(pointer)
    }

    fn create_pointer(&self, blob_path: &Path, relative_target: &Path, pointer: &Path) -> Result<()> {
        if self.store.symlinks == Symlinks::Auto {
            match symlink_file(relative_target, pointer) {
                Ok(()) => return Ok(()),
                Err(e) => self.store.warn_copy_fallback(&e.to_string()),
            }
        }
        fs::copy(blob_path, pointer)?;
        Ok(())
    }

    /// Record a downloaded file: blob, snapshot pointer and ref.
    ///
    /// Without an explicit hash the git blob hash of `data` is used.
    pub fn insert_file(
        &self,
        revision: &str,
        commit: &str,
        path_in_repo: &str,
        data: &[u8],
        hash: Option<BlobHash>,
    ) -> Result<PathBuf> {
        let hash = hash.unwrap_or_else(|| BlobHash::git_sha1(data));
        self.write_blob(&hash, data)?;
        let pointer = self.link_snapshot(commit, path_in_repo, &hash)?;
        if revision != commit {
            self.write_ref(revision, commit)?;
        }
        Ok(pointer)
    }

    /// Write `refs/<name>`; skipped when it already holds `commit`
    pub fn write_ref(&self, name: &str, commit: &str) -> Result<()> {
        let path = self.layout.ref_path(name)?;
        if self.read_ref(name)?.as_deref() == Some(commit) {
            return Ok(());
        }
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let tmp_path = self.layout.incomplete_ref_path(name)?;
        fs::write(&tmp_path, commit)?;
        fs::rename(&tmp_path, &path)?;
        tracing::debug!("{}: ref {} -> {}", self.repo_id, name, commit);
        Ok(())
    }

    pub fn read_ref(&self, name: &str) -> Result<Option<String>> {
        let path = self.layout.ref_path(name)?;
        if !path.is_file() {
            return Ok(None);
        }
        Ok(Some(fs::read_to_string(&path)?.trim().to_string()))
    }

    /// Resolve a ref name or commit hash to a cached commit
    pub fn resolve_revision(&self, revision: &str) -> Result<Option<String>> {
        let commit = match self.read_ref(revision) {
            Ok(Some(commit)) => commit,
            Ok(None) | Err(CacheError::InvalidPath(_)) => revision.to_string(),
            Err(e) => return Err(e),
        };
        match self.layout.snapshot_dir(&commit) {
            Ok(dir) if dir.is_dir() => Ok(Some(commit)),
            _ => Ok(None),
        }
    }

    /// Record that `path_in_repo` does not exist at `commit`
    pub fn mark_missing(&self, revision: &str, commit: &str, path_in_repo: &str) -> Result<PathBuf> {
        let marker = self.layout.no_exist_path(commit, path_in_repo)?;
        if let Some(parent) = marker.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&marker, b"")?;
        if revision != commit {
            self.write_ref(revision, commit)?;
        }
        Ok(marker)
    }

    /// Find a file in the cache without any network access.
    ///
    /// `revision` defaults to `main` and may be a ref or a commit hash.
    pub fn lookup(&self, revision: Option<&str>, path_in_repo: &str) -> Result<CacheLookup> {
        if !self.layout.root().is_dir() {
            return Ok(CacheLookup::NotCached);
        }
        let revision = revision.unwrap_or(DEFAULT_REVISION);
        let commit = match self.read_ref(revision) {
            Ok(Some(commit)) => commit,
            Ok(None) | Err(CacheError::InvalidPath(_)) => revision.to_string(),
            Err(e) => return Err(e),
        };

        relative_path(path_in_repo)?;
        // An unresolved ref name with slashes can't be a commit folder
        let Ok(snapshot_dir) = self.layout.snapshot_dir(&commit) else {
            return Ok(CacheLookup::NotCached);
        };

        let marker = self.layout.no_exist_path(&commit, path_in_repo)?;
        if marker.is_file() {
            return Ok(CacheLookup::KnownMissing);
        }
        if !snapshot_dir.is_dir() {
            return Ok(CacheLookup::NotCached);
        }
        let cached = self.layout.snapshot_path(&commit, path_in_repo)?;
        if cached.is_file() {
            Ok(CacheLookup::Cached(cached))
        } else {
            Ok(CacheLookup::NotCached)
        }
    }

    /// Files of a cached snapshot as `(path_in_repo, snapshot_path)`, sorted
    pub fn snapshot_files(&self, commit: &str) -> Result<Vec<(String, PathBuf)>> {
        let dir = self.layout.snapshot_dir(commit)?;
        if !dir.is_dir() {
            return Err(CacheError::RevisionNotFound(commit.to_string()));
        }
        let mut files = Vec::new();
        for entry in WalkDir::new(&dir).follow_links(false).sort_by_file_name() {
            let entry = entry.map_err(|e| CacheError::Io(e.into()))?;
            if entry.file_type().is_dir() {
                continue;
            }
            let rel = entry
                .path()
                .strip_prefix(&dir)
                .map_err(|_| CacheError::InvalidPath(entry.path().display().to_string()))?;
            files.push((to_repo_path(rel), entry.path().to_path_buf()));
        }
        Ok(files)
    }
}

/// `/`-joined form of a relative filesystem path
/// Blob behind a snapshot entry, if it can be found.
///
/// Symlinks are followed. A copy is matched by content: it belongs to the
/// `blobs/<hash>` named after its git blob hash or its SHA-256.
pub(crate) fn pointer_blob(layout: &RepoLayout, pointer: &Path) -> Result<Option<PathBuf>> {
    let meta = fs::symlink_metadata(pointer)?;
    if meta.file_type().is_symlink() {
        return Ok(fs::canonicalize(pointer).ok().filter(|p| p.is_file()));
    }
    if !meta.is_file() {
        return Ok(None);
    }
    for hash in BlobHash::candidates_for_file(pointer)? {
        let blob = layout.blob_path(&hash);
        if blob.is_file() {
            return Ok(Some(fs::canonicalize(&blob)?));
        }
    }
    Ok(None)
}

pub(crate) fn to_repo_path(rel: &Path) -> String {
    rel.components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}

#[cfg(unix)]
fn symlink_file(target: &Path, link: &Path) -> std::io::Result<()> {
    std::os::unix::fs::symlink(target, link)
}

#[cfg(windows)]
fn symlink_file(target: &Path, link: &Path) -> std::io::Result<()> {
    std::os::windows::fs::symlink_file(target, link)
}

#[cfg(not(any(unix, windows)))]
fn symlink_file(_target: &Path, _link: &Path) -> std::io::Result<()> {
    Err(std::io::Error::new(
        std::io::ErrorKind::Unsupported,
        "symlinks are not supported on this platform",
    ))
}
