//! Paths of every artifact in the cache
//!
//! ```text
//! {cache_dir}/
//!   .locks/                                 ignored by scans
//!   {repo_type}s--{namespace}--{name}/
//!     refs/{ref}                            commit hash (text)
//!     blobs/{hash}                          raw content
//!     blobs/{hash}.incomplete               download in progress
//!     snapshots/{commit}/{path}             symlink (or copy) of a blob
//!     .no_exist/{commit}/{path}             empty marker, confirmed absent
//! ```

use std::path::{Component, Path, PathBuf};

use crate::error::{CacheError, Result};
use crate::hash::BlobHash;
use crate::repo::{RepoId, RepoType};

pub const REFS_DIR: &str = "refs";
pub const BLOBS_DIR: &str = "blobs";
pub const SNAPSHOTS_DIR: &str = "snapshots";
pub const NO_EXIST_DIR: &str = ".no_exist";
pub const LOCKS_DIR: &str = ".locks";
pub const INCOMPLETE_SUFFIX: &str = ".incomplete";
pub const DEFAULT_REVISION: &str = "main";

/// Files created by the OS that never count as cache content
pub const IGNORED_FILES: &[&str] = &[".DS_Store"];

/// Paths of a single repository inside the cache
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepoLayout {
    root: PathBuf,
}

impl RepoLayout {
    pub fn new(cache_dir: &Path, repo_type: RepoType, repo_id: &RepoId) -> Self {
        Self {
            root: cache_dir.join(repo_id.folder_name(repo_type)),
        }
    }

    /// Layout of an already located repository folder
    pub fn from_root(root: PathBuf) -> Self {
        Self { root }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn refs_dir(&self) -> PathBuf {
        self.root.join(REFS_DIR)
    }

    pub fn blobs_dir(&self) -> PathBuf {
        self.root.join(BLOBS_DIR)
    }

    pub fn snapshots_dir(&self) -> PathBuf {
        self.root.join(SNAPSHOTS_DIR)
    }

    pub fn no_exist_dir(&self) -> PathBuf {
        self.root.join(NO_EXIST_DIR)
    }

    /// `refs/<name>`; nested names like `refs/pr/1` are allowed
    pub fn ref_path(&self, name: &str) -> Result<PathBuf> {
        Ok(self.refs_dir().join(relative_path(name)?))
    }

    /// Temp file for a ref being rewritten, next to the ref itself
    pub fn incomplete_ref_path(&self, name: &str) -> Result<PathBuf> {
        let mut path = self.ref_path(name)?.into_os_string();
        path.push(INCOMPLETE_SUFFIX);
        Ok(PathBuf::from(path))
    }

    pub fn blob_path(&self, hash: &BlobHash) -> PathBuf {
        self.blobs_dir().join(hash.to_hex())
    }

    pub fn incomplete_blob_path(&self, hash: &BlobHash) -> PathBuf {
        self.blobs_dir()
            .join(format!("{}{}", hash.to_hex(), INCOMPLETE_SUFFIX))
    }

    pub fn snapshot_dir(&self, commit: &str) -> Result<PathBuf> {
        Ok(self.snapshots_dir().join(single_component(commit)?))
    }

    pub fn snapshot_path(&self, commit: &str, path_in_repo: &str) -> Result<PathBuf> {
        Ok(self.snapshot_dir(commit)?.join(relative_path(path_in_repo)?))
    }

    pub fn no_exist_commit_dir(&self, commit: &str) -> Result<PathBuf> {
        Ok(self.no_exist_dir().join(single_component(commit)?))
    }

    pub fn no_exist_path(&self, commit: &str, path_in_repo: &str) -> Result<PathBuf> {
        Ok(self
            .no_exist_commit_dir(commit)?
            .join(relative_path(path_in_repo)?))
    }
}

/// Turn a `/`-separated repo path into a relative filesystem path,
/// rejecting anything that could escape the directory it is joined to
pub fn relative_path(path_in_repo: &str) -> Result<PathBuf> {
    let invalid = || CacheError::InvalidPath(path_in_repo.to_string());
    if path_in_repo.is_empty() || path_in_repo.starts_with('/') || path_in_repo.contains('\\') {
        return Err(invalid());
    }
    let mut out = PathBuf::new();
    for segment in path_in_repo.split('/') {
        if segment.is_empty() || segment == "." || segment == ".." {
            return Err(invalid());
        }
        out.push(segment);
    }
    // Catches prefixes such as `C:` on windows
    if out.components().any(|c| !matches!(c, Component::Normal(_))) {
        return Err(invalid());
    }
    Ok(out)
}

fn single_component(name: &str) -> Result<&str> {
    if name.is_empty() || name.contains(['/', '\\']) || name == "." || name == ".." {
        return Err(CacheError::InvalidPath(name.to_string()));
    }
    Ok(name)
}

/// Folder for library-managed assets:
/// `<assets_dir>/<library_name>/<namespace>/<subfolder>`.
///
/// Each part has `/` replaced by `--` so it stays a single folder level.
/// The folder is created if missing.
pub fn cached_assets_path(
    assets_dir: &Path,
    library_name: &str,
    namespace: Option<&str>,
    subfolder: Option<&str>,
) -> Result<PathBuf> {
    let mut path = assets_dir.to_path_buf();
    for part in [
        library_name,
        namespace.unwrap_or("default"),
        subfolder.unwrap_or("default"),
    ] {
        let part = part.trim().replace('/', "--");
        if part.is_empty() || part == "." || part == ".." {
            return Err(CacheError::InvalidPath(part));
        }
        path.push(part);
    }
    std::fs::create_dir_all(&path)?;
    Ok(path)
}
