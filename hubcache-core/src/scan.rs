//! Cache scanning
//!
//! Builds a description of everything in a cache directory: repos, their
//! cached revisions, the files of each revision and the blobs behind them.
//! A repository that doesn't follow the expected layout is reported as a
//! warning instead of failing the whole scan.

use serde::{Serialize, Serializer};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use chrono::{DateTime, Utc};
use walkdir::WalkDir;

use crate::error::{CacheError, Result};
use crate::format::format_size;
use crate::layout::{IGNORED_FILES, INCOMPLETE_SUFFIX, LOCKS_DIR, RepoLayout};
use crate::repo::{RepoType, parse_folder_name};
use crate::store::{pointer_blob, to_repo_path};

/// A file of a cached revision
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CachedFileInfo {
    pub file_name: String,
    /// Path of the file relative to the repository root, `/`-separated
    pub path_in_repo: String,
    /// Path of the entry inside `snapshots/<commit>/`
    pub file_path: PathBuf,
    /// Resolved blob (the file itself when snapshots hold copies)
    pub blob_path: PathBuf,
    pub size_on_disk: u64,
    /// Unix seconds
    pub blob_last_accessed: i64,
    /// Unix seconds
    pub blob_last_modified: i64,
}

/// A cached revision (one folder in `snapshots/`)
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CachedRevisionInfo {
    pub commit_hash: String,
    pub snapshot_path: PathBuf,
    /// Sum of the distinct blobs referenced by this revision
    pub size_on_disk: u64,
    pub files: Vec<CachedFileInfo>,
    /// Refs pointing at this revision
    pub refs: BTreeSet<String>,
    pub last_modified: i64,
}

impl CachedRevisionInfo {
    pub fn nb_files(&self) -> usize {
        self.files.len()
    }

    pub fn size_on_disk_str(&self) -> String {
        format_size(self.size_on_disk)
    }

    /// A revision no ref points to
    pub fn is_detached(&self) -> bool {
        self.refs.is_empty()
    }
}

/// A cached repository
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CachedRepoInfo {
    pub repo_id: String,
    pub repo_type: RepoType,
    pub repo_path: PathBuf,
    /// Sum of all distinct blobs of the repository
    pub size_on_disk: u64,
    /// Number of distinct blobs
    pub nb_files: usize,
    pub revisions: Vec<CachedRevisionInfo>,
    pub last_accessed: i64,
    pub last_modified: i64,
}

impl CachedRepoInfo {
    /// Ref name → revision it points to
    pub fn refs(&self) -> BTreeMap<&str, &CachedRevisionInfo> {
        self.revisions
            .iter()
            .flat_map(|rev| rev.refs.iter().map(move |r| (r.as_str(), rev)))
            .collect()
    }

    pub fn revision(&self, commit_hash: &str) -> Option<&CachedRevisionInfo> {
        self.revisions.iter().find(|r| r.commit_hash == commit_hash)
    }

    pub fn size_on_disk_str(&self) -> String {
        format_size(self.size_on_disk)
    }
}

/// Result of a cache scan
#[derive(Debug, Serialize)]
pub struct HubCacheInfo {
    pub cache_dir: PathBuf,
    pub size_on_disk: u64,
    pub repos: Vec<CachedRepoInfo>,
    /// One entry per repository that could not be scanned
    #[serde(serialize_with = "serialize_errors")]
    pub warnings: Vec<CacheError>,
}

impl HubCacheInfo {
    pub fn size_on_disk_str(&self) -> String {
        format_size(self.size_on_disk)
    }

    pub fn repo(&self, repo_type: RepoType, repo_id: &str) -> Option<&CachedRepoInfo> {
        self.repos
            .iter()
            .find(|r| r.repo_type == repo_type && r.repo_id == repo_id)
    }

    /// Commit hashes of every revision no ref points to
    pub fn detached_revisions(&self) -> Vec<&str> {
        self.repos
            .iter()
            .flat_map(|repo| repo.revisions.iter())
            .filter(|rev| rev.is_detached())
            .map(|rev| rev.commit_hash.as_str())
            .collect()
    }
}

fn serialize_errors<S: Serializer>(errors: &[CacheError], s: S) -> std::result::Result<S::Ok, S::Error> {
    s.collect_seq(errors.iter().map(|e| e.to_string()))
}

/// Scan a whole cache directory
pub fn scan_cache_dir(cache_dir: &Path) -> Result<HubCacheInfo> {
    if !cache_dir.exists() {
        return Err(CacheError::CacheNotFound(cache_dir.to_path_buf()));
    }
    if !cache_dir.is_dir() {
        return Err(CacheError::NotADirectory(cache_dir.to_path_buf()));
    }

    let mut repos = Vec::new();
    let mut warnings = Vec::new();

    let mut entries: Vec<PathBuf> = fs::read_dir(cache_dir)?
        .map(|e| e.map(|e| e.path()))
        .collect::<std::io::Result<_>>()?;
    entries.sort();

    for repo_path in entries {
        let name = file_name(&repo_path);
        if name == LOCKS_DIR || IGNORED_FILES.contains(&name.as_str()) {
            continue;
        }
        match scan_repo(&repo_path) {
            Ok(info) => repos.push(info),
            Err(e @ CacheError::CorruptedCache { .. }) => {
                tracing::debug!("Skipping corrupted repo: {}", e);
                warnings.push(e);
            }
            Err(e) => return Err(e),
        }
    }

    Ok(HubCacheInfo {
        cache_dir: cache_dir.to_path_buf(),
        size_on_disk: repos.iter().map(|r| r.size_on_disk).sum(),
        repos,
        warnings,
    })
}

#[derive(Clone, Copy)]
struct BlobStat {
    size: u64,
    accessed: i64,
    modified: i64,
}

/// Scan a single repository folder
pub fn scan_repo(repo_path: &Path) -> Result<CachedRepoInfo> {
    if !repo_path.is_dir() {
        return Err(CacheError::corrupted(repo_path, "Repo path is not a directory"));
    }
    let (repo_type, repo_id) = parse_folder_name(&file_name(repo_path))
        .map_err(|reason| CacheError::corrupted(repo_path, reason))?;

    let layout = RepoLayout::from_root(repo_path.to_path_buf());
    let snapshots_dir = layout.snapshots_dir();
    let refs_dir = layout.refs_dir();

    if !snapshots_dir.is_dir() {
        return Err(CacheError::corrupted(
            repo_path,
            "Snapshots dir doesn't exist in cached repo",
        ));
    }

    let mut refs_by_hash = read_refs(repo_path, &refs_dir)?;
    let mut blob_stats: HashMap<PathBuf, BlobStat> = HashMap::new();
    let mut revisions = Vec::new();

    let mut revision_dirs: Vec<PathBuf> = fs::read_dir(&snapshots_dir)?
        .map(|e| e.map(|e| e.path()))
        .collect::<std::io::Result<_>>()?;
    revision_dirs.sort();

    for revision_path in revision_dirs {
        let commit_hash = file_name(&revision_path);
        if IGNORED_FILES.contains(&commit_hash.as_str()) {
            continue;
        }
        if !revision_path.is_dir() {
            return Err(CacheError::corrupted(
                repo_path,
                format!("Snapshots folder corrupted. Found a file: {}", revision_path.display()),
            ));
        }

        let mut files = Vec::new();
        for entry in WalkDir::new(&revision_path).follow_links(false).sort_by_file_name() {
            let entry = entry.map_err(|e| CacheError::Io(e.into()))?;
            if entry.file_type().is_dir() {
                continue;
            }
            let file_path = entry.path().to_path_buf();
            let blob_path = match pointer_blob(&layout, &file_path)? {
                Some(p) => p,
                // a copy with no `blobs/` entry holds the only copy of its content
                None if !entry.path_is_symlink() => file_path.clone(),
                None => {
                    return Err(CacheError::corrupted(
                        repo_path,
                        format!("Blob missing (broken symlink): {}", file_path.display()),
                    ));
                }
            };
            let stat = match blob_stats.get(&blob_path) {
                Some(stat) => *stat,
                None => {
                    let stat = blob_stat(&blob_path)?;
                    blob_stats.insert(blob_path.clone(), stat);
                    stat
                }
            };
            let rel = file_path.strip_prefix(&revision_path).unwrap_or(&file_path);
            files.push(CachedFileInfo {
                file_name: file_name(&file_path),
                path_in_repo: to_repo_path(rel),
                file_path,
                blob_path,
                size_on_disk: stat.size,
                blob_last_accessed: stat.accessed,
                blob_last_modified: stat.modified,
            });
        }

        let distinct_blobs: BTreeSet<&PathBuf> = files.iter().map(|f| &f.blob_path).collect();
        let size_on_disk = distinct_blobs
            .iter()
            .map(|p| blob_stats.get(*p).map_or(0, |s| s.size))
            .sum();
        let last_modified = match files.iter().map(|f| f.blob_last_modified).max() {
            Some(t) => t,
            None => unix_secs(fs::metadata(&revision_path)?.modified().ok()),
        };

        revisions.push(CachedRevisionInfo {
            refs: refs_by_hash.remove(&commit_hash).unwrap_or_default(),
            commit_hash,
            snapshot_path: revision_path,
            size_on_disk,
            files,
            last_modified,
        });
    }

    if !refs_by_hash.is_empty() {
        let dangling: Vec<String> = refs_by_hash
            .iter()
            .map(|(hash, refs)| format!("{} <- {:?}", hash, refs))
            .collect();
        return Err(CacheError::corrupted(
            repo_path,
            format!("Reference(s) refer to missing commit hashes: {}", dangling.join(", ")),
        ));
    }

    let (last_accessed, last_modified) = if blob_stats.is_empty() {
        let meta = fs::metadata(repo_path)?;
        (
            unix_secs(meta.accessed().ok()),
            unix_secs(meta.modified().ok()),
        )
    } else {
        (
            blob_stats.values().map(|s| s.accessed).max().unwrap_or_default(),
            blob_stats.values().map(|s| s.modified).max().unwrap_or_default(),
        )
    };

    Ok(CachedRepoInfo {
        repo_id,
        repo_type,
        repo_path: repo_path.to_path_buf(),
        size_on_disk: blob_stats.values().map(|s| s.size).sum(),
        nb_files: blob_stats.len(),
        revisions,
        last_accessed,
        last_modified,
    })
}

/// Commit hash → ref names, read recursively under `refs/`
fn read_refs(repo_path: &Path, refs_dir: &Path) -> Result<HashMap<String, BTreeSet<String>>> {
    let mut refs_by_hash: HashMap<String, BTreeSet<String>> = HashMap::new();
    if !refs_dir.exists() {
        return Ok(refs_by_hash);
    }
    if refs_dir.is_file() {
        return Err(CacheError::corrupted(repo_path, "Refs directory cannot be a file"));
    }
    for entry in WalkDir::new(refs_dir) {
        let entry = entry.map_err(|e| CacheError::Io(e.into()))?;
        // a `.incomplete` ref is a write that never got renamed
        if entry.file_type().is_dir() || file_name(entry.path()).ends_with(INCOMPLETE_SUFFIX) {
            continue;
        }
        let rel = entry.path().strip_prefix(refs_dir).unwrap_or(entry.path());
        let commit = fs::read_to_string(entry.path())?.trim().to_string();
        refs_by_hash.entry(commit).or_default().insert(to_repo_path(rel));
    }
    Ok(refs_by_hash)
}

fn blob_stat(path: &Path) -> Result<BlobStat> {
    let meta = fs::metadata(path)?;
    Ok(BlobStat {
        size: meta.len(),
        accessed: unix_secs(meta.accessed().ok()),
        modified: unix_secs(meta.modified().ok()),
    })
}

fn unix_secs(time: Option<SystemTime>) -> i64 {
    time.map_or(0, |t| DateTime::<Utc>::from(t).timestamp())
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hash::BlobHash;
    use crate::repo::RepoId;
    use crate::store::{CacheStore, Symlinks};
    use tempfile::TempDir;

    const C1: &str = "1111111111111111111111111111111111111111";
    const C2: &str = "2222222222222222222222222222222222222222";

    fn populated() -> TempDir {
        let dir = TempDir::new().unwrap();
        let store = CacheStore::new(dir.path());
        let model = store.repo(RepoType::Model, &RepoId::parse("org/model").unwrap());
        model.insert_file("main", C1, "config.json", b"{\"v\":1}", None).unwrap();
        model.insert_file("main", C1, "weights.bin", &[0u8; 100], Some(BlobHash::sha256(&[0u8; 100]))).unwrap();
        model.insert_file(C2, C2, "config.json", b"{\"v\":2}", None).unwrap();
        model.insert_file(C2, C2, "weights.bin", &[0u8; 100], Some(BlobHash::sha256(&[0u8; 100]))).unwrap();

        let dataset = store.repo(RepoType::Dataset, &RepoId::parse("squad").unwrap());
        dataset.insert_file("main", C1, "train/data.csv", b"a,b\n1,2\n", None).unwrap();
        dir
    }

    #[test]
    fn test_scan_sizes_and_counts() {
        let dir = populated();
        let info = scan_cache_dir(dir.path()).unwrap();
        assert!(info.warnings.is_empty());
        assert_eq!(info.repos.len(), 2);

        let model = info.repo(RepoType::Model, "org/model").unwrap();
        // two configs (7 bytes each) + one shared 100 byte weight blob
        assert_eq!(model.size_on_disk, 114);
        assert_eq!(model.nb_files, 3);
        assert_eq!(model.revisions.len(), 2);

        let r1 = model.revision(C1).unwrap();
        assert_eq!(r1.size_on_disk, 107);
        assert_eq!(r1.nb_files(), 2);
        assert_eq!(r1.refs, BTreeSet::from(["main".to_string()]));
        assert!(model.revision(C2).unwrap().is_detached());
        assert_eq!(model.refs().keys().copied().collect::<Vec<_>>(), vec!["main"]);

        let dataset = info.repo(RepoType::Dataset, "squad").unwrap();
        assert_eq!(dataset.revisions[0].files[0].path_in_repo, "train/data.csv");
        assert_eq!(dataset.revisions[0].files[0].file_name, "data.csv");
        assert_eq!(info.size_on_disk, 114 + 8);
        assert_eq!(info.detached_revisions(), vec![C2]);
    }

    #[test]
    fn test_scan_missing_and_file_cache_dir() {
        let dir = TempDir::new().unwrap();
        assert!(matches!(
            scan_cache_dir(&dir.path().join("nope")),
            Err(CacheError::CacheNotFound(_))
        ));
        let file = dir.path().join("file");
        fs::write(&file, "x").unwrap();
        assert!(matches!(scan_cache_dir(&file), Err(CacheError::NotADirectory(_))));
    }

    #[test]
    fn test_corrupted_repos_become_warnings() {
        let dir = populated();
        let root = dir.path();
        fs::create_dir_all(root.join(".locks/models--org--model")).unwrap();
        fs::write(root.join("not-a-repo"), "x").unwrap();
        fs::create_dir_all(root.join("invalid")).unwrap();
        fs::create_dir_all(root.join("weights--foo")).unwrap();
        fs::create_dir_all(root.join("models--no-snapshots")).unwrap();

        let info = scan_cache_dir(root).unwrap();
        assert_eq!(info.repos.len(), 2);
        assert_eq!(info.warnings.len(), 4);
        assert!(info
            .warnings
            .iter()
            .all(|w| matches!(w, CacheError::CorruptedCache { .. })));
    }

    #[test]
    fn test_dangling_ref_is_corruption() {
        let dir = populated();
        let repo_path = dir.path().join("models--org--model");
        fs::write(repo_path.join("refs/dev"), "ffffffffffffffffffffffffffffffffffffffff").unwrap();
        let err = scan_repo(&repo_path).unwrap_err();
        assert!(err.to_string().contains("missing commit hashes"));
    }

    #[test]
    fn test_unfinished_ref_write_is_ignored() {
        let dir = populated();
        let repo_path = dir.path().join("models--org--model");
        fs::write(repo_path.join("refs/main.incomplete"), C2).unwrap();
        let info = scan_repo(&repo_path).unwrap();
        assert_eq!(info.revision(C1).unwrap().refs, BTreeSet::from(["main".to_string()]));
        assert!(info.revision(C2).unwrap().is_detached());
    }

    #[test]
    fn test_copies_are_mapped_to_their_blobs() {
        let dir = TempDir::new().unwrap();
        let store = CacheStore::new(dir.path()).with_symlinks(Symlinks::Disabled);
        let model = store.repo(RepoType::Model, &RepoId::parse("org/model").unwrap());
        model.insert_file("main", C1, "a.txt", b"aaa", None).unwrap();
        model.insert_file("main", C1, "big.bin", &[1u8; 50], Some(BlobHash::sha256(&[1u8; 50]))).unwrap();
        model.insert_file(C2, C2, "a.txt", b"aaa", None).unwrap();

        let info = scan_repo(model.layout().root()).unwrap();
        let blobs_dir = fs::canonicalize(model.layout().blobs_dir()).unwrap();
        for revision in &info.revisions {
            for file in &revision.files {
                assert_eq!(file.blob_path.parent(), Some(blobs_dir.as_path()));
                assert_ne!(file.blob_path, file.file_path);
            }
        }
        // the copy in each snapshot is not counted again
        assert_eq!(info.nb_files, 2);
        assert_eq!(info.size_on_disk, 53);
    }

    #[test]
    fn test_copy_without_blob_stands_for_itself() {
        let dir = TempDir::new().unwrap();
        let store = CacheStore::new(dir.path()).with_symlinks(Symlinks::Disabled);
        let model = store.repo(RepoType::Model, &RepoId::parse("org/model").unwrap());
        let pointer = model.insert_file("main", C1, "a.txt", b"aaa", None).unwrap();
        fs::remove_dir_all(model.layout().blobs_dir()).unwrap();

        let info = scan_repo(model.layout().root()).unwrap();
        let file = &info.revisions[0].files[0];
        assert_eq!(file.blob_path, pointer);
        assert_eq!(info.size_on_disk, 3);
    }

    #[cfg(unix)]
    #[test]
    fn test_broken_symlink_is_corruption() {
        let dir = populated();
        let repo_path = dir.path().join("datasets--squad");
        for blob in fs::read_dir(repo_path.join("blobs")).unwrap() {
            fs::remove_file(blob.unwrap().path()).unwrap();
        }
        let err = scan_repo(&repo_path).unwrap_err();
        assert!(err.to_string().contains("Blob missing"));
    }

    #[test]
    fn test_file_in_snapshots_is_corruption() {
        let dir = populated();
        let repo_path = dir.path().join("datasets--squad");
        fs::write(repo_path.join("snapshots/stray"), "x").unwrap();
        assert!(scan_repo(&repo_path).unwrap_err().to_string().contains("Found a file"));

        fs::remove_file(repo_path.join("snapshots/stray")).unwrap();
        fs::write(repo_path.join("snapshots/.DS_Store"), "x").unwrap();
        assert!(scan_repo(&repo_path).is_ok());
    }

    #[test]
    fn test_refs_as_file_is_corruption() {
        let dir = populated();
        let repo_path = dir.path().join("datasets--squad");
        fs::remove_dir_all(repo_path.join("refs")).unwrap();
        fs::write(repo_path.join("refs"), "x").unwrap();
        assert!(scan_repo(&repo_path).unwrap_err().to_string().contains("Refs directory"));
    }

    #[test]
    fn test_empty_repo_scans_with_zero_size() {
        let dir = TempDir::new().unwrap();
        fs::create_dir_all(dir.path().join("spaces--org--demo/snapshots")).unwrap();
        let info = scan_cache_dir(dir.path()).unwrap();
        let repo = info.repo(RepoType::Space, "org/demo").unwrap();
        assert_eq!(repo.size_on_disk, 0);
        assert_eq!(repo.nb_files, 0);
        assert!(repo.revisions.is_empty());
    }

    #[test]
    fn test_scan_serializes_to_json() {
        let dir = populated();
        let info = scan_cache_dir(dir.path()).unwrap();
        let json = serde_json::to_value(&info).unwrap();
        assert_eq!(json["repos"][0]["repo_type"], "dataset");
        assert!(json["warnings"].as_array().unwrap().is_empty());
    }
}
