//! Planning and executing cache deletions
//!
//! A plan is computed from a scan: deleting a revision removes its snapshot,
//! the refs pointing to it and every blob no other revision still uses.
//! Removing the last revision of a repository removes the whole folder.

use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use crate::format::format_size;
use crate::layout::RepoLayout;
use crate::scan::{CachedRepoInfo, CachedRevisionInfo, HubCacheInfo};

/// Paths to delete, grouped by kind, and the space it frees
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DeleteCacheStrategy {
    pub expected_freed_size: u64,
    pub repos: BTreeSet<PathBuf>,
    pub snapshots: BTreeSet<PathBuf>,
    pub refs: BTreeSet<PathBuf>,
    pub blobs: BTreeSet<PathBuf>,
    /// `.no_exist/<commit>` folders of deleted revisions
    pub no_exist: BTreeSet<PathBuf>,
    /// Requested revisions that are not in the cache
    pub not_found: BTreeSet<String>,
}

/// What `DeleteCacheStrategy::execute` actually did
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DeleteReport {
    pub deleted: Vec<PathBuf>,
    /// Paths that could not be deleted, with the reason
    pub skipped: Vec<(PathBuf, String)>,
    pub freed_size: u64,
}

impl HubCacheInfo {
    /// Plan the deletion of the given commit hashes.
    ///
    /// Unknown hashes are logged and ignored.
    pub fn delete_revisions<I, S>(&self, revisions: I) -> DeleteCacheStrategy
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut to_delete: BTreeSet<String> = revisions
            .into_iter()
            .map(|r| r.as_ref().to_string())
            .collect();

        // Keyed by repo path so the plan doesn't depend on scan order
        let mut affected: BTreeMap<&Path, (&CachedRepoInfo, Vec<&CachedRevisionInfo>)> = BTreeMap::new();
        for repo in &self.repos {
            for revision in &repo.revisions {
                if to_delete.remove(&revision.commit_hash) {
                    affected
                        .entry(repo.repo_path.as_path())
                        .or_insert_with(|| (repo, Vec::new()))
                        .1
                        .push(revision);
                }
            }
        }

        let mut strategy = DeleteCacheStrategy::default();
        if !to_delete.is_empty() {
            tracing::warn!(
                "Revision(s) not found - cannot delete them: {}",
                to_delete.iter().cloned().collect::<Vec<_>>().join(", ")
            );
            strategy.not_found = to_delete;
        }

        for (repo, deleted) in affected.into_values() {
            plan_repo(&mut strategy, repo, &deleted);
        }
        strategy
    }

    /// Plan the deletion of every revision no ref points to
    pub fn prune(&self) -> DeleteCacheStrategy {
        self.delete_revisions(self.detached_revisions())
    }
}

fn plan_repo(strategy: &mut DeleteCacheStrategy, repo: &CachedRepoInfo, deleted: &[&CachedRevisionInfo]) {
    let deleted_hashes: HashSet<&str> = deleted.iter().map(|r| r.commit_hash.as_str()).collect();
    let remaining: Vec<&CachedRevisionInfo> = repo
        .revisions
        .iter()
        .filter(|r| !deleted_hashes.contains(r.commit_hash.as_str()))
        .collect();

    if remaining.is_empty() {
        strategy.repos.insert(repo.repo_path.clone());
        strategy.expected_freed_size += repo.size_on_disk;
        return;
    }

    let kept_blobs: HashSet<&Path> = remaining
        .iter()
        .flat_map(|r| r.files.iter().map(|f| f.blob_path.as_path()))
        .collect();
    let layout = RepoLayout::from_root(repo.repo_path.clone());

    for revision in deleted {
        strategy.snapshots.insert(revision.snapshot_path.clone());
        if let Ok(no_exist) = layout.no_exist_commit_dir(&revision.commit_hash) {
            if no_exist.is_dir() {
                strategy.no_exist.insert(no_exist);
            }
        }
        for name in &revision.refs {
            if let Ok(path) = layout.ref_path(name) {
                strategy.refs.insert(path);
            }
        }
        for file in &revision.files {
            if kept_blobs.contains(file.blob_path.as_path()) {
                continue;
            }
            if strategy.blobs.insert(file.blob_path.clone()) {
                strategy.expected_freed_size += file.size_on_disk;
            }
        }
    }
}

impl DeleteCacheStrategy {
    pub fn expected_freed_size_str(&self) -> String {
        format_size(self.expected_freed_size)
    }

    pub fn is_empty(&self) -> bool {
        self.repos.is_empty()
            && self.snapshots.is_empty()
            && self.refs.is_empty()
            && self.blobs.is_empty()
            && self.no_exist.is_empty()
    }

    /// Every path the plan touches, in execution order
    pub fn paths(&self) -> impl Iterator<Item = (&'static str, &PathBuf)> {
        self.repos
            .iter()
            .map(|p| ("repo", p))
            .chain(self.snapshots.iter().map(|p| ("snapshot", p)))
            .chain(self.no_exist.iter().map(|p| ("no_exist", p)))
            .chain(self.refs.iter().map(|p| ("ref", p)))
            .chain(self.blobs.iter().map(|p| ("blob", p)))
    }

    /// Delete everything in the plan.
    ///
    /// Missing paths and permission errors are logged and skipped; the
    /// remaining paths are still deleted.
    pub fn execute(&self) -> DeleteReport {
        let mut report = DeleteReport::default();
        for (kind, path) in self.paths() {
            match try_delete_path(path, kind) {
                Ok(()) => report.deleted.push(path.clone()),
                Err(reason) => report.skipped.push((path.clone(), reason)),
            }
        }
        report.freed_size = if report.skipped.is_empty() {
            self.expected_freed_size
        } else {
            self.expected_freed_size.saturating_sub(self.skipped_size(&report))
        };
        tracing::info!("Cache deletion done. Saved {}.", format_size(report.freed_size));
        report
    }

    fn skipped_size(&self, report: &DeleteReport) -> u64 {
        report
            .skipped
            .iter()
            .filter(|(p, _)| self.blobs.contains(p))
            .filter_map(|(p, _)| fs::metadata(p).ok())
            .map(|m| m.len())
            .sum()
    }
}

fn try_delete_path(path: &Path, kind: &str) -> Result<(), String> {
    tracing::info!("Delete {}: {}", kind, path.display());
    let result = match fs::symlink_metadata(path) {
        Ok(meta) if meta.is_dir() => fs::remove_dir_all(path),
        Ok(_) => fs::remove_file(path),
        Err(e) => Err(e),
    };
    match result {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => {
            tracing::warn!("Couldn't delete {}: file not found ({})", kind, path.display());
            Err("file not found".to_string())
        }
        Err(e) if e.kind() == ErrorKind::PermissionDenied => {
            tracing::warn!("Couldn't delete {}: permission denied ({})", kind, path.display());
            Err("permission denied".to_string())
        }
        Err(e) => {
            tracing::warn!("Couldn't delete {}: {} ({})", kind, e, path.display());
            Err(e.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hash::BlobHash;
    use crate::repo::{RepoId, RepoType};
    use crate::scan::scan_cache_dir;
    use crate::store::{CacheStore, Symlinks};
    use tempfile::TempDir;

    const C1: &str = "1111111111111111111111111111111111111111";
    const C2: &str = "2222222222222222222222222222222222222222";
    const C3: &str = "3333333333333333333333333333333333333333";

    fn shared_weights() -> (Vec<u8>, BlobHash) {
        let data = vec![1u8; 1000];
        let hash = BlobHash::sha256(&data);
        (data, hash)
    }

    /// Model with two revisions sharing a weights blob, dataset with one
    fn populated() -> TempDir {
        let dir = TempDir::new().unwrap();
        let store = CacheStore::new(dir.path());
        let (weights, hash) = shared_weights();

        let model = store.repo(RepoType::Model, &RepoId::parse("org/model").unwrap());
        model.insert_file("main", C1, "config.json", b"v1", None).unwrap();
        model.insert_file("main", C1, "weights.bin", &weights, Some(hash)).unwrap();
        model.insert_file("refs/pr/1", C2, "config.json", b"v2", None).unwrap();
        model.insert_file("refs/pr/1", C2, "weights.bin", &weights, Some(hash)).unwrap();
        model.mark_missing("refs/pr/1", C2, "tokenizer.json").unwrap();

        let dataset = store.repo(RepoType::Dataset, &RepoId::parse("squad").unwrap());
        dataset.insert_file("main", C3, "data.csv", b"a,b", None).unwrap();
        dir
    }

    #[test]
    fn test_delete_one_of_two_revisions_keeps_shared_blob() {
        let dir = populated();
        let info = scan_cache_dir(dir.path()).unwrap();
        let strategy = info.delete_revisions([C2]);

        let repo_path = info.repo(RepoType::Model, "org/model").unwrap().repo_path.clone();
        assert!(strategy.repos.is_empty());
        assert_eq!(strategy.snapshots.len(), 1);
        assert_eq!(
            strategy.refs,
            BTreeSet::from([repo_path.join("refs").join("refs/pr/1")])
        );
        // only the v2 config is unique to C2
        assert_eq!(strategy.blobs.len(), 1);
        assert_eq!(strategy.expected_freed_size, 2);
        assert_eq!(strategy.no_exist.len(), 1);

        let report = strategy.execute();
        assert!(report.skipped.is_empty());

        let after = scan_cache_dir(dir.path()).unwrap();
        assert!(after.warnings.is_empty());
        let model = after.repo(RepoType::Model, "org/model").unwrap();
        assert_eq!(model.revisions.len(), 1);
        assert_eq!(model.size_on_disk, 1002);
        assert!(!repo_path.join(".no_exist").join(C2).exists());
    }

    #[test]
    fn test_delete_revision_in_copy_mode_removes_its_blob() {
        let dir = TempDir::new().unwrap();
        let store = CacheStore::new(dir.path()).with_symlinks(Symlinks::Disabled);
        let model = store.repo(RepoType::Model, &RepoId::parse("org/model").unwrap());
        model.insert_file("main", C1, "a.txt", b"only in C1", None).unwrap();
        model.insert_file("dev", C2, "b.txt", b"only in C2", None).unwrap();
        let a_blob = model.layout().blob_path(&BlobHash::git_sha1(b"only in C1"));
        let b_blob = model.layout().blob_path(&BlobHash::git_sha1(b"only in C2"));

        let strategy = scan_cache_dir(dir.path()).unwrap().delete_revisions([C1]);
        assert_eq!(
            strategy.blobs,
            BTreeSet::from([fs::canonicalize(&a_blob).unwrap()])
        );
        assert_eq!(strategy.expected_freed_size, 10);

        let report = strategy.execute();
        assert!(report.skipped.is_empty(), "{:?}", report.skipped);
        assert_eq!(report.freed_size, 10);
        assert!(!a_blob.exists());
        assert!(b_blob.is_file());
    }

    #[test]
    fn test_delete_all_revisions_removes_repo() {
        let dir = populated();
        let info = scan_cache_dir(dir.path()).unwrap();
        let repo_path = info.repo(RepoType::Model, "org/model").unwrap().repo_path.clone();

        let strategy = info.delete_revisions([C1, C2]);
        assert_eq!(strategy.repos, BTreeSet::from([repo_path.clone()]));
        assert!(strategy.snapshots.is_empty() && strategy.blobs.is_empty() && strategy.refs.is_empty());
        assert_eq!(strategy.expected_freed_size, 1004);

        strategy.execute();
        assert!(!repo_path.exists());
        let after = scan_cache_dir(dir.path()).unwrap();
        assert_eq!(after.repos.len(), 1);
    }

    #[test]
    fn test_unknown_revisions_are_ignored() {
        let dir = populated();
        let info = scan_cache_dir(dir.path()).unwrap();
        let strategy = info.delete_revisions(["deadbeef", C3]);
        assert_eq!(strategy.not_found, BTreeSet::from(["deadbeef".to_string()]));
        assert_eq!(strategy.repos.len(), 1);

        let nothing = info.delete_revisions(["deadbeef"]);
        assert!(nothing.is_empty());
        assert_eq!(nothing.expected_freed_size, 0);
    }

    #[test]
    fn test_execute_tolerates_missing_paths() {
        let dir = populated();
        let info = scan_cache_dir(dir.path()).unwrap();
        let strategy = info.delete_revisions([C2, C3]);

        // Something else removed the snapshot in the meantime
        for snapshot in &strategy.snapshots {
            fs::remove_dir_all(snapshot).unwrap();
        }
        let report = strategy.execute();
        assert_eq!(report.skipped.len(), strategy.snapshots.len());
        assert!(report.skipped.iter().all(|(_, reason)| reason == "file not found"));
        for repo in &strategy.repos {
            assert!(!repo.exists());
        }
        for blob in &strategy.blobs {
            assert!(!blob.exists());
        }
    }

    #[test]
    fn test_prune_removes_detached_revisions() {
        let dir = populated();
        let repo_path = dir.path().join("models--org--model");
        fs::remove_file(repo_path.join("refs/refs/pr/1")).unwrap();

        let info = scan_cache_dir(dir.path()).unwrap();
        let strategy = info.prune();
        assert_eq!(strategy.snapshots, BTreeSet::from([repo_path.join("snapshots").join(C2)]));
        strategy.execute();

        let after = scan_cache_dir(dir.path()).unwrap();
        assert!(after.detached_revisions().is_empty());
        assert_eq!(after.repos.len(), 2);
    }
}
