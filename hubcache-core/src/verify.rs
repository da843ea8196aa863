//! Cache integrity verification
//!
//! Re-checks what a scan takes for granted: blobs hash to their name, every
//! snapshot entry still resolves to a blob and `.no_exist` markers are empty.
//! Snapshot copies are re-hashed and must match a blob.

use serde::Serialize;
use std::collections::BTreeSet;
use std::fs;
use std::path::PathBuf;

use walkdir::WalkDir;

use crate::error::{CacheError, Result};
use crate::hash::BlobHash;
use crate::layout::{INCOMPLETE_SUFFIX, RepoLayout};
use crate::scan::HubCacheInfo;
use crate::store::pointer_blob;

/// A single integrity problem
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum VerifyIssue {
    /// Blob content doesn't hash to its file name
    HashMismatch { path: PathBuf, actual: String },
    /// Blob name is not a hash this cache produces
    UnknownBlobName { path: PathBuf },
    /// Snapshot entry no longer resolves to a blob
    DanglingSnapshot { path: PathBuf },
    /// `.no_exist` marker with content
    NonEmptyMarker { path: PathBuf, size: u64 },
    /// Blob no snapshot refers to
    OrphanBlob { path: PathBuf, size: u64 },
    /// Leftover of an interrupted download
    IncompleteDownload { path: PathBuf, size: u64 },
}

impl VerifyIssue {
    /// Orphans and leftovers waste space but don't break reads
    pub fn is_error(&self) -> bool {
        !matches!(
            self,
            VerifyIssue::OrphanBlob { .. } | VerifyIssue::IncompleteDownload { .. }
        )
    }
}

#[derive(Debug, Default, Clone, Serialize)]
pub struct VerifyReport {
    pub repos_verified: usize,
    pub blobs_verified: usize,
    pub files_verified: usize,
    pub markers_verified: usize,
    pub issues: Vec<VerifyIssue>,
}

impl VerifyReport {
    pub fn errors(&self) -> usize {
        self.issues.iter().filter(|i| i.is_error()).count()
    }

    pub fn warnings(&self) -> usize {
        self.issues.len() - self.errors()
    }

    pub fn is_ok(&self) -> bool {
        self.errors() == 0
    }
}

/// Verify every repository of a scan
pub fn verify_cache(info: &HubCacheInfo) -> Result<VerifyReport> {
    let mut report = VerifyReport::default();

    for repo in &info.repos {
        let layout = RepoLayout::from_root(repo.repo_path.clone());
        let blobs_dir = fs::canonicalize(layout.blobs_dir()).unwrap_or_else(|_| layout.blobs_dir());
        let mut referenced: BTreeSet<PathBuf> = BTreeSet::new();

        for revision in &repo.revisions {
            for file in &revision.files {
                report.files_verified += 1;
                // a copy only resolves while its content still matches a blob
                match pointer_blob(&layout, &file.file_path) {
                    Ok(Some(blob)) => {
                        referenced.insert(blob);
                    }
                    _ => report.issues.push(VerifyIssue::DanglingSnapshot {
                        path: file.file_path.clone(),
                    }),
                }
            }
        }

        if blobs_dir.is_dir() {
            for entry in fs::read_dir(&blobs_dir)? {
                let path = entry?.path();
                if !path.is_file() {
                    continue;
                }
                let name = path
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_default();
                let size = fs::metadata(&path)?.len();

                if name.ends_with(INCOMPLETE_SUFFIX) {
                    report.issues.push(VerifyIssue::IncompleteDownload { path, size });
                    continue;
                }
                let Ok(hash) = BlobHash::from_hex(&name) else {
                    report.issues.push(VerifyIssue::UnknownBlobName { path });
                    continue;
                };

                report.blobs_verified += 1;
                if let Err(e) = hash.verify_file(&path) {
                    match e {
                        CacheError::HashMismatch { actual, .. } => {
                            report.issues.push(VerifyIssue::HashMismatch { path: path.clone(), actual })
                        }
                        other => return Err(other),
                    }
                }
                if !referenced.contains(&path) {
                    report.issues.push(VerifyIssue::OrphanBlob { path, size });
                }
            }
        }

        let no_exist_dir = layout.no_exist_dir();
        if no_exist_dir.is_dir() {
            for entry in WalkDir::new(&no_exist_dir) {
                let entry = entry.map_err(|e| CacheError::Io(e.into()))?;
                if !entry.file_type().is_file() {
                    continue;
                }
                report.markers_verified += 1;
                let size = entry.metadata().map_err(|e| CacheError::Io(e.into()))?.len();
                if size != 0 {
                    report.issues.push(VerifyIssue::NonEmptyMarker {
                        path: entry.path().to_path_buf(),
                        size,
                    });
                }
            }
        }

        report.repos_verified += 1;
        tracing::debug!("Verified {} ({} issues so far)", repo.repo_id, report.issues.len());
    }

    Ok(report)
}
