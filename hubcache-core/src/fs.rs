//! Read-only filesystem over cached snapshots
//!
//! Paths are `hf://` urls; nothing here touches the network, so a url only
//! resolves if its revision has been cached.

use bytes::Bytes;
use regex::Regex;
use serde::Serialize;
use std::fs;
use std::path::PathBuf;

use crate::error::{CacheError, Result};
use crate::layout::DEFAULT_REVISION;
use crate::store::{CacheStore, RepoCache};
use crate::url::HfUrl;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryKind {
    File,
    Directory,
}

/// Metadata of a snapshot entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FileInfo {
    /// Canonical `hf://` url of the entry
    pub name: String,
    pub size: u64,
    #[serde(rename = "type")]
    pub kind: EntryKind,
    /// Blob the entry links to; `None` for directories and copied files
    pub blob: Option<String>,
}

impl FileInfo {
    pub fn is_dir(&self) -> bool {
        self.kind == EntryKind::Directory
    }
}

/// A url pinned to a cached commit
#[derive(Debug, Clone)]
pub struct ResolvedPath {
    pub url: HfUrl,
    pub commit: String,
    repo: RepoCache,
}

impl ResolvedPath {
    /// Location of the entry inside the snapshot folder
    pub fn local_path(&self) -> Result<PathBuf> {
        if self.url.path_in_repo.is_empty() {
            self.repo.layout().snapshot_dir(&self.commit)
        } else {
            self.repo.layout().snapshot_path(&self.commit, &self.url.path_in_repo)
        }
    }

    pub fn repo(&self) -> &RepoCache {
        &self.repo
    }
}

pub struct CacheFileSystem {
    store: CacheStore,
}

impl CacheFileSystem {
    pub fn new(store: CacheStore) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &CacheStore {
        &self.store
    }

    /// Parse a url and pin its revision (default `main`) to a cached commit
    pub fn resolve(&self, url: &str) -> Result<ResolvedPath> {
        let url = HfUrl::resolve(url, &self.store)?;
        let repo = self.store.repo(url.repo_type, &url.repo_id);
        let revision = url.revision.as_deref().unwrap_or(DEFAULT_REVISION);
        let commit = repo
            .resolve_revision(revision)?
            .ok_or_else(|| CacheError::RevisionNotFound(format!("{} ({})", revision, url.repo_id)))?;
        Ok(ResolvedPath { url, commit, repo })
    }

    pub fn info(&self, url: &str) -> Result<FileInfo> {
        let resolved = self.resolve(url)?;
        entry_info(&resolved.url, resolved.local_path()?)
    }

    /// Entries of a directory, or the file itself
    pub fn ls(&self, url: &str) -> Result<Vec<FileInfo>> {
        let resolved = self.resolve(url)?;
        let path = resolved.local_path()?;
        let info = entry_info(&resolved.url, path.clone())?;
        if !info.is_dir() {
            return Ok(vec![info]);
        }

        let mut names: Vec<String> = fs::read_dir(&path)?
            .map(|entry| entry.map(|e| e.file_name().to_string_lossy().into_owned()))
            .collect::<std::io::Result<_>>()?;
        names.sort();
        names
            .into_iter()
            .map(|name| entry_info(&resolved.url.join(&name), path.join(&name)))
            .collect()
    }

    pub fn read(&self, url: &str) -> Result<Bytes> {
        let resolved = self.resolve(url)?;
        let path = resolved.local_path()?;
        let info = entry_info(&resolved.url, path.clone())?;
        if info.is_dir() {
            return Err(CacheError::InvalidPath(format!("{} is a directory", info.name)));
        }
        Ok(Bytes::from(fs::read(&path)?))
    }

    pub fn exists(&self, url: &str) -> bool {
        self.info(url).is_ok()
    }

    /// Files of the snapshot whose path matches the url's path pattern
    pub fn glob(&self, url: &str) -> Result<Vec<HfUrl>> {
        let resolved = self.resolve(url)?;
        let pattern = pattern_regex(&resolved.url.path_in_repo, false)?;
        let root = resolved.url.repo_root();
        Ok(resolved
            .repo
            .snapshot_files(&resolved.commit)?
            .into_iter()
            .filter(|(path, _)| pattern.is_match(path))
            .map(|(path, _)| root.join(&path))
            .collect())
    }
}

fn entry_info(url: &HfUrl, path: PathBuf) -> Result<FileInfo> {
    let name = url.to_string();
    let metadata = match fs::metadata(&path) {
        Ok(metadata) => metadata,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(CacheError::EntryNotFound(name));
        }
        Err(e) => return Err(e.into()),
    };
    if metadata.is_dir() {
        return Ok(FileInfo {
            name,
            size: 0,
            kind: EntryKind::Directory,
            blob: None,
        });
    }

    let is_link = fs::symlink_metadata(&path)?.file_type().is_symlink();
    let blob = if is_link {
        fs::canonicalize(&path)?
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
    } else {
        None
    };
    Ok(FileInfo {
        name,
        size: metadata.len(),
        kind: EntryKind::File,
        blob,
    })
}

/// Compile an fnmatch-style pattern.
///
/// `**` matches across `/`; `*` and `?` only do when `star_crosses_slash`.
/// `[...]` classes are supported, `[!...]` negates.
pub(crate) fn pattern_regex(pattern: &str, star_crosses_slash: bool) -> Result<Regex> {
    let (any, one) = if star_crosses_slash { (".*", ".") } else { ("[^/]*", "[^/]") };
    let mut out = String::from("^");
    let chars: Vec<char> = pattern.chars().collect();
    let mut i = 0;
    while i < chars.len() {
        match chars[i] {
            '*' if chars.get(i + 1) == Some(&'*') => {
                if chars.get(i + 2) == Some(&'/') {
                    out.push_str("(?:.*/)?");
                    i += 3;
                } else {
                    out.push_str(".*");
                    i += 2;
                }
                continue;
            }
            '*' => out.push_str(any),
            '?' => out.push_str(one),
            '[' => match chars[i + 1..].iter().position(|&c| c == ']') {
                Some(len) if len > 0 => {
                    let class: String = chars[i + 1..i + 1 + len].iter().collect();
                    let class = match class.strip_prefix('!') {
                        Some(rest) => format!("^{}", rest),
                        None => class,
                    };
                    out.push('[');
                    out.push_str(&class.replace('\\', "\\\\"));
                    out.push(']');
                    i += len + 2;
                    continue;
                }
                _ => out.push_str(r"\["),
            },
            c => out.push_str(&regex::escape(c.encode_utf8(&mut [0; 4]))),
        }
        i += 1;
    }
    out.push('$');
    Regex::new(&out).map_err(|_| CacheError::InvalidPath(pattern.to_string()))
}
