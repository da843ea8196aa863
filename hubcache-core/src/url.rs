//! `hf://` urls
//!
//! ```text
//! hf://[datasets/|spaces/]<repo_id>[@<revision>]/<path/in/repo>
//! ```
//!
//! A revision containing `/` is percent-encoded (`refs%2Fheads%2Fdev`),
//! except the special refs `refs/pr/<n>` and `refs/convert/<name>` which may
//! appear as-is.

use lazy_static::lazy_static;
use percent_encoding::{AsciiSet, NON_ALPHANUMERIC, percent_decode_str, utf8_percent_encode};
use regex::Regex;
use std::fmt;
use std::str::FromStr;

use crate::error::{CacheError, Result};
use crate::repo::{RepoId, RepoType};
use crate::store::CacheStore;

pub const SCHEME: &str = "hf://";

/// Everything but unreserved characters is encoded in a revision
const REVISION_ENCODE_SET: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'.')
    .remove(b'_')
    .remove(b'~');

lazy_static! {
    static ref SPECIAL_REF: Regex =
        Regex::new(r"^(refs/pr/\d+|refs/convert/[A-Za-z0-9_.-]+)(/|$)").unwrap();
}

/// Answers whether a repository exists, to split ambiguous paths
pub trait RepoResolver {
    fn repo_exists(&self, repo_type: RepoType, repo_id: &RepoId) -> bool;
}

impl RepoResolver for CacheStore {
    fn repo_exists(&self, repo_type: RepoType, repo_id: &RepoId) -> bool {
        self.contains_repo(repo_type, repo_id)
    }
}

/// Resolver that knows nothing: `namespace/name` is always preferred
struct AssumeNamespaced;

impl RepoResolver for AssumeNamespaced {
    fn repo_exists(&self, _repo_type: RepoType, _repo_id: &RepoId) -> bool {
        true
    }
}

/// Parsed `hf://` url
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct HfUrl {
    pub repo_type: RepoType,
    pub repo_id: RepoId,
    /// Decoded revision; `None` means the default branch
    pub revision: Option<String>,
    /// `/`-separated path, empty for the repository root
    pub path_in_repo: String,
}

impl HfUrl {
    /// Parse a url, taking two segments as the repo id when available
    pub fn parse(url: &str) -> Result<Self> {
        Self::resolve(url, &AssumeNamespaced)
    }

    /// Parse a url, asking `resolver` which repo id exists when the
    /// url has no `@revision` to delimit it
    pub fn resolve(url: &str, resolver: &dyn RepoResolver) -> Result<Self> {
        let invalid = |reason: &str| CacheError::InvalidUrl {
            url: url.to_string(),
            reason: reason.to_string(),
        };

        let path = url.strip_prefix(SCHEME).unwrap_or(url).trim_matches('/');
        if path.is_empty() {
            return Err(invalid("empty path"));
        }

        let (repo_type, path) = if let Some(rest) = path.strip_prefix("datasets/") {
            (RepoType::Dataset, rest)
        } else if let Some(rest) = path.strip_prefix("spaces/") {
            (RepoType::Space, rest)
        } else if let Some(rest) = path.strip_prefix("models/") {
            (RepoType::Model, rest)
        } else {
            (RepoType::Model, path)
        };
        if path.is_empty() || matches!(path, "datasets" | "spaces" | "models") {
            return Err(invalid("missing repo id"));
        }

        if let Some((repo_part, rest)) = path.split_once('@') {
            let repo_id = RepoId::parse(repo_part).map_err(|e| invalid(&e.to_string()))?;
            let (raw_revision, path_in_repo) = match SPECIAL_REF.captures(rest) {
                Some(caps) => {
                    let special = caps.get(1).map_or("", |m| m.as_str());
                    (special, rest[special.len()..].trim_start_matches('/'))
                }
                None => rest.split_once('/').unwrap_or((rest, "")),
            };
            if raw_revision.is_empty() {
                return Err(invalid("empty revision after '@'"));
            }
            let revision = percent_decode_str(raw_revision)
                .decode_utf8()
                .map_err(|_| invalid("revision is not valid utf-8"))?
                .into_owned();
            return Ok(Self {
                repo_type,
                repo_id,
                revision: Some(revision),
                path_in_repo: path_in_repo.to_string(),
            });
        }

        let segments: Vec<&str> = path.split('/').collect();
        if segments.len() >= 2 {
            let namespaced = RepoId::parse(&segments[..2].join("/"));
            if let Ok(repo_id) = &namespaced {
                if resolver.repo_exists(repo_type, repo_id) {
                    return Ok(Self {
                        repo_type,
                        repo_id: repo_id.clone(),
                        revision: None,
                        path_in_repo: segments[2..].join("/"),
                    });
                }
            }
        }

        let repo_id = RepoId::parse(segments[0]).map_err(|e| invalid(&e.to_string()))?;
        if segments.len() >= 2 && !resolver.repo_exists(repo_type, &repo_id) {
            return Err(invalid("repository not found"));
        }
        Ok(Self {
            repo_type,
            repo_id,
            revision: None,
            path_in_repo: segments[1..].join("/"),
        })
    }

    /// Same repository and revision, other path
    pub fn join(&self, path: &str) -> Self {
        let path = path.trim_matches('/');
        let path_in_repo = match (self.path_in_repo.is_empty(), path.is_empty()) {
            (_, true) => self.path_in_repo.clone(),
            (true, false) => path.to_string(),
            (false, false) => format!("{}/{}", self.path_in_repo, path),
        };
        Self {
            path_in_repo,
            ..self.clone()
        }
    }

    /// The url without its path
    pub fn repo_root(&self) -> Self {
        Self {
            path_in_repo: String::new(),
            ..self.clone()
        }
    }
}

/// Revision as it appears in a url
pub fn encode_revision(revision: &str) -> String {
    match SPECIAL_REF.captures(revision) {
        Some(caps) if caps.get(1).is_some_and(|m| m.as_str() == revision) => revision.to_string(),
        _ => utf8_percent_encode(revision, REVISION_ENCODE_SET).to_string(),
    }
}

impl fmt::Display for HfUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}{}", SCHEME, self.repo_type.url_prefix(), self.repo_id)?;
        if let Some(revision) = &self.revision {
            write!(f, "@{}", encode_revision(revision))?;
        }
        if !self.path_in_repo.is_empty() {
            write!(f, "/{}", self.path_in_repo)?;
        }
        Ok(())
    }
}

impl FromStr for HfUrl {
    type Err = CacheError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}
