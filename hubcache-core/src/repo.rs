//! Repository identity: type, id and the cache folder naming convention
//!
//! A repository lives in the cache under a single folder named
//! `<repo_type>s--<namespace>--<repo_name>`, e.g. `models--openai--whisper`
//! or `datasets--squad` for an id without namespace.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::{CacheError, Result};

/// Separator used between parts of a cache folder name
pub const FOLDER_SEPARATOR: &str = "--";

const MAX_REPO_ID_LEN: usize = 96;

/// Kind of repository hosted on the Hub
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RepoType {
    #[default]
    Model,
    Dataset,
    Space,
}

impl RepoType {
    pub const ALL: [RepoType; 3] = [RepoType::Model, RepoType::Dataset, RepoType::Space];

    /// Singular name (`model`, `dataset`, `space`)
    pub fn as_str(&self) -> &'static str {
        match self {
            RepoType::Model => "model",
            RepoType::Dataset => "dataset",
            RepoType::Space => "space",
        }
    }

    /// Plural name used as cache folder prefix
    pub fn plural(&self) -> &'static str {
        match self {
            RepoType::Model => "models",
            RepoType::Dataset => "datasets",
            RepoType::Space => "spaces",
        }
    }

    /// Prefix used in `hf://` urls; empty for models
    pub fn url_prefix(&self) -> &'static str {
        match self {
            RepoType::Model => "",
            RepoType::Dataset => "datasets/",
            RepoType::Space => "spaces/",
        }
    }
}

impl fmt::Display for RepoType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RepoType {
    type Err = CacheError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "model" => Ok(RepoType::Model),
            "dataset" => Ok(RepoType::Dataset),
            "space" => Ok(RepoType::Space),
            other => Err(CacheError::InvalidRepoType(other.to_string())),
        }
    }
}

/// Repository identifier: `name` or `namespace/name`
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct RepoId {
    namespace: Option<String>,
    name: String,
}

impl RepoId {
    /// Parse and validate a repo id
    pub fn parse(id: &str) -> Result<Self> {
        let invalid = |reason: &str| CacheError::InvalidRepoId {
            id: id.to_string(),
            reason: reason.to_string(),
        };

        if id.is_empty() {
            return Err(invalid("empty"));
        }
        if id.len() > MAX_REPO_ID_LEN {
            return Err(invalid("too long"));
        }
        if id.contains(FOLDER_SEPARATOR) || id.contains("..") {
            return Err(invalid("'--' and '..' are forbidden"));
        }

        let mut parts = id.split('/');
        let first = parts.next().unwrap_or_default();
        let second = parts.next();
        if parts.next().is_some() {
            return Err(invalid("expected 'name' or 'namespace/name'"));
        }

        let (namespace, name) = match second {
            Some(name) => (Some(first), name),
            None => (None, first),
        };
        for part in namespace.iter().chain(std::iter::once(&name)) {
            validate_part(part).map_err(|reason| invalid(reason))?;
        }

        Ok(Self {
            namespace: namespace.map(str::to_string),
            name: name.to_string(),
        })
    }

    pub fn namespace(&self) -> Option<&str> {
        self.namespace.as_deref()
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Name of the folder holding this repo in the cache
    pub fn folder_name(&self, repo_type: RepoType) -> String {
        let mut folder = String::from(repo_type.plural());
        if let Some(ns) = &self.namespace {
            folder.push_str(FOLDER_SEPARATOR);
            folder.push_str(ns);
        }
        folder.push_str(FOLDER_SEPARATOR);
        folder.push_str(&self.name);
        folder
    }
}

fn validate_part(part: &str) -> std::result::Result<(), &'static str> {
    if part.is_empty() {
        return Err("empty segment");
    }
    if !part
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
    {
        return Err("only alphanumerics, '-', '_' and '.' are allowed");
    }
    if part.starts_with(['-', '.']) || part.ends_with(['-', '.']) {
        return Err("cannot start or end with '-' or '.'");
    }
    Ok(())
}

impl fmt::Display for RepoId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{}/{}", ns, self.name),
            None => f.write_str(&self.name),
        }
    }
}

impl FromStr for RepoId {
    type Err = CacheError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl TryFrom<String> for RepoId {
    type Error = CacheError;

    fn try_from(s: String) -> Result<Self> {
        Self::parse(&s)
    }
}

impl From<RepoId> for String {
    fn from(id: RepoId) -> Self {
        id.to_string()
    }
}

/// Split a cache folder name back into its repo type and repo id.
///
/// Returns the reason as a plain string so callers can wrap it into a
/// corrupted-cache error pointing at the folder.
pub fn parse_folder_name(folder: &str) -> std::result::Result<(RepoType, String), String> {
    let (type_part, id_part) = folder
        .split_once(FOLDER_SEPARATOR)
        .ok_or_else(|| "Repo path is not a valid cache directory".to_string())?;

    let repo_type = type_part
        .strip_suffix('s')
        .and_then(|t| t.parse::<RepoType>().ok())
        .ok_or_else(|| {
            format!(
                "Repo type must be `dataset`, `model` or `space`, found `{}`",
                type_part.strip_suffix('s').unwrap_or(type_part)
            )
        })?;

    Ok((repo_type, id_part.replace(FOLDER_SEPARATOR, "/")))
}
