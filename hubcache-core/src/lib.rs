//! hubcache Core Library
//!
//! Local cache of Hub repositories (models, datasets, spaces):
//! - Cache layout and repository folder naming
//! - Content-addressed blobs (git-sha1 / sha256)
//! - Cache writer and offline lookups
//! - Cache scan, deletion strategies and pruning
//! - Integrity verification
//! - `hf://` urls and a read-only filesystem over snapshots
//! - Scheduled background commits of a local folder
//! - Environment-driven configuration

pub mod config;
pub mod delete;
pub mod error;
pub mod format;
pub mod fs;
pub mod hash;
pub mod layout;
pub mod repo;
pub mod scan;
pub mod scheduler;
pub mod store;
pub mod url;
pub mod verify;

pub use config::HubConfig;
pub use delete::{DeleteCacheStrategy, DeleteReport};
pub use error::{CacheError, Result};
pub use format::{format_size, format_timesince, tabulate};
pub use fs::{CacheFileSystem, EntryKind, FileInfo, ResolvedPath};
pub use hash::BlobHash;
pub use layout::{RepoLayout, cached_assets_path};
pub use repo::{RepoId, RepoType};
pub use scan::{CachedFileInfo, CachedRepoInfo, CachedRevisionInfo, HubCacheInfo, scan_cache_dir};
pub use scheduler::{
    CommitInfo, CommitOperation, CommitScheduler, CommitSink, LocalCacheSink, SchedulerOptions,
};
pub use store::{CacheLookup, CacheStore, RepoCache, Symlinks};
pub use url::{HfUrl, RepoResolver};
pub use verify::{VerifyIssue, VerifyReport, verify_cache};
