//! Client configuration resolved from environment variables.
//!
//! Every value has a default derived from `HF_HOME`; construction goes
//! through a lookup function so callers (and tests) can supply their own
//! environment instead of the process one.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

pub const DEFAULT_ENDPOINT: &str = "https://huggingface.co";
const DEFAULT_TIMEOUT_SECS: u64 = 10;

/// Resolved configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HubConfig {
    /// Root folder for everything the client stores (`HF_HOME`).
    pub home: PathBuf,
    /// Repository cache (`HF_HUB_CACHE`).
    pub hub_cache: PathBuf,
    /// Library assets cache (`HF_ASSETS_CACHE`).
    pub assets_cache: PathBuf,
    /// Where a saved token is read from (`HF_TOKEN_PATH`).
    pub token_path: PathBuf,
    /// Access token; `HF_TOKEN` takes precedence over the token file.
    #[serde(skip_serializing)]
    pub token: Option<String>,
    /// Hub base url (`HF_ENDPOINT`).
    pub endpoint: String,
    pub offline: bool,
    pub disable_symlinks_warning: bool,
    pub disable_telemetry: bool,
    pub disable_progress_bars: bool,
    pub enable_hf_transfer: bool,
    pub etag_timeout_secs: u64,
    pub download_timeout_secs: u64,
    /// Secret shared with webhook senders (`WEBHOOK_SECRET`).
    #[serde(skip_serializing)]
    pub webhook_secret: Option<String>,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self::from_lookup(|_| None)
    }
}

impl HubConfig {
    /// Read configuration from the process environment.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build configuration from an arbitrary variable lookup.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |key: &str| lookup(key).filter(|v| !v.is_empty());
        let path_var = |key: &str| var(key).map(|v| expand_home(&v));
        let flag = |key: &str| var(key).is_some_and(|v| is_true(&v));
        let secs = |key: &str| {
            var(key)
                .and_then(|v| v.trim().parse().ok())
                .unwrap_or(DEFAULT_TIMEOUT_SECS)
        };

        let home = path_var("HF_HOME").unwrap_or_else(|| {
            path_var("XDG_CACHE_HOME")
                .unwrap_or_else(|| expand_home("~/.cache"))
                .join("huggingface")
        });
        let hub_cache = path_var("HF_HUB_CACHE")
            .or_else(|| path_var("HUGGINGFACE_HUB_CACHE"))
            .unwrap_or_else(|| home.join("hub"));
        let assets_cache = path_var("HF_ASSETS_CACHE")
            .or_else(|| path_var("HUGGINGFACE_ASSETS_CACHE"))
            .unwrap_or_else(|| home.join("assets"));
        let token_path = path_var("HF_TOKEN_PATH").unwrap_or_else(|| home.join("token"));

        let token = var("HF_TOKEN")
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty())
            .or_else(|| read_token_file(&token_path));

        Self {
            offline: flag("HF_HUB_OFFLINE") || flag("TRANSFORMERS_OFFLINE"),
            disable_symlinks_warning: flag("HF_HUB_DISABLE_SYMLINKS_WARNING"),
            disable_telemetry: flag("HF_HUB_DISABLE_TELEMETRY"),
            disable_progress_bars: flag("HF_HUB_DISABLE_PROGRESS_BARS"),
            enable_hf_transfer: flag("HF_HUB_ENABLE_HF_TRANSFER"),
            etag_timeout_secs: secs("HF_HUB_ETAG_TIMEOUT"),
            download_timeout_secs: secs("HF_HUB_DOWNLOAD_TIMEOUT"),
            endpoint: var("HF_ENDPOINT")
                .map(|e| e.trim_end_matches('/').to_string())
                .unwrap_or_else(|| DEFAULT_ENDPOINT.to_string()),
            webhook_secret: var("WEBHOOK_SECRET"),
            home,
            hub_cache,
            assets_cache,
            token_path,
            token,
        }
    }

    /// Key/value report printed by `hubcache env`; secrets are masked.
    pub fn summary(&self) -> Vec<(&'static str, String)> {
        let masked = |s: &Option<String>| match s {
            Some(_) => "<set>".to_string(),
            None => "<not set>".to_string(),
        };
        vec![
            ("HF_HOME", self.home.display().to_string()),
            ("HF_HUB_CACHE", self.hub_cache.display().to_string()),
            ("HF_ASSETS_CACHE", self.assets_cache.display().to_string()),
            ("HF_TOKEN_PATH", self.token_path.display().to_string()),
            ("HF_TOKEN", masked(&self.token)),
            ("HF_ENDPOINT", self.endpoint.clone()),
            ("HF_HUB_OFFLINE", self.offline.to_string()),
            (
                "HF_HUB_DISABLE_SYMLINKS_WARNING",
                self.disable_symlinks_warning.to_string(),
            ),
            ("HF_HUB_DISABLE_TELEMETRY", self.disable_telemetry.to_string()),
            (
                "HF_HUB_DISABLE_PROGRESS_BARS",
                self.disable_progress_bars.to_string(),
            ),
            ("HF_HUB_ENABLE_HF_TRANSFER", self.enable_hf_transfer.to_string()),
            ("HF_HUB_ETAG_TIMEOUT", self.etag_timeout_secs.to_string()),
            ("HF_HUB_DOWNLOAD_TIMEOUT", self.download_timeout_secs.to_string()),
            ("WEBHOOK_SECRET", masked(&self.webhook_secret)),
        ]
    }
}

/// `1`, `ON`, `YES` and `TRUE` (any case) are true; anything else is false.
pub fn is_true(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_uppercase().as_str(),
        "1" | "ON" | "YES" | "TRUE"
    )
}

fn expand_home(path: &str) -> PathBuf {
    if path == "~" {
        return dirs::home_dir().unwrap_or_else(|| PathBuf::from(path));
    }
    match path.strip_prefix("~/") {
        Some(rest) => dirs::home_dir()
            .map(|home| home.join(rest))
            .unwrap_or_else(|| PathBuf::from(path)),
        None => PathBuf::from(path),
    }
}

fn read_token_file(path: &Path) -> Option<String> {
    let token = std::fs::read_to_string(path).ok()?;
    let token = token.trim();
    if token.is_empty() {
        None
    } else {
        Some(token.to_string())
    }
}
