//! Configuration management for `gantry`.
//!
//! Configuration sources and precedence (highest wins):
//! 1. CLI overrides
//! 2. Environment variables (`GANTRY_REMOTE_URL`, `GANTRY_REMOTE_USER`,
//!    `GANTRY_REMOTE_TOKEN`)
//! 3. Config file (gantry.yaml)
//! 4. Defaults

use std::env;
use std::fs;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{GantryError, Result};
use crate::model::Priority;

/// Default attachment worker pool size.
pub const DEFAULT_TRANSFER_WORKERS: usize = 10;
/// Default download attempts per attachment.
pub const DEFAULT_TRANSFER_ATTEMPTS: u32 = 5;
/// Default delay between download attempts.
pub const DEFAULT_RETRY_DELAY_MS: u64 = 30_000;
/// Default remote search page size.
pub const DEFAULT_PAGE_SIZE: u64 = 50;

/// Connection settings for the remote tracker.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RemoteSettings {
    /// Base URL of the remote tracker, e.g. `https://example.atlassian.net`.
    #[serde(default)]
    pub base_url: String,
    /// Account name for basic auth (email for cloud trackers).
    #[serde(default)]
    pub user: Option<String>,
    /// API token for basic auth.
    #[serde(default)]
    pub token: Option<String>,
}

/// Source-system priority ids, mapped onto target priorities.
///
/// Table-driven so the mapper works against differently configured source
/// systems without code changes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PriorityMap {
    pub urgent: String,
    pub high: String,
    pub medium: String,
    pub low: String,
}

impl Default for PriorityMap {
    fn default() -> Self {
        // Stock priority ids of a fresh Jira instance (Highest..Low).
        Self {
            urgent: "1".to_string(),
            high: "2".to_string(),
            medium: "3".to_string(),
            low: "4".to_string(),
        }
    }
}

impl PriorityMap {
    /// Translate a source priority id; unknown or absent ids map to
    /// [`Priority::None`].
    #[must_use]
    pub fn translate(&self, source_id: Option<&str>) -> Priority {
        match source_id {
            Some(id) if id == self.urgent => Priority::Urgent,
            Some(id) if id == self.high => Priority::High,
            Some(id) if id == self.medium => Priority::Medium,
            Some(id) if id == self.low => Priority::Low,
            _ => Priority::None,
        }
    }
}

/// Attachment transfer knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferSettings {
    #[serde(default = "default_workers")]
    pub workers: usize,
    #[serde(default = "default_attempts")]
    pub attempts: u32,
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
}

const fn default_workers() -> usize {
    DEFAULT_TRANSFER_WORKERS
}
const fn default_attempts() -> u32 {
    DEFAULT_TRANSFER_ATTEMPTS
}
const fn default_retry_delay_ms() -> u64 {
    DEFAULT_RETRY_DELAY_MS
}

impl Default for TransferSettings {
    fn default() -> Self {
        Self {
            workers: DEFAULT_TRANSFER_WORKERS,
            attempts: DEFAULT_TRANSFER_ATTEMPTS,
            retry_delay_ms: DEFAULT_RETRY_DELAY_MS,
        }
    }
}

impl TransferSettings {
    #[must_use]
    pub const fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }
}

/// Full import configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImportSettings {
    #[serde(default)]
    pub remote: RemoteSettings,
    #[serde(default)]
    pub priorities: PriorityMap,
    /// Source link-type ids whose links mean "blocks".
    #[serde(default)]
    pub blocks_link_types: Vec<String>,
    #[serde(default)]
    pub transfer: TransferSettings,
    #[serde(default = "default_import_avatars")]
    pub import_avatars: bool,
    #[serde(default = "default_page_size")]
    pub page_size: u64,
}

const fn default_import_avatars() -> bool {
    true
}
const fn default_page_size() -> u64 {
    DEFAULT_PAGE_SIZE
}

impl Default for ImportSettings {
    fn default() -> Self {
        Self {
            remote: RemoteSettings::default(),
            priorities: PriorityMap::default(),
            blocks_link_types: Vec::new(),
            transfer: TransferSettings::default(),
            import_avatars: default_import_avatars(),
            page_size: default_page_size(),
        }
    }
}

impl ImportSettings {
    /// Load settings from an optional YAML file, then apply environment
    /// overrides.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be read or parsed.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut settings = match path {
            Some(p) if p.exists() => {
                let contents = fs::read_to_string(p)?;
                serde_yaml::from_str(&contents)?
            }
            Some(p) => {
                return Err(GantryError::Config(format!(
                    "config file not found: {}",
                    p.display()
                )));
            }
            None => Self::default(),
        };
        settings.apply_env();
        Ok(settings)
    }

    fn apply_env(&mut self) {
        if let Ok(url) = env::var("GANTRY_REMOTE_URL") {
            if !url.trim().is_empty() {
                self.remote.base_url = url;
            }
        }
        if let Ok(user) = env::var("GANTRY_REMOTE_USER") {
            if !user.trim().is_empty() {
                self.remote.user = Some(user);
            }
        }
        if let Ok(token) = env::var("GANTRY_REMOTE_TOKEN") {
            if !token.trim().is_empty() {
                self.remote.token = Some(token);
            }
        }
    }

    /// Validate settings before starting an import.
    ///
    /// # Errors
    ///
    /// Returns a validation error naming the offending field.
    pub fn validate(&self) -> Result<()> {
        if self.remote.base_url.trim().is_empty() {
            return Err(GantryError::validation(
                "remote.base_url",
                "remote tracker URL is required",
            ));
        }
        if self.transfer.workers == 0 {
            return Err(GantryError::validation(
                "transfer.workers",
                "worker pool size must be at least 1",
            ));
        }
        if self.transfer.attempts == 0 {
            return Err(GantryError::validation(
                "transfer.attempts",
                "at least one download attempt is required",
            ));
        }
        if self.page_size == 0 {
            return Err(GantryError::validation(
                "page_size",
                "page size must be at least 1",
            ));
        }
        Ok(())
    }
}
