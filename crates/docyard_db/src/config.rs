//! Store configuration

use crate::error::{DbError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

const BYTES_IN_MB: u64 = 1_048_576;

/// Main configuration for a [`crate::DocumentDb`]
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StoreConfig {
    /// Path to the SQLite database file shared by all workers
    #[serde(default = "default_database_path")]
    pub database_path: PathBuf,

    /// Connections held by this process
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,

    /// How long a statement waits on another writer before failing
    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,

    #[serde(default)]
    pub archive: ArchiveConfig,

    #[serde(default)]
    pub files: FileConfig,
}

/// Capacity of the archive of completed documents
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ArchiveConfig {
    /// Total size of retained archive records, in megabytes
    #[serde(default = "default_archive_size_mb")]
    pub max_size_mb: u64,

    /// Number of retained archive records
    #[serde(default = "default_archive_documents")]
    pub max_documents: u64,

    /// Largest single record the archive accepts, in bytes
    #[serde(default = "default_max_record_bytes")]
    pub max_record_bytes: usize,

    /// Poll interval of archive followers while no new record exists
    #[serde(default = "default_follow_poll_interval_ms")]
    pub follow_poll_interval_ms: u64,
}

/// Attachment write settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FileConfig {
    /// Delay between read-after-write checks
    #[serde(default = "default_visibility_poll_interval_ms")]
    pub visibility_poll_interval_ms: u64,

    /// Total time a written attachment may take to become readable
    #[serde(default = "default_visibility_budget_ms")]
    pub visibility_budget_ms: u64,
}

fn default_database_path() -> PathBuf {
    PathBuf::from("docyard.sqlite3")
}

fn default_max_connections() -> u32 {
    4
}

fn default_busy_timeout_ms() -> u64 {
    5_000
}

fn default_archive_size_mb() -> u64 {
    64
}

fn default_archive_documents() -> u64 {
    10_000
}

fn default_max_record_bytes() -> usize {
    16 * BYTES_IN_MB as usize
}

fn default_follow_poll_interval_ms() -> u64 {
    250
}

fn default_visibility_poll_interval_ms() -> u64 {
    10
}

fn default_visibility_budget_ms() -> u64 {
    1_000
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            database_path: default_database_path(),
            max_connections: default_max_connections(),
            busy_timeout_ms: default_busy_timeout_ms(),
            archive: ArchiveConfig::default(),
            files: FileConfig::default(),
        }
    }
}

impl Default for ArchiveConfig {
    fn default() -> Self {
        Self {
            max_size_mb: default_archive_size_mb(),
            max_documents: default_archive_documents(),
            max_record_bytes: default_max_record_bytes(),
            follow_poll_interval_ms: default_follow_poll_interval_ms(),
        }
    }
}

impl Default for FileConfig {
    fn default() -> Self {
        Self {
            visibility_poll_interval_ms: default_visibility_poll_interval_ms(),
            visibility_budget_ms: default_visibility_budget_ms(),
        }
    }
}

impl StoreConfig {
    /// Default settings for the database at `path`.
    pub fn for_path(path: impl Into<PathBuf>) -> Self {
        Self {
            database_path: path.into(),
            ..Self::default()
        }
    }

    /// Load configuration from a TOML file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        toml::from_str(&content).map_err(|e| DbError::Config(e.to_string()))
    }

    /// Save configuration to a TOML file
    pub fn save(&self, path: &Path) -> Result<()> {
        let content =
            toml::to_string_pretty(self).map_err(|e| DbError::Config(e.to_string()))?;
        std::fs::write(path, content)?;
        Ok(())
    }

    pub fn busy_timeout(&self) -> Duration {
        Duration::from_millis(self.busy_timeout_ms)
    }
}

impl ArchiveConfig {
    pub fn max_bytes(&self) -> u64 {
        self.max_size_mb.saturating_mul(BYTES_IN_MB)
    }

    pub fn follow_poll_interval(&self) -> Duration {
        Duration::from_millis(self.follow_poll_interval_ms)
    }
}

impl FileConfig {
    pub fn visibility_poll_interval(&self) -> Duration {
        Duration::from_millis(self.visibility_poll_interval_ms)
    }

    pub fn visibility_budget(&self) -> Duration {
        Duration::from_millis(self.visibility_budget_ms)
    }
}
