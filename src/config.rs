//! Orchestrator configuration
//!
//! `SyncOptions` can be built in code, or loaded from a TOML file where every
//! field is optional:
//!
//! ```toml
//! batch_directory = "~/.cache/tracksync/batches"
//! batch_size = 2000
//! conflict_resolution_policy = "client_wins"
//! ```

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{Result, SyncError};
use crate::types::ConflictResolutionPolicy;

/// Default batch size in KB
pub const DEFAULT_BATCH_SIZE_KB: usize = 5000;

/// Upper bound of concurrently scanned tables
pub const MAX_PARALLEL_TABLES: usize = 16;

/// Options shared by local and remote orchestrators
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncOptions {
    /// Root directory where batch directories are written
    #[serde(default = "default_batch_directory")]
    pub batch_directory: PathBuf,
    /// Root directory of pre-computed snapshots (server side)
    #[serde(default)]
    pub snapshots_directory: Option<PathBuf>,
    /// Maximum size of one batch part file, in KB
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Maximum number of tables scanned concurrently when the provider
    /// supports multiple active result sets
    #[serde(default = "default_max_parallel_tables")]
    pub max_parallel_tables: usize,
    /// Conflict resolution policy used when applying changes
    #[serde(default)]
    pub conflict_resolution_policy: ConflictResolutionPolicy,
    /// Name of the scope info table
    #[serde(default = "default_scope_info_table_name")]
    pub scope_info_table_name: String,
    /// Delete a batch directory once its changes are applied
    #[serde(default = "default_true")]
    pub clean_folder: bool,
    /// Retries when opening a connection fails with a transient error
    #[serde(default = "default_retry_count")]
    pub connection_retry_count: u32,
    /// Base delay between connection retries, multiplied by the attempt number
    #[serde(default = "default_retry_delay_ms")]
    pub connection_retry_delay_ms: u64,
    /// Serializer used for batch part files
    #[serde(default = "default_serializer")]
    pub serializer: String,
}

fn default_batch_directory() -> PathBuf {
    std::env::temp_dir().join("tracksync")
}

fn default_batch_size() -> usize {
    DEFAULT_BATCH_SIZE_KB
}

fn default_max_parallel_tables() -> usize {
    MAX_PARALLEL_TABLES
}

fn default_scope_info_table_name() -> String {
    "scope_info".to_string()
}

fn default_true() -> bool {
    true
}

fn default_retry_count() -> u32 {
    3
}

fn default_retry_delay_ms() -> u64 {
    500
}

fn default_serializer() -> String {
    "json".to_string()
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self {
            batch_directory: default_batch_directory(),
            snapshots_directory: None,
            batch_size: default_batch_size(),
            max_parallel_tables: default_max_parallel_tables(),
            conflict_resolution_policy: ConflictResolutionPolicy::default(),
            scope_info_table_name: default_scope_info_table_name(),
            clean_folder: true,
            connection_retry_count: default_retry_count(),
            connection_retry_delay_ms: default_retry_delay_ms(),
            serializer: default_serializer(),
        }
    }
}

impl SyncOptions {
    /// Parse options from a TOML document
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let mut options: SyncOptions = toml::from_str(content)?;
        options.expand_paths();
        options.validate()?;
        Ok(options)
    }

    /// Load options from a TOML file
    pub fn from_toml_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = shellexpand::tilde(&path.as_ref().to_string_lossy()).to_string();
        let content = std::fs::read_to_string(&path)?;
        Self::from_toml_str(&content)
    }

    /// Set the batch directory
    pub fn with_batch_directory(mut self, dir: impl Into<PathBuf>) -> Self {
        self.batch_directory = dir.into();
        self
    }

    /// Set the snapshots directory
    pub fn with_snapshots_directory(mut self, dir: impl Into<PathBuf>) -> Self {
        self.snapshots_directory = Some(dir.into());
        self
    }

    /// Set the batch size, in KB
    pub fn with_batch_size(mut self, kb: usize) -> Self {
        self.batch_size = kb;
        self
    }

    /// Set the conflict resolution policy
    pub fn with_conflict_resolution_policy(mut self, policy: ConflictResolutionPolicy) -> Self {
        self.conflict_resolution_policy = policy;
        self
    }

    /// Set the base delay between connection retries
    pub fn with_connection_retry_delay_ms(mut self, delay_ms: u64) -> Self {
        self.connection_retry_delay_ms = delay_ms;
        self
    }

    /// Batch size threshold in bytes
    pub fn batch_size_bytes(&self) -> usize {
        self.batch_size.saturating_mul(1024)
    }

    /// Check the options are usable
    pub fn validate(&self) -> Result<()> {
        if self.batch_size == 0 {
            return Err(SyncError::Config(
                "batch_size must be greater than zero".to_string(),
            ));
        }
        if self.max_parallel_tables == 0 {
            return Err(SyncError::Config(
                "max_parallel_tables must be greater than zero".to_string(),
            ));
        }
        if self.scope_info_table_name.trim().is_empty() {
            return Err(SyncError::Config(
                "scope_info_table_name must not be empty".to_string(),
            ));
        }
        if self.serializer.trim().is_empty() {
            return Err(SyncError::Config("serializer must not be empty".to_string()));
        }
        Ok(())
    }

    fn expand_paths(&mut self) {
        self.batch_directory = expand(&self.batch_directory);
        if let Some(dir) = self.snapshots_directory.take() {
            self.snapshots_directory = Some(expand(&dir));
        }
    }
}

fn expand(path: &Path) -> PathBuf {
    PathBuf::from(shellexpand::tilde(&path.to_string_lossy()).to_string())
}
