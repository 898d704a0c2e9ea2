//! Batches of changed rows written to disk
//!
//! A batch is a directory holding one file per part and a `summary.json`
//! describing them. Every part holds rows of exactly one table and stays
//! under the configured batch size.

mod serializer;
mod snapshot;

pub use serializer::{BatchPartContent, BatchPartWriter, JsonSerializerFactory, SerializerFactory};
pub use snapshot::{parameters_directory_name, scope_directory_name, snapshot_directory};

use std::path::{Path, PathBuf};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Result, SyncError};
use crate::schema::TableRef;

/// File name of a batch summary
pub const SUMMARY_FILE_NAME: &str = "summary.json";

/// Rows of one table inside a part
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchPartTableInfo {
    pub table_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schema_name: Option<String>,
    pub rows_count: u64,
}

/// One part file of a batch
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchPartInfo {
    pub index: usize,
    pub file_name: String,
    pub tables: Vec<BatchPartTableInfo>,
    pub rows_count: u64,
    pub is_last_batch: bool,
}

impl BatchPartInfo {
    pub fn new(file_name: impl Into<String>, table: &TableRef, rows_count: u64) -> Self {
        Self {
            index: 0,
            file_name: file_name.into(),
            tables: vec![BatchPartTableInfo {
                table_name: table.table_name.clone(),
                schema_name: table.schema_name.clone(),
                rows_count,
            }],
            rows_count,
            is_last_batch: false,
        }
    }

    pub fn holds(&self, table: &TableRef) -> bool {
        self.tables
            .iter()
            .any(|t| table.matches(&t.table_name, t.schema_name.as_deref()))
    }
}

/// Result of one change selection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchInfo {
    /// Clock of the selecting database when the selection started
    pub timestamp: i64,
    pub rows_count: u64,
    pub parts: Vec<BatchPartInfo>,
    pub directory_root: PathBuf,
    pub directory_name: String,
    pub serializer: String,
    /// Snapshots are shared across sessions and never cleaned up after apply
    #[serde(default)]
    pub is_snapshot: bool,
}

impl BatchInfo {
    /// New batch in a fresh `<yyyy_mm_dd_HHMMSS>_<uuid>` directory under `root`
    pub fn new(root: impl Into<PathBuf>, serializer: impl Into<String>) -> Self {
        let directory_name = format!(
            "{}_{}",
            Utc::now().format("%Y_%m_%d_%H%M%S"),
            Uuid::new_v4().simple()
        );
        Self::at(root, directory_name, serializer)
    }

    /// New batch in a given directory
    pub fn at(root: impl Into<PathBuf>, directory_name: impl Into<String>, serializer: impl Into<String>) -> Self {
        Self {
            timestamp: 0,
            rows_count: 0,
            parts: Vec::new(),
            directory_root: root.into(),
            directory_name: directory_name.into(),
            serializer: serializer.into(),
            is_snapshot: false,
        }
    }

    pub fn directory_path(&self) -> PathBuf {
        self.directory_root.join(&self.directory_name)
    }

    pub fn part_path(&self, part: &BatchPartInfo) -> PathBuf {
        self.directory_path().join(&part.file_name)
    }

    pub fn summary_path(&self) -> PathBuf {
        self.directory_path().join(SUMMARY_FILE_NAME)
    }

    pub fn has_data(&self) -> bool {
        self.rows_count > 0
    }

    /// Parts holding rows of a table, in index order
    pub fn parts_for<'a>(&'a self, table: &'a TableRef) -> impl Iterator<Item = &'a BatchPartInfo> + 'a {
        self.parts.iter().filter(move |p| p.holds(table))
    }

    /// Drop empty parts, renumber the rest contiguously and flag the last one
    pub fn renumber(&mut self) {
        self.parts.retain(|p| p.rows_count > 0);
        let count = self.parts.len();
        for (index, part) in self.parts.iter_mut().enumerate() {
            part.index = index;
            part.is_last_batch = index + 1 == count;
        }
        self.rows_count = self.parts.iter().map(|p| p.rows_count).sum();
    }

    pub async fn save_summary(&self) -> Result<()> {
        tokio::fs::create_dir_all(self.directory_path()).await?;
        let json = serde_json::to_vec_pretty(self)?;
        tokio::fs::write(self.summary_path(), json).await?;
        Ok(())
    }

    /// Load a batch from its directory
    pub async fn load(directory: impl AsRef<Path>) -> Result<Self> {
        let directory = directory.as_ref();
        let summary = directory.join(SUMMARY_FILE_NAME);
        let content = tokio::fs::read(&summary).await.map_err(|e| {
            SyncError::Batch(format!("cannot read {}: {}", summary.display(), e))
        })?;
        let mut batch: BatchInfo = serde_json::from_slice(&content)?;

        // The directory may have moved since the summary was written
        if let (Some(root), Some(name)) = (directory.parent(), directory.file_name()) {
            batch.directory_root = root.to_path_buf();
            batch.directory_name = name.to_string_lossy().to_string();
        }
        Ok(batch)
    }

    /// Delete the batch directory, ignoring a missing one
    pub async fn remove_directory(&self) -> Result<()> {
        match tokio::fs::remove_dir_all(self.directory_path()).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
