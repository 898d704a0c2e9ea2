//! Error types for tracksync

use thiserror::Error;

use crate::types::{Side, SyncStage};

/// Result type alias for tracksync operations
pub type Result<T> = std::result::Result<T, SyncError>;

/// Main error type for tracksync
#[derive(Error, Debug)]
pub enum SyncError {
    #[error("Missing tables: the setup does not declare any table to synchronize")]
    MissingTables,

    #[error("Table {0} does not exist in the database")]
    MissingTable(String),

    #[error("Table {0} has no columns")]
    MissingColumns(String),

    #[error("Column {column} of table {table} does not exist in the database")]
    MissingColumn { table: String, column: String },

    #[error("Table {0} has no primary key")]
    MissingPrimaryKey(String),

    #[error("Invalid provision for a {side} orchestrator: {detail}")]
    InvalidProvision { side: Side, detail: String },

    #[error("Invalid scope version '{0}'")]
    InvalidVersion(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error(
        "Scope is out of date: last server timestamp {client_timestamp} is older than the last metadata cleanup {cleanup_timestamp}"
    )]
    OutOfDate {
        client_timestamp: i64,
        cleanup_timestamp: i64,
    },

    #[error("A row of table {table} serializes to {size} bytes, more than the batch size of {max} bytes")]
    RowTooLarge {
        table: String,
        size: usize,
        max: usize,
    },

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Provider error: {0}")]
    Provider(String),

    #[error("Batch error: {0}")]
    Batch(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Config file error: {0}")]
    ConfigFile(#[from] toml::de::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Sync failed while {stage} on the {side} side: {source}")]
    Stage {
        stage: SyncStage,
        side: Side,
        #[source]
        source: Box<SyncError>,
    },

    #[error("Internal error: {0}")]
    Internal(String),
}

impl SyncError {
    /// Wrap an error with the stage and side it happened on.
    ///
    /// Errors that already carry a stage are returned untouched so nested
    /// orchestrator calls report the innermost stage.
    pub fn at_stage(self, stage: SyncStage, side: Side) -> Self {
        match self {
            SyncError::Stage { .. } => self,
            other => SyncError::Stage {
                stage,
                side,
                source: Box::new(other),
            },
        }
    }

    /// The error without its stage wrapper
    pub fn root(&self) -> &SyncError {
        match self {
            SyncError::Stage { source, .. } => source.root(),
            other => other,
        }
    }

    /// Stage the error was raised at, if it went through an orchestrator
    pub fn stage(&self) -> Option<SyncStage> {
        match self {
            SyncError::Stage { stage, .. } => Some(*stage),
            _ => None,
        }
    }

    /// Check if error is retryable
    pub fn is_retryable(&self) -> bool {
        matches!(self.root(), SyncError::Connection(_) | SyncError::Io(_))
    }

    /// Configuration errors are raised before any I/O and never retried
    pub fn is_configuration(&self) -> bool {
        matches!(
            self.root(),
            SyncError::MissingTables
                | SyncError::MissingTable(_)
                | SyncError::MissingColumns(_)
                | SyncError::MissingColumn { .. }
                | SyncError::MissingPrimaryKey(_)
                | SyncError::InvalidProvision { .. }
                | SyncError::InvalidVersion(_)
                | SyncError::Config(_)
                | SyncError::ConfigFile(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_messages() {
        let err = SyncError::MissingPrimaryKey("Customer".to_string());
        assert_eq!(err.to_string(), "Table Customer has no primary key");

        let err = SyncError::RowTooLarge {
            table: "Customer".to_string(),
            size: 2048,
            max: 1024,
        };
        assert_eq!(
            err.to_string(),
            "A row of table Customer serializes to 2048 bytes, more than the batch size of 1024 bytes"
        );

        let err = SyncError::OutOfDate {
            client_timestamp: 10,
            cleanup_timestamp: 20,
        };
        assert!(err.to_string().contains("10"));
        assert!(err.to_string().contains("20"));
    }

    #[test]
    fn test_stage_wrapping_keeps_innermost_stage() {
        let err = SyncError::MissingColumns("Product".to_string())
            .at_stage(SyncStage::Provisioning, Side::Client)
            .at_stage(SyncStage::ChangesSelecting, Side::Server);

        assert_eq!(err.stage(), Some(SyncStage::Provisioning));
        assert!(matches!(err.root(), SyncError::MissingColumns(_)));
        assert!(err.is_configuration());
        assert!(err
            .to_string()
            .starts_with("Sync failed while provisioning on the client side"));
    }

    #[test]
    fn test_retryable() {
        assert!(SyncError::Connection("reset".to_string()).is_retryable());
        assert!(SyncError::Connection("reset".to_string())
            .at_stage(SyncStage::ScopeLoading, Side::Client)
            .is_retryable());
        assert!(!SyncError::Cancelled.is_retryable());
        assert!(!SyncError::MissingTables.is_retryable());
    }
}
