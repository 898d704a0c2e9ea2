//! Provider capability traits
//!
//! A provider adapts one database engine to the synchronization core. The
//! core never generates SQL: it decides which artifacts to create or drop and
//! in which order, and delegates the DDL and the row commands to the
//! builders and adapters handed out here.

pub mod memory;

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::changes::{RowState, SyncRow, TableChangesApplied};
use crate::error::{Result, SyncError};
use crate::schema::{SyncColumn, SyncRelation, SyncSetup, SyncTable};
use crate::scope::{ClientScopeInfo, ServerHistoryScopeInfo, ServerScopeInfo};
use crate::types::{ConflictResolutionPolicy, ScopeType, Side, SyncParameters};

/// Transaction isolation requested when an orchestrator begins a transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IsolationLevel {
    #[default]
    ReadCommitted,
    RepeatableRead,
    Serializable,
    Snapshot,
}

/// Database connection handle
///
/// Methods take `&self` so one handle can be shared by the concurrent table
/// scans of a change selection.
#[async_trait]
pub trait DbConnection: Send + Sync {
    async fn open(&self) -> Result<()>;

    fn is_open(&self) -> bool;

    async fn begin(&self, isolation: IsolationLevel) -> Result<()>;

    fn in_transaction(&self) -> bool;

    async fn commit(&self) -> Result<()>;

    async fn rollback(&self) -> Result<()>;

    async fn close(&self) -> Result<()>;
}

/// Trigger maintaining a tracking table
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerKind {
    Insert,
    Update,
    Delete,
}

impl TriggerKind {
    pub const ALL: [TriggerKind; 3] = [TriggerKind::Insert, TriggerKind::Update, TriggerKind::Delete];
}

impl fmt::Display for TriggerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TriggerKind::Insert => "insert",
            TriggerKind::Update => "update",
            TriggerKind::Delete => "delete",
        };
        f.write_str(s)
    }
}

/// Stored procedure (or prepared command) generated per table
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcedureKind {
    SelectChanges,
    SelectChangesWithFilters,
    SelectInitializedChanges,
    SelectInitializedChangesWithFilters,
    SelectRow,
    UpdateRow,
    DeleteRow,
    DeleteMetadata,
    Reset,
    BulkTableType,
    BulkUpdateRows,
    BulkDeleteRows,
}

impl ProcedureKind {
    pub const ALL: [ProcedureKind; 12] = [
        ProcedureKind::SelectChanges,
        ProcedureKind::SelectChangesWithFilters,
        ProcedureKind::SelectInitializedChanges,
        ProcedureKind::SelectInitializedChangesWithFilters,
        ProcedureKind::SelectRow,
        ProcedureKind::UpdateRow,
        ProcedureKind::DeleteRow,
        ProcedureKind::DeleteMetadata,
        ProcedureKind::Reset,
        ProcedureKind::BulkTableType,
        ProcedureKind::BulkUpdateRows,
        ProcedureKind::BulkDeleteRows,
    ];

    pub fn is_filtered(&self) -> bool {
        matches!(
            self,
            ProcedureKind::SelectChangesWithFilters | ProcedureKind::SelectInitializedChangesWithFilters
        )
    }

    pub fn is_bulk(&self) -> bool {
        matches!(
            self,
            ProcedureKind::BulkTableType | ProcedureKind::BulkUpdateRows | ProcedureKind::BulkDeleteRows
        )
    }

    /// Procedures a table needs given its filter and the provider's bulk support
    pub fn required(has_filter: bool, bulk_operations: bool) -> Vec<ProcedureKind> {
        Self::ALL
            .into_iter()
            .filter(|kind| has_filter || !kind.is_filtered())
            .filter(|kind| bulk_operations || !kind.is_bulk())
            .collect()
    }
}

impl fmt::Display for ProcedureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ProcedureKind::SelectChanges => "changes",
            ProcedureKind::SelectChangesWithFilters => "changes_filtered",
            ProcedureKind::SelectInitializedChanges => "initialize",
            ProcedureKind::SelectInitializedChangesWithFilters => "initialize_filtered",
            ProcedureKind::SelectRow => "select_row",
            ProcedureKind::UpdateRow => "update",
            ProcedureKind::DeleteRow => "delete",
            ProcedureKind::DeleteMetadata => "delete_metadata",
            ProcedureKind::Reset => "reset",
            ProcedureKind::BulkTableType => "bulk_type",
            ProcedureKind::BulkUpdateRows => "bulk_update",
            ProcedureKind::BulkDeleteRows => "bulk_delete",
        };
        f.write_str(s)
    }
}

/// A database object the provisioning engine manages
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DbArtifact {
    SchemaName,
    Table,
    TrackingTable,
    Trigger(TriggerKind),
    StoredProcedure(ProcedureKind),
}

impl fmt::Display for DbArtifact {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DbArtifact::SchemaName => write!(f, "schema"),
            DbArtifact::Table => write!(f, "table"),
            DbArtifact::TrackingTable => write!(f, "tracking table"),
            DbArtifact::Trigger(kind) => write!(f, "{} trigger", kind),
            DbArtifact::StoredProcedure(kind) => write!(f, "{} procedure", kind),
        }
    }
}

/// Reads the database schema
#[async_trait]
pub trait DatabaseBuilder: Send + Sync {
    /// Make sure the database itself is reachable and usable
    async fn ensure_database(&self, conn: &dyn DbConnection) -> Result<()>;

    /// Columns and primary key of a table, `None` when it does not exist
    async fn get_table(
        &self,
        conn: &dyn DbConnection,
        table_name: &str,
        schema_name: Option<&str>,
    ) -> Result<Option<SyncTable>>;

    /// Foreign keys declared on a table
    async fn get_relations(
        &self,
        conn: &dyn DbConnection,
        table_name: &str,
        schema_name: Option<&str>,
    ) -> Result<Vec<SyncRelation>>;
}

/// Creates and drops the artifacts of one table
#[async_trait]
pub trait TableBuilder: Send + Sync {
    /// Tracking table name under the builder's setup naming convention
    fn tracking_table_name(&self) -> String;

    async fn exists_artifact(&self, conn: &dyn DbConnection, artifact: DbArtifact) -> Result<bool>;

    async fn create_artifact(&self, conn: &dyn DbConnection, artifact: DbArtifact) -> Result<()>;

    async fn drop_artifact(&self, conn: &dyn DbConnection, artifact: DbArtifact) -> Result<()>;

    async fn exists_column(&self, conn: &dyn DbConnection, column_name: &str) -> Result<bool>;

    async fn add_column(&self, conn: &dyn DbConnection, column: &SyncColumn) -> Result<()>;

    /// Rename the tracking table from `old_name`, keeping its rows
    async fn rename_tracking_table(&self, conn: &dyn DbConnection, old_name: &str) -> Result<()>;
}

/// Scope tables and the database clock
#[async_trait]
pub trait ScopeBuilder: Send + Sync {
    async fn exists_scope_table(&self, conn: &dyn DbConnection, scope_type: ScopeType) -> Result<bool>;

    async fn create_scope_table(&self, conn: &dyn DbConnection, scope_type: ScopeType) -> Result<()>;

    async fn drop_scope_table(&self, conn: &dyn DbConnection, scope_type: ScopeType) -> Result<()>;

    /// Current value of the database's change tracking clock
    async fn get_local_timestamp(&self, conn: &dyn DbConnection) -> Result<i64>;

    async fn load_client_scope(&self, conn: &dyn DbConnection, name: &str) -> Result<Option<ClientScopeInfo>>;

    async fn save_client_scope(&self, conn: &dyn DbConnection, scope: &ClientScopeInfo) -> Result<()>;

    async fn delete_client_scope(&self, conn: &dyn DbConnection, name: &str) -> Result<()>;

    async fn load_server_scope(&self, conn: &dyn DbConnection, name: &str) -> Result<Option<ServerScopeInfo>>;

    async fn save_server_scope(&self, conn: &dyn DbConnection, scope: &ServerScopeInfo) -> Result<()>;

    async fn delete_server_scope(&self, conn: &dyn DbConnection, name: &str) -> Result<()>;

    /// Every history row recorded for a scope name
    async fn load_server_history(
        &self,
        conn: &dyn DbConnection,
        name: &str,
    ) -> Result<Vec<ServerHistoryScopeInfo>>;

    async fn save_server_history(&self, conn: &dyn DbConnection, scope: &ServerHistoryScopeInfo) -> Result<()>;

    async fn delete_server_history(&self, conn: &dyn DbConnection, name: &str) -> Result<()>;
}

/// The four change selection commands, keyed by `(is_new, has_filter)`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SelectChangesKind {
    Changes,
    ChangesWithFilters,
    InitializedChanges,
    InitializedChangesWithFilters,
}

impl SelectChangesKind {
    pub fn for_scope(is_new: bool, has_filter: bool) -> Self {
        match (is_new, has_filter) {
            (false, false) => SelectChangesKind::Changes,
            (false, true) => SelectChangesKind::ChangesWithFilters,
            (true, false) => SelectChangesKind::InitializedChanges,
            (true, true) => SelectChangesKind::InitializedChangesWithFilters,
        }
    }

    pub fn is_initialization(&self) -> bool {
        matches!(
            self,
            SelectChangesKind::InitializedChanges | SelectChangesKind::InitializedChangesWithFilters
        )
    }

    pub fn is_filtered(&self) -> bool {
        matches!(
            self,
            SelectChangesKind::ChangesWithFilters | SelectChangesKind::InitializedChangesWithFilters
        )
    }

    /// Procedure backing the command
    pub fn procedure(&self) -> ProcedureKind {
        match self {
            SelectChangesKind::Changes => ProcedureKind::SelectChanges,
            SelectChangesKind::ChangesWithFilters => ProcedureKind::SelectChangesWithFilters,
            SelectChangesKind::InitializedChanges => ProcedureKind::SelectInitializedChanges,
            SelectChangesKind::InitializedChangesWithFilters => {
                ProcedureKind::SelectInitializedChangesWithFilters
            }
        }
    }
}

/// Parameters of a change selection command
#[derive(Debug, Clone)]
pub struct SelectChangesQuery {
    pub kind: SelectChangesKind,
    /// Rows changed strictly after this timestamp, every row when `None`
    pub last_timestamp: Option<i64>,
    /// Rows last written on behalf of this scope are not selected
    pub scope_id: Uuid,
    pub parameters: SyncParameters,
}

/// Context of a change application
#[derive(Debug, Clone)]
pub struct ApplyContext {
    /// Side the rows are applied on
    pub side: Side,
    pub policy: ConflictResolutionPolicy,
    /// Scope the rows come from, recorded on every applied row
    pub scope_id: Uuid,
    /// Local rows changed after this timestamp by another scope are conflicts
    pub last_timestamp: Option<i64>,
    pub is_new_scope: bool,
}

/// Streaming reader over a change selection result
///
/// Each record maps column names to values and carries the tombstone marker
/// column.
#[async_trait]
pub trait RowReader: Send {
    async fn read(&mut self) -> Result<Option<serde_json::Map<String, serde_json::Value>>>;
}

/// Row level commands of one table
#[async_trait]
pub trait SyncAdapter: Send + Sync {
    async fn select_changes(
        &self,
        conn: &dyn DbConnection,
        query: &SelectChangesQuery,
    ) -> Result<Box<dyn RowReader>>;

    /// Apply rows of one state, resolving conflicts with the context's policy
    async fn apply_changes(
        &self,
        conn: &dyn DbConnection,
        state: RowState,
        rows: &[SyncRow],
        ctx: &ApplyContext,
    ) -> Result<TableChangesApplied>;

    /// Purge tracking metadata of deleted rows up to `timestamp`, returning the purged count
    async fn delete_metadata(&self, conn: &dyn DbConnection, timestamp: i64) -> Result<u64>;

    /// Remove every row and its tracking metadata
    async fn reset_table(&self, conn: &dyn DbConnection) -> Result<()>;
}

/// A database engine adapted to the synchronization core
pub trait Provider: Send + Sync {
    fn provider_type(&self) -> &str;

    /// New, closed connection
    fn create_connection(&self) -> Arc<dyn DbConnection>;

    fn database_builder(&self) -> Arc<dyn DatabaseBuilder>;

    fn table_builder(&self, table: &SyncTable, setup: &SyncSetup) -> Arc<dyn TableBuilder>;

    fn scope_builder(&self, scope_info_table_name: &str) -> Arc<dyn ScopeBuilder>;

    fn sync_adapter(&self, table: &SyncTable, setup: &SyncSetup) -> Arc<dyn SyncAdapter>;

    /// Whether opening a connection should be retried after this error
    fn should_retry_on(&self, error: &SyncError) -> bool {
        error.is_retryable()
    }

    fn isolation_level(&self) -> IsolationLevel {
        IsolationLevel::default()
    }

    /// Whether one connection can stream several result sets at once
    fn supports_multiple_active_result_sets(&self) -> bool {
        false
    }

    fn supports_bulk_operations(&self) -> bool {
        false
    }

    fn can_be_server_provider(&self) -> bool {
        true
    }
}
