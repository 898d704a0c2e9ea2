//! Typed interception of orchestrator events
//!
//! Handlers are registered per [`EventKind`] once, when the orchestrator is
//! built, and run synchronously in registration order. They receive the
//! event mutably so they can override decisions such as the action taken on
//! an outdated scope.

use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::changes::{DatabaseChangesApplied, DatabaseChangesSelected, TableChangesApplied, TableChangesSelected};
use crate::provider::{DbArtifact, ProcedureKind, SelectChangesKind, TriggerKind};
use crate::provision::SyncProvision;
use crate::schema::SyncTable;
use crate::scope::OutdatedAction;
use crate::types::{ScopeType, Side, SyncStage};
use crate::upgrade::SyncVersion;

/// Something that happened inside an orchestrator
#[derive(Debug, Clone)]
pub enum SyncEvent {
    ConnectionOpened,
    ConnectionClosed,
    Reconnecting { attempt: u32, delay_ms: u64, error: String },
    TransactionOpened,
    TransactionCommitted,
    SessionBegin { scope_name: String },
    SessionEnd { scope_name: String },
    ScopeLoaded { scope_name: String, scope_type: ScopeType, is_new: bool },
    ScopeSaved { scope_name: String, scope_type: ScopeType },
    ScopeTableCreated { scope_type: ScopeType },
    ScopeTableDropped { scope_type: ScopeType },
    SchemaLoaded { tables: usize },
    SchemaNameCreated { schema_name: String },
    SchemaNameDropped { schema_name: String },
    TableCreated { table: String },
    TableDropped { table: String },
    ColumnAdded { table: String, column: String },
    TrackingTableCreated { table: String, tracking_table: String },
    TrackingTableDropped { table: String, tracking_table: String },
    TrackingTableRenamed { table: String, old_name: String, new_name: String },
    TriggerCreated { table: String, kind: TriggerKind },
    TriggerDropped { table: String, kind: TriggerKind },
    StoredProcedureCreated { table: String, kind: ProcedureKind },
    StoredProcedureDropped { table: String, kind: ProcedureKind },
    Provisioned { provision: SyncProvision },
    Deprovisioned { provision: SyncProvision },
    Migrated { tables: usize },
    TableChangesSelecting { table: String, kind: SelectChangesKind },
    TableChangesSelected { changes: TableChangesSelected },
    DatabaseChangesSelected { changes: DatabaseChangesSelected, parts: usize },
    TableChangesApplied { changes: TableChangesApplied },
    DatabaseChangesApplied { changes: DatabaseChangesApplied },
    MetadataCleaned { timestamp: i64, rows_cleaned: u64 },
    SnapshotCreated { directory: PathBuf, rows: u64 },
    SnapshotApplied { rows: u64 },
    UpgradeStep { from: SyncVersion, to: SyncVersion },
    Upgraded { from: SyncVersion, to: SyncVersion },
    /// Handlers may replace `action`
    OutdatedScope {
        client_timestamp: Option<i64>,
        cleanup_timestamp: i64,
        action: OutdatedAction,
    },
    Error { stage: SyncStage, message: String },
}

/// Discriminant of [`SyncEvent`] used to register handlers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    ConnectionOpened,
    ConnectionClosed,
    Reconnecting,
    TransactionOpened,
    TransactionCommitted,
    SessionBegin,
    SessionEnd,
    ScopeLoaded,
    ScopeSaved,
    ScopeTableCreated,
    ScopeTableDropped,
    SchemaLoaded,
    SchemaNameCreated,
    SchemaNameDropped,
    TableCreated,
    TableDropped,
    ColumnAdded,
    TrackingTableCreated,
    TrackingTableDropped,
    TrackingTableRenamed,
    TriggerCreated,
    TriggerDropped,
    StoredProcedureCreated,
    StoredProcedureDropped,
    Provisioned,
    Deprovisioned,
    Migrated,
    TableChangesSelecting,
    TableChangesSelected,
    DatabaseChangesSelected,
    TableChangesApplied,
    DatabaseChangesApplied,
    MetadataCleaned,
    SnapshotCreated,
    SnapshotApplied,
    UpgradeStep,
    Upgraded,
    OutdatedScope,
    Error,
}

impl SyncEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            SyncEvent::ConnectionOpened => EventKind::ConnectionOpened,
            SyncEvent::ConnectionClosed => EventKind::ConnectionClosed,
            SyncEvent::Reconnecting { .. } => EventKind::Reconnecting,
            SyncEvent::TransactionOpened => EventKind::TransactionOpened,
            SyncEvent::TransactionCommitted => EventKind::TransactionCommitted,
            SyncEvent::SessionBegin { .. } => EventKind::SessionBegin,
            SyncEvent::SessionEnd { .. } => EventKind::SessionEnd,
            SyncEvent::ScopeLoaded { .. } => EventKind::ScopeLoaded,
            SyncEvent::ScopeSaved { .. } => EventKind::ScopeSaved,
            SyncEvent::ScopeTableCreated { .. } => EventKind::ScopeTableCreated,
            SyncEvent::ScopeTableDropped { .. } => EventKind::ScopeTableDropped,
            SyncEvent::SchemaLoaded { .. } => EventKind::SchemaLoaded,
            SyncEvent::SchemaNameCreated { .. } => EventKind::SchemaNameCreated,
            SyncEvent::SchemaNameDropped { .. } => EventKind::SchemaNameDropped,
            SyncEvent::TableCreated { .. } => EventKind::TableCreated,
            SyncEvent::TableDropped { .. } => EventKind::TableDropped,
            SyncEvent::ColumnAdded { .. } => EventKind::ColumnAdded,
            SyncEvent::TrackingTableCreated { .. } => EventKind::TrackingTableCreated,
            SyncEvent::TrackingTableDropped { .. } => EventKind::TrackingTableDropped,
            SyncEvent::TrackingTableRenamed { .. } => EventKind::TrackingTableRenamed,
            SyncEvent::TriggerCreated { .. } => EventKind::TriggerCreated,
            SyncEvent::TriggerDropped { .. } => EventKind::TriggerDropped,
            SyncEvent::StoredProcedureCreated { .. } => EventKind::StoredProcedureCreated,
            SyncEvent::StoredProcedureDropped { .. } => EventKind::StoredProcedureDropped,
            SyncEvent::Provisioned { .. } => EventKind::Provisioned,
            SyncEvent::Deprovisioned { .. } => EventKind::Deprovisioned,
            SyncEvent::Migrated { .. } => EventKind::Migrated,
            SyncEvent::TableChangesSelecting { .. } => EventKind::TableChangesSelecting,
            SyncEvent::TableChangesSelected { .. } => EventKind::TableChangesSelected,
            SyncEvent::DatabaseChangesSelected { .. } => EventKind::DatabaseChangesSelected,
            SyncEvent::TableChangesApplied { .. } => EventKind::TableChangesApplied,
            SyncEvent::DatabaseChangesApplied { .. } => EventKind::DatabaseChangesApplied,
            SyncEvent::MetadataCleaned { .. } => EventKind::MetadataCleaned,
            SyncEvent::SnapshotCreated { .. } => EventKind::SnapshotCreated,
            SyncEvent::SnapshotApplied { .. } => EventKind::SnapshotApplied,
            SyncEvent::UpgradeStep { .. } => EventKind::UpgradeStep,
            SyncEvent::Upgraded { .. } => EventKind::Upgraded,
            SyncEvent::OutdatedScope { .. } => EventKind::OutdatedScope,
            SyncEvent::Error { .. } => EventKind::Error,
        }
    }

    /// Event reporting the creation of a table artifact
    pub(crate) fn artifact_created(table: &SyncTable, artifact: DbArtifact, tracking_table: String) -> Self {
        let name = table.full_name();
        match artifact {
            DbArtifact::SchemaName => SyncEvent::SchemaNameCreated {
                schema_name: table.schema_name.clone().unwrap_or_default(),
            },
            DbArtifact::Table => SyncEvent::TableCreated { table: name },
            DbArtifact::TrackingTable => SyncEvent::TrackingTableCreated {
                table: name,
                tracking_table,
            },
            DbArtifact::Trigger(kind) => SyncEvent::TriggerCreated { table: name, kind },
            DbArtifact::StoredProcedure(kind) => SyncEvent::StoredProcedureCreated { table: name, kind },
        }
    }

    /// Event reporting the removal of a table artifact
    pub(crate) fn artifact_dropped(table: &SyncTable, artifact: DbArtifact, tracking_table: String) -> Self {
        let name = table.full_name();
        match artifact {
            DbArtifact::SchemaName => SyncEvent::SchemaNameDropped {
                schema_name: table.schema_name.clone().unwrap_or_default(),
            },
            DbArtifact::Table => SyncEvent::TableDropped { table: name },
            DbArtifact::TrackingTable => SyncEvent::TrackingTableDropped {
                table: name,
                tracking_table,
            },
            DbArtifact::Trigger(kind) => SyncEvent::TriggerDropped { table: name, kind },
            DbArtifact::StoredProcedure(kind) => SyncEvent::StoredProcedureDropped { table: name, kind },
        }
    }
}

impl fmt::Display for SyncEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SyncEvent::ConnectionOpened => write!(f, "connection opened"),
            SyncEvent::ConnectionClosed => write!(f, "connection closed"),
            SyncEvent::Reconnecting { attempt, delay_ms, error } => {
                write!(f, "reconnecting (attempt {}, waiting {} ms): {}", attempt, delay_ms, error)
            }
            SyncEvent::TransactionOpened => write!(f, "transaction opened"),
            SyncEvent::TransactionCommitted => write!(f, "transaction committed"),
            SyncEvent::SessionBegin { scope_name } => write!(f, "session begin on scope {}", scope_name),
            SyncEvent::SessionEnd { scope_name } => write!(f, "session end on scope {}", scope_name),
            SyncEvent::ScopeLoaded { scope_name, scope_type, is_new } => {
                write!(f, "{} scope {} loaded (new: {})", scope_type, scope_name, is_new)
            }
            SyncEvent::ScopeSaved { scope_name, scope_type } => {
                write!(f, "{} scope {} saved", scope_type, scope_name)
            }
            SyncEvent::ScopeTableCreated { scope_type } => write!(f, "{} scope table created", scope_type),
            SyncEvent::ScopeTableDropped { scope_type } => write!(f, "{} scope table dropped", scope_type),
            SyncEvent::SchemaLoaded { tables } => write!(f, "schema loaded with {} tables", tables),
            SyncEvent::SchemaNameCreated { schema_name } => write!(f, "schema {} created", schema_name),
            SyncEvent::SchemaNameDropped { schema_name } => write!(f, "schema {} dropped", schema_name),
            SyncEvent::TableCreated { table } => write!(f, "table {} created", table),
            SyncEvent::TableDropped { table } => write!(f, "table {} dropped", table),
            SyncEvent::ColumnAdded { table, column } => write!(f, "column {} added to {}", column, table),
            SyncEvent::TrackingTableCreated { tracking_table, .. } => {
                write!(f, "tracking table {} created", tracking_table)
            }
            SyncEvent::TrackingTableDropped { tracking_table, .. } => {
                write!(f, "tracking table {} dropped", tracking_table)
            }
            SyncEvent::TrackingTableRenamed { old_name, new_name, .. } => {
                write!(f, "tracking table {} renamed to {}", old_name, new_name)
            }
            SyncEvent::TriggerCreated { table, kind } => write!(f, "{} trigger created on {}", kind, table),
            SyncEvent::TriggerDropped { table, kind } => write!(f, "{} trigger dropped on {}", kind, table),
            SyncEvent::StoredProcedureCreated { table, kind } => {
                write!(f, "{} procedure created for {}", kind, table)
            }
            SyncEvent::StoredProcedureDropped { table, kind } => {
                write!(f, "{} procedure dropped for {}", kind, table)
            }
            SyncEvent::Provisioned { provision } => write!(f, "provisioned [{}]", provision),
            SyncEvent::Deprovisioned { provision } => write!(f, "deprovisioned [{}]", provision),
            SyncEvent::Migrated { tables } => write!(f, "migrated {} tables", tables),
            SyncEvent::TableChangesSelecting { table, kind } => {
                write!(f, "selecting changes of {} ({:?})", table, kind)
            }
            SyncEvent::TableChangesSelected { changes } => write!(
                f,
                "{} changes selected from {} ({} upserts, {} deletes)",
                changes.total_changes(),
                changes.table_name,
                changes.upserts,
                changes.deletes
            ),
            SyncEvent::DatabaseChangesSelected { changes, parts } => write!(
                f,
                "{} changes selected in {} batch parts",
                changes.total_changes_selected(),
                parts
            ),
            SyncEvent::TableChangesApplied { changes } => write!(
                f,
                "{} {:?} rows applied to {} ({} conflicts)",
                changes.applied, changes.state, changes.table_name, changes.resolved_conflicts
            ),
            SyncEvent::DatabaseChangesApplied { changes } => {
                write!(f, "{} changes applied", changes.total_applied())
            }
            SyncEvent::MetadataCleaned { timestamp, rows_cleaned } => {
                write!(f, "{} metadata rows cleaned up to {}", rows_cleaned, timestamp)
            }
            SyncEvent::SnapshotCreated { directory, rows } => {
                write!(f, "snapshot of {} rows created in {}", rows, directory.display())
            }
            SyncEvent::SnapshotApplied { rows } => write!(f, "snapshot of {} rows applied", rows),
            SyncEvent::UpgradeStep { from, to } => write!(f, "upgrade step {} -> {}", from, to),
            SyncEvent::Upgraded { from, to } => write!(f, "upgraded from {} to {}", from, to),
            SyncEvent::OutdatedScope {
                client_timestamp,
                cleanup_timestamp,
                action,
            } => write!(
                f,
                "outdated scope (last server sync {:?}, cleanup {}), action {:?}",
                client_timestamp, cleanup_timestamp, action
            ),
            SyncEvent::Error { stage, message } => write!(f, "error while {}: {}", stage, message),
        }
    }
}

type Handler = Arc<dyn Fn(&mut SyncEvent) + Send + Sync>;

/// Event subscriptions of one orchestrator
#[derive(Clone, Default)]
pub struct Interceptors {
    handlers: Arc<HashMap<EventKind, Vec<Handler>>>,
}

impl Interceptors {
    pub fn builder() -> InterceptorsBuilder {
        InterceptorsBuilder::default()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    pub fn handles(&self, kind: EventKind) -> bool {
        self.handlers.contains_key(&kind)
    }

    pub(crate) fn dispatch(&self, event: &mut SyncEvent) {
        if let Some(handlers) = self.handlers.get(&event.kind()) {
            for handler in handlers {
                handler(event);
            }
        }
    }
}

impl fmt::Debug for Interceptors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut kinds: Vec<String> = self.handlers.keys().map(|k| format!("{:?}", k)).collect();
        kinds.sort();
        f.debug_struct("Interceptors").field("kinds", &kinds).finish()
    }
}

#[derive(Default)]
pub struct InterceptorsBuilder {
    handlers: HashMap<EventKind, Vec<Handler>>,
}

impl InterceptorsBuilder {
    /// Register a handler for one kind of event
    pub fn on<F>(mut self, kind: EventKind, handler: F) -> Self
    where
        F: Fn(&mut SyncEvent) + Send + Sync + 'static,
    {
        self.handlers.entry(kind).or_default().push(Arc::new(handler));
        self
    }

    pub fn build(self) -> Interceptors {
        Interceptors {
            handlers: Arc::new(self.handlers),
        }
    }
}

/// Progress report sent to an optional sink
#[derive(Debug, Clone, Serialize)]
pub struct ProgressArgs {
    pub stage: SyncStage,
    pub side: Side,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_dispatch_by_kind_in_order() {
        let calls = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let first = calls.clone();
        let second = calls.clone();
        let interceptors = Interceptors::builder()
            .on(EventKind::TableCreated, move |_| first.lock().push("first"))
            .on(EventKind::TableCreated, move |_| second.lock().push("second"))
            .build();

        let mut event = SyncEvent::TableCreated {
            table: "Customer".to_string(),
        };
        interceptors.dispatch(&mut event);
        let mut other = SyncEvent::ConnectionOpened;
        interceptors.dispatch(&mut other);

        assert_eq!(*calls.lock(), vec!["first", "second"]);
    }

    #[test]
    fn test_handler_can_override_outdated_action() {
        let seen = Arc::new(AtomicUsize::new(0));
        let counter = seen.clone();
        let interceptors = Interceptors::builder()
            .on(EventKind::OutdatedScope, move |event| {
                counter.fetch_add(1, Ordering::SeqCst);
                if let SyncEvent::OutdatedScope { action, .. } = event {
                    *action = OutdatedAction::Reinitialize;
                }
            })
            .build();

        let mut event = SyncEvent::OutdatedScope {
            client_timestamp: Some(10),
            cleanup_timestamp: 20,
            action: OutdatedAction::Rollback,
        };
        interceptors.dispatch(&mut event);

        assert_eq!(seen.load(Ordering::SeqCst), 1);
        assert!(matches!(
            event,
            SyncEvent::OutdatedScope {
                action: OutdatedAction::Reinitialize,
                ..
            }
        ));
    }

    #[test]
    fn test_no_handler_is_a_no_op() {
        let interceptors = Interceptors::default();
        let mut event = SyncEvent::Migrated { tables: 2 };
        interceptors.dispatch(&mut event);
        assert!(interceptors.is_empty());
        assert_eq!(event.to_string(), "migrated 2 tables");
    }
}
