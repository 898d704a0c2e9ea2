//! In-memory reference provider
//!
//! Simulates a change tracked database: user tables with a per-row tracking
//! record (timestamp, tombstone flag, originating scope), a monotonic clock,
//! named artifacts and scope tables. Every builder call is recorded in a call
//! log so tests can assert which DDL the orchestrators issued.
//!
//! Transactions snapshot the whole database when they begin and restore the
//! snapshot on rollback.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{Map, Value};
use uuid::Uuid;

use super::{
    ApplyContext, DatabaseBuilder, DbArtifact, DbConnection, IsolationLevel, ProcedureKind, Provider,
    RowReader, ScopeBuilder, SelectChangesQuery, SyncAdapter, TableBuilder,
};
use crate::changes::{RowState, SyncRow, TableChangesApplied, TOMBSTONE_COLUMN};
use crate::error::{Result, SyncError};
use crate::schema::{SetupTable, SyncColumn, SyncRelation, SyncSetup, SyncTable};
use crate::scope::{ClientScopeInfo, ServerHistoryScopeInfo, ServerScopeInfo};
use crate::types::ScopeType;

#[derive(Debug, Clone)]
struct MemoryRow {
    values: Map<String, Value>,
    timestamp: i64,
    tombstone: bool,
    update_scope_id: Option<Uuid>,
}

#[derive(Debug, Clone)]
struct MemoryTable {
    definition: SyncTable,
    rows: BTreeMap<String, MemoryRow>,
}

impl MemoryTable {
    /// Canonical column name as declared in the table definition
    fn canonical(&self, column: &str) -> Option<&str> {
        self.definition.column(column).map(|c| c.name.as_str())
    }

    fn row_key(&self, values: &Map<String, Value>) -> Result<String> {
        let key: Vec<&Value> = self
            .definition
            .primary_keys
            .iter()
            .map(|k| values.get(k).unwrap_or(&Value::Null))
            .collect();
        Ok(serde_json::to_string(&key)?)
    }

    /// Map an object onto the definition's columns
    fn normalize(&self, object: &Map<String, Value>) -> Result<Map<String, Value>> {
        let mut values = Map::new();
        for (name, value) in object {
            let column = self.canonical(name).ok_or_else(|| SyncError::MissingColumn {
                table: self.definition.full_name(),
                column: name.clone(),
            })?;
            values.insert(column.to_string(), value.clone());
        }
        for column in &self.definition.columns {
            values.entry(column.name.clone()).or_insert(Value::Null);
        }
        Ok(values)
    }
}

#[derive(Debug, Clone, Default)]
struct MemoryState {
    clock: i64,
    tables: BTreeMap<String, MemoryTable>,
    relations: Vec<SyncRelation>,
    artifacts: BTreeSet<String>,
    scopes: BTreeMap<String, BTreeMap<String, Value>>,
}

impl MemoryState {
    fn tick(&mut self) -> i64 {
        self.clock += 1;
        self.clock
    }

    fn table(&self, table: &SyncTable) -> Result<&MemoryTable> {
        self.tables
            .get(&table_key(table))
            .ok_or_else(|| SyncError::MissingTable(table.full_name()))
    }

    fn table_mut(&mut self, table: &SyncTable) -> Result<&mut MemoryTable> {
        self.tables
            .get_mut(&table_key(table))
            .ok_or_else(|| SyncError::MissingTable(table.full_name()))
    }

    fn require(&self, key: &str) -> Result<()> {
        if self.artifacts.contains(key) {
            Ok(())
        } else {
            Err(SyncError::Provider(format!("{} does not exist", key)))
        }
    }

    fn scope_rows(&self, table: &str) -> Result<&BTreeMap<String, Value>> {
        self.scopes
            .get(table)
            .ok_or_else(|| SyncError::Provider(format!("scope table {} does not exist", table)))
    }

    fn scope_rows_mut(&mut self, table: &str) -> Result<&mut BTreeMap<String, Value>> {
        self.scopes
            .get_mut(table)
            .ok_or_else(|| SyncError::Provider(format!("scope table {} does not exist", table)))
    }
}

#[derive(Default)]
struct Shared {
    state: Mutex<MemoryState>,
    calls: Mutex<Vec<String>>,
    failures: Mutex<Option<(u32, bool)>>,
}

impl Shared {
    fn log(&self, call: String) {
        tracing::trace!("memory provider: {}", call);
        self.calls.lock().push(call);
    }
}

fn table_key(table: &SyncTable) -> String {
    table.full_name().to_lowercase()
}

fn parse_table(name: &str) -> SyncTable {
    let setup_table = SetupTable::from(name);
    let table = SyncTable::new(setup_table.table_name);
    match setup_table.schema_name {
        Some(schema) => table.with_schema(schema),
        None => table,
    }
}

fn ensure_open(conn: &dyn DbConnection) -> Result<()> {
    if conn.is_open() {
        Ok(())
    } else {
        Err(SyncError::Connection("connection is closed".to_string()))
    }
}

fn tracking_table_name(table: &SyncTable, setup: &SyncSetup) -> String {
    let name = format!(
        "{}{}{}",
        setup.tracking_tables_prefix, table.table_name, setup.tracking_tables_suffix
    );
    match table.schema_name.as_deref().filter(|s| !s.is_empty()) {
        Some(schema) => format!("{}.{}", schema, name),
        None => name,
    }
}

fn artifact_key(table: &SyncTable, setup: &SyncSetup, artifact: DbArtifact) -> String {
    match artifact {
        DbArtifact::SchemaName => format!("schema:{}", table.schema_name.as_deref().unwrap_or_default()),
        DbArtifact::Table => format!("table:{}", table.full_name()),
        DbArtifact::TrackingTable => format!("tracking_table:{}", tracking_table_name(table, setup)),
        DbArtifact::Trigger(kind) => format!(
            "trigger:{}{}_{}_trigger{}",
            setup.triggers_prefix,
            table.full_name(),
            kind,
            setup.triggers_suffix
        ),
        DbArtifact::StoredProcedure(kind) => format!(
            "stored_procedure:{}{}_{}{}",
            setup.stored_procedures_prefix,
            table.full_name(),
            kind,
            setup.stored_procedures_suffix
        ),
    }
}

/// In-memory provider used by tests, benches and the CLI demo
#[derive(Clone)]
pub struct InMemoryProvider {
    shared: Arc<Shared>,
    multiple_active_result_sets: bool,
    bulk_operations: bool,
    server_capable: bool,
}

impl Default for InMemoryProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryProvider {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared::default()),
            multiple_active_result_sets: true,
            bulk_operations: false,
            server_capable: true,
        }
    }

    pub fn with_multiple_active_result_sets(mut self, enabled: bool) -> Self {
        self.multiple_active_result_sets = enabled;
        self
    }

    pub fn with_bulk_operations(mut self, enabled: bool) -> Self {
        self.bulk_operations = enabled;
        self
    }

    pub fn with_server_capability(mut self, enabled: bool) -> Self {
        self.server_capable = enabled;
        self
    }

    /// Create a user table, replacing any table with the same name
    pub fn create_table(&self, table: SyncTable) {
        let mut state = self.shared.state.lock();
        state.tables.insert(
            table_key(&table),
            MemoryTable {
                definition: table,
                rows: BTreeMap::new(),
            },
        );
    }

    pub fn add_relation(&self, relation: SyncRelation) {
        self.shared.state.lock().relations.push(relation);
    }

    /// Insert or update a row as a local change, returning its timestamp
    pub fn upsert_row(&self, table_name: &str, values: Value) -> Result<i64> {
        let object = values
            .as_object()
            .ok_or_else(|| SyncError::Provider("row values must be an object".to_string()))?;
        let mut state = self.shared.state.lock();
        let timestamp = state.tick();
        let table = state.table_mut(&parse_table(table_name))?;
        let values = table.normalize(object)?;
        let key = table.row_key(&values)?;
        table.rows.insert(
            key,
            MemoryRow {
                values,
                timestamp,
                tombstone: false,
                update_scope_id: None,
            },
        );
        Ok(timestamp)
    }

    /// Delete a row as a local change, leaving a tombstone
    pub fn delete_row(&self, table_name: &str, key: Value) -> Result<i64> {
        let object = key
            .as_object()
            .ok_or_else(|| SyncError::Provider("row key must be an object".to_string()))?;
        let mut state = self.shared.state.lock();
        let timestamp = state.tick();
        let table = state.table_mut(&parse_table(table_name))?;
        let values = table.normalize(object)?;
        let key = table.row_key(&values)?;
        let row = table
            .rows
            .get_mut(&key)
            .ok_or_else(|| SyncError::Provider(format!("row {} not found", key)))?;
        row.tombstone = true;
        row.timestamp = timestamp;
        row.update_scope_id = None;
        Ok(timestamp)
    }

    /// Live rows of a table, in key order
    pub fn rows(&self, table_name: &str) -> Vec<Map<String, Value>> {
        let state = self.shared.state.lock();
        state
            .table(&parse_table(table_name))
            .map(|t| {
                t.rows
                    .values()
                    .filter(|r| !r.tombstone)
                    .map(|r| r.values.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn row_count(&self, table_name: &str) -> usize {
        self.rows(table_name).len()
    }

    pub fn tombstone_count(&self, table_name: &str) -> usize {
        let state = self.shared.state.lock();
        state
            .table(&parse_table(table_name))
            .map(|t| t.rows.values().filter(|r| r.tombstone).count())
            .unwrap_or(0)
    }

    /// Columns of a user table as currently defined
    pub fn columns(&self, table_name: &str) -> Vec<String> {
        let state = self.shared.state.lock();
        state
            .table(&parse_table(table_name))
            .map(|t| t.definition.columns.iter().map(|c| c.name.clone()).collect())
            .unwrap_or_default()
    }

    pub fn has_table(&self, table_name: &str) -> bool {
        self.shared
            .state
            .lock()
            .tables
            .contains_key(&table_key(&parse_table(table_name)))
    }

    pub fn has_artifact(&self, key: &str) -> bool {
        self.shared.state.lock().artifacts.contains(key)
    }

    pub fn artifacts(&self) -> Vec<String> {
        self.shared.state.lock().artifacts.iter().cloned().collect()
    }

    pub fn calls(&self) -> Vec<String> {
        self.shared.calls.lock().clone()
    }

    pub fn clear_calls(&self) {
        self.shared.calls.lock().clear();
    }

    /// Make the next `count` connection opens fail
    pub fn fail_next_opens(&self, count: u32, retryable: bool) {
        *self.shared.failures.lock() = Some((count, retryable));
    }

    /// Current value of the clock
    pub fn timestamp(&self) -> i64 {
        self.shared.state.lock().clock
    }
}

impl Provider for InMemoryProvider {
    fn provider_type(&self) -> &str {
        "memory"
    }

    fn create_connection(&self) -> Arc<dyn DbConnection> {
        Arc::new(MemoryConnection {
            shared: self.shared.clone(),
            open: AtomicBool::new(false),
            snapshot: Mutex::new(None),
        })
    }

    fn database_builder(&self) -> Arc<dyn DatabaseBuilder> {
        Arc::new(MemoryDatabaseBuilder {
            shared: self.shared.clone(),
        })
    }

    fn table_builder(&self, table: &SyncTable, setup: &SyncSetup) -> Arc<dyn TableBuilder> {
        Arc::new(MemoryTableBuilder {
            shared: self.shared.clone(),
            table: table.clone(),
            setup: setup.clone(),
        })
    }

    fn scope_builder(&self, scope_info_table_name: &str) -> Arc<dyn ScopeBuilder> {
        Arc::new(MemoryScopeBuilder {
            shared: self.shared.clone(),
            table_name: scope_info_table_name.to_string(),
        })
    }

    fn sync_adapter(&self, table: &SyncTable, setup: &SyncSetup) -> Arc<dyn SyncAdapter> {
        Arc::new(MemoryAdapter {
            shared: self.shared.clone(),
            table: table.clone(),
            setup: setup.clone(),
            bulk_operations: self.bulk_operations,
        })
    }

    fn supports_multiple_active_result_sets(&self) -> bool {
        self.multiple_active_result_sets
    }

    fn supports_bulk_operations(&self) -> bool {
        self.bulk_operations
    }

    fn can_be_server_provider(&self) -> bool {
        self.server_capable
    }
}

/// Connection to an [`InMemoryProvider`]
pub struct MemoryConnection {
    shared: Arc<Shared>,
    open: AtomicBool,
    snapshot: Mutex<Option<MemoryState>>,
}

#[async_trait]
impl DbConnection for MemoryConnection {
    async fn open(&self) -> Result<()> {
        {
            let mut failures = self.shared.failures.lock();
            if let Some((count, retryable)) = failures.as_mut() {
                if *count > 0 {
                    *count -= 1;
                    let retryable = *retryable;
                    return Err(if retryable {
                        SyncError::Connection("simulated transient failure".to_string())
                    } else {
                        SyncError::Provider("simulated fatal failure".to_string())
                    });
                }
            }
        }
        self.open.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    async fn begin(&self, _isolation: IsolationLevel) -> Result<()> {
        ensure_open(self)?;
        let mut snapshot = self.snapshot.lock();
        if snapshot.is_some() {
            return Err(SyncError::Provider("a transaction is already open".to_string()));
        }
        *snapshot = Some(self.shared.state.lock().clone());
        Ok(())
    }

    fn in_transaction(&self) -> bool {
        self.snapshot.lock().is_some()
    }

    async fn commit(&self) -> Result<()> {
        match self.snapshot.lock().take() {
            Some(_) => Ok(()),
            None => Err(SyncError::Provider("no transaction to commit".to_string())),
        }
    }

    async fn rollback(&self) -> Result<()> {
        if let Some(snapshot) = self.snapshot.lock().take() {
            *self.shared.state.lock() = snapshot;
        }
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.rollback().await?;
        self.open.store(false, Ordering::SeqCst);
        Ok(())
    }
}

struct MemoryDatabaseBuilder {
    shared: Arc<Shared>,
}

#[async_trait]
impl DatabaseBuilder for MemoryDatabaseBuilder {
    async fn ensure_database(&self, conn: &dyn DbConnection) -> Result<()> {
        ensure_open(conn)
    }

    async fn get_table(
        &self,
        conn: &dyn DbConnection,
        table_name: &str,
        schema_name: Option<&str>,
    ) -> Result<Option<SyncTable>> {
        ensure_open(conn)?;
        let state = self.shared.state.lock();
        Ok(state
            .tables
            .values()
            .find(|t| t.definition.matches(table_name, schema_name))
            .map(|t| t.definition.clone()))
    }

    async fn get_relations(
        &self,
        conn: &dyn DbConnection,
        table_name: &str,
        schema_name: Option<&str>,
    ) -> Result<Vec<SyncRelation>> {
        ensure_open(conn)?;
        let state = self.shared.state.lock();
        Ok(state
            .relations
            .iter()
            .filter(|r| r.child.matches(table_name, schema_name))
            .cloned()
            .collect())
    }
}

struct MemoryTableBuilder {
    shared: Arc<Shared>,
    table: SyncTable,
    setup: SyncSetup,
}

#[async_trait]
impl TableBuilder for MemoryTableBuilder {
    fn tracking_table_name(&self) -> String {
        tracking_table_name(&self.table, &self.setup)
    }

    async fn exists_artifact(&self, conn: &dyn DbConnection, artifact: DbArtifact) -> Result<bool> {
        ensure_open(conn)?;
        let key = artifact_key(&self.table, &self.setup, artifact);
        self.shared.log(format!("exists {}", key));
        let state = self.shared.state.lock();
        Ok(match artifact {
            DbArtifact::Table => state.tables.contains_key(&table_key(&self.table)),
            _ => state.artifacts.contains(&key),
        })
    }

    async fn create_artifact(&self, conn: &dyn DbConnection, artifact: DbArtifact) -> Result<()> {
        ensure_open(conn)?;
        let key = artifact_key(&self.table, &self.setup, artifact);
        self.shared.log(format!("create {}", key));
        let mut state = self.shared.state.lock();
        match artifact {
            DbArtifact::Table => {
                state
                    .tables
                    .entry(table_key(&self.table))
                    .or_insert_with(|| MemoryTable {
                        definition: self.table.clone(),
                        rows: BTreeMap::new(),
                    });
            }
            DbArtifact::TrackingTable => {
                state.table(&self.table)?;
                state.artifacts.insert(key);
            }
            _ => {
                state.artifacts.insert(key);
            }
        }
        Ok(())
    }

    async fn drop_artifact(&self, conn: &dyn DbConnection, artifact: DbArtifact) -> Result<()> {
        ensure_open(conn)?;
        let key = artifact_key(&self.table, &self.setup, artifact);
        self.shared.log(format!("drop {}", key));
        let mut state = self.shared.state.lock();
        match artifact {
            DbArtifact::Table => {
                state.tables.remove(&table_key(&self.table));
            }
            DbArtifact::TrackingTable => {
                state.artifacts.remove(&key);
                if let Ok(table) = state.table_mut(&self.table) {
                    table.rows.retain(|_, row| !row.tombstone);
                }
            }
            _ => {
                state.artifacts.remove(&key);
            }
        }
        Ok(())
    }

    async fn exists_column(&self, conn: &dyn DbConnection, column_name: &str) -> Result<bool> {
        ensure_open(conn)?;
        self.shared
            .log(format!("exists_column {}.{}", self.table.full_name(), column_name));
        let state = self.shared.state.lock();
        Ok(state.table(&self.table)?.definition.has_column(column_name))
    }

    async fn add_column(&self, conn: &dyn DbConnection, column: &SyncColumn) -> Result<()> {
        ensure_open(conn)?;
        self.shared
            .log(format!("add_column {}.{}", self.table.full_name(), column.name));
        let mut state = self.shared.state.lock();
        let table = state.table_mut(&self.table)?;
        if !table.definition.has_column(&column.name) {
            table.definition.columns.push(column.clone());
            for row in table.rows.values_mut() {
                row.values.insert(column.name.clone(), Value::Null);
            }
        }
        Ok(())
    }

    async fn rename_tracking_table(&self, conn: &dyn DbConnection, old_name: &str) -> Result<()> {
        ensure_open(conn)?;
        let new_name = self.tracking_table_name();
        self.shared
            .log(format!("rename_tracking_table {} -> {}", old_name, new_name));
        let mut state = self.shared.state.lock();
        let old_key = format!("tracking_table:{}", old_name);
        if !state.artifacts.remove(&old_key) {
            return Err(SyncError::Provider(format!("{} does not exist", old_key)));
        }
        state.artifacts.insert(format!("tracking_table:{}", new_name));
        Ok(())
    }
}

struct MemoryScopeBuilder {
    shared: Arc<Shared>,
    table_name: String,
}

impl MemoryScopeBuilder {
    fn scope_table(&self, scope_type: ScopeType) -> String {
        match scope_type {
            ScopeType::Client => self.table_name.clone(),
            ScopeType::Server => format!("{}_server", self.table_name),
            ScopeType::ServerHistory => format!("{}_history", self.table_name),
        }
    }

    fn load<T: serde::de::DeserializeOwned>(&self, scope_type: ScopeType, key: &str) -> Result<Option<T>> {
        let state = self.shared.state.lock();
        match state.scope_rows(&self.scope_table(scope_type))?.get(key) {
            Some(value) => Ok(Some(serde_json::from_value(value.clone())?)),
            None => Ok(None),
        }
    }

    fn save<T: serde::Serialize>(&self, scope_type: ScopeType, key: String, record: &T) -> Result<()> {
        let value = serde_json::to_value(record)?;
        let mut state = self.shared.state.lock();
        state
            .scope_rows_mut(&self.scope_table(scope_type))?
            .insert(key, value);
        Ok(())
    }

    fn delete_where(&self, scope_type: ScopeType, name: &str) -> Result<()> {
        let mut state = self.shared.state.lock();
        state
            .scope_rows_mut(&self.scope_table(scope_type))?
            .retain(|_, record| record.get("name").and_then(Value::as_str) != Some(name));
        Ok(())
    }
}

#[async_trait]
impl ScopeBuilder for MemoryScopeBuilder {
    async fn exists_scope_table(&self, conn: &dyn DbConnection, scope_type: ScopeType) -> Result<bool> {
        ensure_open(conn)?;
        let key = format!("scope_table:{}", self.scope_table(scope_type));
        self.shared.log(format!("exists {}", key));
        Ok(self.shared.state.lock().artifacts.contains(&key))
    }

    async fn create_scope_table(&self, conn: &dyn DbConnection, scope_type: ScopeType) -> Result<()> {
        ensure_open(conn)?;
        let table = self.scope_table(scope_type);
        self.shared.log(format!("create scope_table:{}", table));
        let mut state = self.shared.state.lock();
        state.artifacts.insert(format!("scope_table:{}", table));
        state.scopes.entry(table).or_default();
        Ok(())
    }

    async fn drop_scope_table(&self, conn: &dyn DbConnection, scope_type: ScopeType) -> Result<()> {
        ensure_open(conn)?;
        let table = self.scope_table(scope_type);
        self.shared.log(format!("drop scope_table:{}", table));
        let mut state = self.shared.state.lock();
        state.artifacts.remove(&format!("scope_table:{}", table));
        state.scopes.remove(&table);
        Ok(())
    }

    async fn get_local_timestamp(&self, conn: &dyn DbConnection) -> Result<i64> {
        ensure_open(conn)?;
        Ok(self.shared.state.lock().clock)
    }

    async fn load_client_scope(&self, conn: &dyn DbConnection, name: &str) -> Result<Option<ClientScopeInfo>> {
        ensure_open(conn)?;
        self.load(ScopeType::Client, name)
    }

    async fn save_client_scope(&self, conn: &dyn DbConnection, scope: &ClientScopeInfo) -> Result<()> {
        ensure_open(conn)?;
        self.save(ScopeType::Client, scope.name.clone(), scope)
    }

    async fn delete_client_scope(&self, conn: &dyn DbConnection, name: &str) -> Result<()> {
        ensure_open(conn)?;
        self.delete_where(ScopeType::Client, name)
    }

    async fn load_server_scope(&self, conn: &dyn DbConnection, name: &str) -> Result<Option<ServerScopeInfo>> {
        ensure_open(conn)?;
        self.load(ScopeType::Server, name)
    }

    async fn save_server_scope(&self, conn: &dyn DbConnection, scope: &ServerScopeInfo) -> Result<()> {
        ensure_open(conn)?;
        self.save(ScopeType::Server, scope.name.clone(), scope)
    }

    async fn delete_server_scope(&self, conn: &dyn DbConnection, name: &str) -> Result<()> {
        ensure_open(conn)?;
        self.delete_where(ScopeType::Server, name)
    }

    async fn load_server_history(
        &self,
        conn: &dyn DbConnection,
        name: &str,
    ) -> Result<Vec<ServerHistoryScopeInfo>> {
        ensure_open(conn)?;
        let state = self.shared.state.lock();
        let mut history = Vec::new();
        for record in state
            .scope_rows(&self.scope_table(ScopeType::ServerHistory))?
            .values()
        {
            let scope: ServerHistoryScopeInfo = serde_json::from_value(record.clone())?;
            if scope.name == name {
                history.push(scope);
            }
        }
        Ok(history)
    }

    async fn save_server_history(&self, conn: &dyn DbConnection, scope: &ServerHistoryScopeInfo) -> Result<()> {
        ensure_open(conn)?;
        let key = format!("{}:{}", scope.name, scope.id);
        self.save(ScopeType::ServerHistory, key, scope)
    }

    async fn delete_server_history(&self, conn: &dyn DbConnection, name: &str) -> Result<()> {
        ensure_open(conn)?;
        self.delete_where(ScopeType::ServerHistory, name)
    }
}

struct MemoryRowReader {
    records: std::vec::IntoIter<Map<String, Value>>,
}

#[async_trait]
impl RowReader for MemoryRowReader {
    async fn read(&mut self) -> Result<Option<Map<String, Value>>> {
        Ok(self.records.next())
    }
}

struct MemoryAdapter {
    shared: Arc<Shared>,
    table: SyncTable,
    setup: SyncSetup,
    bulk_operations: bool,
}

impl MemoryAdapter {
    fn procedure_key(&self, kind: ProcedureKind) -> String {
        artifact_key(&self.table, &self.setup, DbArtifact::StoredProcedure(kind))
    }

    /// Whether a row passes the table's filter for the given parameters
    fn filter_matches(&self, table: &MemoryTable, row: &MemoryRow, query: &SelectChangesQuery) -> bool {
        let Some(filter) = self
            .setup
            .filter_for(&self.table.table_name, self.table.schema_name.as_deref())
        else {
            return true;
        };
        filter
            .wheres
            .iter()
            .filter(|clause| self.table.matches(&clause.table_name, clause.schema_name.as_deref()))
            .all(|clause| {
                let expected = query.parameters.get(&clause.parameter_name).cloned().or_else(|| {
                    filter
                        .parameter(&clause.parameter_name)
                        .and_then(|p| p.default_value.clone())
                });
                match (expected, table.canonical(&clause.column_name)) {
                    (Some(expected), Some(column)) => row.values.get(column) == Some(&expected),
                    (Some(_), None) => false,
                    (None, _) => true,
                }
            })
    }
}

#[async_trait]
impl SyncAdapter for MemoryAdapter {
    async fn select_changes(
        &self,
        conn: &dyn DbConnection,
        query: &SelectChangesQuery,
    ) -> Result<Box<dyn RowReader>> {
        ensure_open(conn)?;
        let state = self.shared.state.lock();
        state.require(&artifact_key(&self.table, &self.setup, DbArtifact::TrackingTable))?;
        state.require(&self.procedure_key(query.kind.procedure()))?;
        let table = state.table(&self.table)?;

        let records: Vec<Map<String, Value>> = table
            .rows
            .values()
            .filter(|row| {
                if query.kind.is_initialization() {
                    !row.tombstone && query.last_timestamp.map_or(true, |last| row.timestamp > last)
                } else {
                    row.timestamp > query.last_timestamp.unwrap_or(0)
                        && row.update_scope_id != Some(query.scope_id)
                }
            })
            .filter(|row| !query.kind.is_filtered() || self.filter_matches(table, row, query))
            .map(|row| {
                let mut record = Map::new();
                for column in &self.table.columns {
                    let value = table
                        .canonical(&column.name)
                        .and_then(|name| row.values.get(name))
                        .cloned()
                        .unwrap_or(Value::Null);
                    record.insert(column.name.clone(), value);
                }
                record.insert(TOMBSTONE_COLUMN.to_string(), Value::Bool(row.tombstone));
                record
            })
            .collect();

        Ok(Box::new(MemoryRowReader {
            records: records.into_iter(),
        }))
    }

    async fn apply_changes(
        &self,
        conn: &dyn DbConnection,
        state: RowState,
        rows: &[SyncRow],
        ctx: &ApplyContext,
    ) -> Result<TableChangesApplied> {
        ensure_open(conn)?;
        let procedure = match (state, self.bulk_operations) {
            (RowState::Modified, false) => ProcedureKind::UpdateRow,
            (RowState::Modified, true) => ProcedureKind::BulkUpdateRows,
            (RowState::Deleted, false) => ProcedureKind::DeleteRow,
            (RowState::Deleted, true) => ProcedureKind::BulkDeleteRows,
        };

        let mut db = self.shared.state.lock();
        db.require(&self.procedure_key(procedure))?;
        db.table(&self.table)?;

        let mut applied = TableChangesApplied::new(&self.table.table_ref(), state);
        let last_timestamp = ctx.last_timestamp.unwrap_or(0);

        for row in rows {
            let timestamp = db.tick();
            let table = db.table_mut(&self.table)?;

            let mut incoming = Map::new();
            for (column, value) in self.table.columns.iter().zip(&row.values) {
                if let Some(name) = table.canonical(&column.name) {
                    incoming.insert(name.to_string(), value.clone());
                }
            }
            let key = table.row_key(&incoming)?;

            if let Some(existing) = table.rows.get(&key) {
                let conflict = existing.timestamp > last_timestamp
                    && existing.update_scope_id != Some(ctx.scope_id);
                if conflict {
                    applied.resolved_conflicts += 1;
                    if !ctx.policy.incoming_wins(ctx.side) {
                        continue;
                    }
                }
            }

            match state {
                RowState::Modified => {
                    let mut values = table
                        .rows
                        .get(&key)
                        .map(|r| r.values.clone())
                        .unwrap_or_default();
                    values.extend(incoming);
                    for column in &table.definition.columns {
                        values.entry(column.name.clone()).or_insert(Value::Null);
                    }
                    table.rows.insert(
                        key,
                        MemoryRow {
                            values,
                            timestamp,
                            tombstone: false,
                            update_scope_id: Some(ctx.scope_id),
                        },
                    );
                }
                RowState::Deleted => {
                    if let Some(existing) = table.rows.get_mut(&key) {
                        existing.tombstone = true;
                        existing.timestamp = timestamp;
                        existing.update_scope_id = Some(ctx.scope_id);
                    }
                }
            }
            applied.applied += 1;
        }

        Ok(applied)
    }

    async fn delete_metadata(&self, conn: &dyn DbConnection, timestamp: i64) -> Result<u64> {
        ensure_open(conn)?;
        let mut state = self.shared.state.lock();
        state.require(&self.procedure_key(ProcedureKind::DeleteMetadata))?;
        let table = state.table_mut(&self.table)?;
        let before = table.rows.len();
        table
            .rows
            .retain(|_, row| !(row.tombstone && row.timestamp <= timestamp));
        Ok((before - table.rows.len()) as u64)
    }

    async fn reset_table(&self, conn: &dyn DbConnection) -> Result<()> {
        ensure_open(conn)?;
        let mut state = self.shared.state.lock();
        state.require(&self.procedure_key(ProcedureKind::Reset))?;
        state.table_mut(&self.table)?.rows.clear();
        Ok(())
    }
}
