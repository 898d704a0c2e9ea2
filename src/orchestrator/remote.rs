//! Server side orchestrator
//!
//! A sync round trip is two transactions: the client's changes are applied
//! and committed first, then the server clock is read and the changes for
//! the client are selected, so the returned watermark covers what was just
//! committed.

use std::sync::Arc;

use chrono::Utc;
use tokio::sync::mpsc::UnboundedSender;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::{Interceptors, Orchestrator, ProgressArgs, SyncEvent};
use crate::batch::{snapshot_directory, BatchInfo, SerializerFactory, SUMMARY_FILE_NAME};
use crate::changes::{
    ChangesRequest, DatabaseChangesApplied, DatabaseChangesSelected, DatabaseMetadatasCleaned, TableChangesSelected,
};
use crate::config::SyncOptions;
use crate::error::{Result, SyncError};
use crate::provider::{ApplyContext, DbConnection, Provider};
use crate::provision::{Provision, SyncProvision};
use crate::schema::{SyncSet, SyncSetup, TableRef};
use crate::scope::{is_outdated, ClientScopeInfo, ServerHistoryScopeInfo, ServerScopeInfo, ServerScopeStore};
use crate::types::{ScopeType, Side, SyncParameters, SyncStage};
use crate::upgrade::{self, parse_version, SyncVersion};

/// Refuse a client whose watermark predates the last metadata cleanup,
/// unless it is being reinitialized
fn ensure_not_outdated(client: &ClientScopeInfo, scope: &ServerScopeInfo, reinitialize: bool) -> Result<()> {
    if !reinitialize && is_outdated(client, scope) {
        return Err(SyncError::OutOfDate {
            client_timestamp: client.last_server_sync_timestamp.unwrap_or(0),
            cleanup_timestamp: scope.last_cleanup_timestamp,
        });
    }
    Ok(())
}

/// What a client sends for one round trip
#[derive(Debug, Clone)]
pub struct ServerSyncRequest {
    pub client_scope: ClientScopeInfo,
    /// Client changes to apply, none when nothing is uploaded
    pub batch_info: Option<BatchInfo>,
    /// Filter parameters, the orchestrator's own when absent
    pub parameters: Option<SyncParameters>,
    /// Skip the outdated check and send a full set
    pub reinitialize: bool,
}

impl ServerSyncRequest {
    pub fn new(client_scope: ClientScopeInfo) -> Self {
        Self {
            client_scope,
            batch_info: None,
            parameters: None,
            reinitialize: false,
        }
    }

    pub fn with_batch(mut self, batch_info: BatchInfo) -> Self {
        self.batch_info = Some(batch_info);
        self
    }

    pub fn with_parameters(mut self, parameters: SyncParameters) -> Self {
        self.parameters = Some(parameters);
        self
    }

    pub fn reinitialize(mut self, reinitialize: bool) -> Self {
        self.reinitialize = reinitialize;
        self
    }
}

/// What the server sends back
#[derive(Debug, Clone, PartialEq)]
pub struct ServerSyncChanges {
    /// Server clock the selection covers, the client's next watermark
    pub remote_timestamp: i64,
    pub batch_info: BatchInfo,
    pub changes_selected: DatabaseChangesSelected,
    pub changes_applied: DatabaseChangesApplied,
}

/// Statistics of a snapshot, which only holds upserts
fn snapshot_changes(snapshot: &BatchInfo) -> DatabaseChangesSelected {
    let mut changes = DatabaseChangesSelected::default();
    for table in snapshot.parts.iter().flat_map(|p| &p.tables) {
        let position = changes
            .tables
            .iter()
            .position(|t| t.table_name == table.table_name && t.schema_name == table.schema_name);
        let index = match position {
            Some(index) => index,
            None => {
                let table_ref = TableRef::new(table.table_name.clone(), table.schema_name.clone());
                changes.tables.push(TableChangesSelected::new(&table_ref));
                changes.tables.len() - 1
            }
        };
        changes.tables[index].upserts += table.rows_count;
    }
    changes
}

/// Orchestrator of a server database
pub struct RemoteOrchestrator {
    base: Orchestrator,
    scopes: ServerScopeStore,
}

impl RemoteOrchestrator {
    pub fn new(provider: Arc<dyn Provider>, setup: SyncSetup, options: SyncOptions) -> Result<Self> {
        if !provider.can_be_server_provider() {
            return Err(SyncError::InvalidProvision {
                side: Side::Server,
                detail: format!("provider {} cannot be used on a server", provider.provider_type()),
            });
        }
        let base = Orchestrator::new(provider, setup, options, Side::Server)?;
        let scopes = ServerScopeStore::new(base.scope_builder.clone());
        Ok(Self { base, scopes })
    }

    pub fn with_scope_name(mut self, name: impl Into<String>) -> Self {
        self.base.scope_name = name.into();
        self
    }

    pub fn with_interceptors(mut self, interceptors: Interceptors) -> Self {
        self.base.interceptors = interceptors;
        self
    }

    pub fn with_progress(mut self, progress: UnboundedSender<ProgressArgs>) -> Self {
        self.base.progress = Some(progress);
        self
    }

    /// Default filter parameters, used for snapshots and requests without any
    pub fn with_parameters(mut self, parameters: SyncParameters) -> Self {
        self.base.parameters = parameters;
        self
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.base.cancellation = token;
        self
    }

    pub fn with_serializer(mut self, serializer: Arc<dyn SerializerFactory>) -> Self {
        self.base.options.serializer = serializer.key().to_string();
        self.base.serializer = serializer;
        self
    }

    pub fn base(&self) -> &Orchestrator {
        &self.base
    }

    async fn load_scope(&self, conn: &dyn DbConnection) -> Result<ServerScopeInfo> {
        let scope = self.scopes.get_or_create(conn, &self.base.scope_name).await?;
        self.base.intercept(SyncEvent::ScopeLoaded {
            scope_name: scope.name.clone(),
            scope_type: ScopeType::Server,
            is_new: scope.is_new_scope,
        });
        Ok(scope)
    }

    async fn store_scope(&self, conn: &dyn DbConnection, scope: &ServerScopeInfo) -> Result<()> {
        self.scopes.save(conn, scope).await?;
        self.base.intercept(SyncEvent::ScopeSaved {
            scope_name: scope.name.clone(),
            scope_type: ScopeType::Server,
        });
        Ok(())
    }

    /// Load the server scope, creating it on first access
    pub async fn get_server_scope(&self) -> Result<ServerScopeInfo> {
        self.base
            .run_in_transaction(SyncStage::ScopeLoading, None, |conn| async move {
                self.load_scope(conn.as_ref()).await
            })
            .await
    }

    /// History rows of every client that synchronized on this scope
    pub async fn get_history(&self) -> Result<Vec<ServerHistoryScopeInfo>> {
        self.base
            .run_in_transaction(SyncStage::ScopeLoading, None, |conn| async move {
                self.scopes.history(conn.as_ref(), &self.base.scope_name).await
            })
            .await
    }

    pub async fn get_schema(&self) -> Result<SyncSet> {
        self.base
            .run_in_transaction(SyncStage::SchemaReading, None, |conn| async move {
                self.base.read_schema(conn.as_ref()).await
            })
            .await
    }

    async fn scope_schema(&self, conn: &dyn DbConnection, scope: &ServerScopeInfo) -> Result<SyncSet> {
        match &scope.schema {
            Some(schema) if schema.has_tables() => Ok(schema.clone()),
            _ => self.base.read_schema(conn).await,
        }
    }

    async fn provision_on(
        &self,
        conn: &dyn DbConnection,
        provision: &SyncProvision,
        overwrite: bool,
    ) -> Result<SyncSet> {
        let schema = self.base.read_schema(conn).await?;
        self.base.provision_schema(conn, &schema, provision, overwrite).await?;

        let name = &self.base.scope_name;
        let scope = match self.scopes.get(conn, name).await? {
            Some(scope) => Some(scope),
            None if provision.contains(Provision::ServerScope) => Some(ServerScopeInfo::new(name.clone())),
            None => None,
        };
        if let Some(mut scope) = scope {
            scope.schema = Some(schema.clone());
            scope.setup = Some(self.base.setup.clone());
            scope.is_new_scope = false;
            self.store_scope(conn, &scope).await?;
        }
        Ok(schema)
    }

    /// Create the requested artifacts for the setup's tables, read from the
    /// server database
    pub async fn provision(&self, provision: &SyncProvision, overwrite: bool) -> Result<SyncSet> {
        self.base
            .run_in_transaction(SyncStage::Provisioning, None, |conn| async move {
                self.provision_on(conn.as_ref(), provision, overwrite).await
            })
            .await
    }

    pub async fn deprovision(&self, provision: &SyncProvision) -> Result<()> {
        self.base
            .run_in_transaction(SyncStage::Deprovisioning, None, |conn| async move {
                let conn = conn.as_ref();
                let scope = self.scopes.get(conn, &self.base.scope_name).await?;
                let (schema, setup) = match &scope {
                    Some(scope) => (
                        self.scope_schema(conn, scope).await?,
                        scope.setup.clone().unwrap_or_else(|| self.base.setup.clone()),
                    ),
                    None => (self.base.read_schema(conn).await?, self.base.setup.clone()),
                };
                self.base.deprovision_schema(conn, &schema, &setup, provision).await
            })
            .await
    }

    /// Oldest version among the server scope and every client history row
    async fn minimum_version(&self, conn: &dyn DbConnection, scope: &ServerScopeInfo) -> Result<SyncVersion> {
        let mut version = parse_version(&scope.version)?;
        for history in self.scopes.history(conn, &self.base.scope_name).await? {
            if let Some(recorded) = history.version.as_deref() {
                version = version.min(parse_version(recorded)?);
            }
        }
        Ok(version)
    }

    async fn upgrade_on(&self, conn: &dyn DbConnection, scope: &mut ServerScopeInfo) -> Result<()> {
        let from = self.minimum_version(conn, scope).await?;
        if !upgrade::needs_upgrade(from) {
            return Ok(());
        }
        let schema = self.scope_schema(conn, scope).await?;
        let reached = self.base.upgrade_schema(conn, &schema, from).await?;

        // Server artifacts now serve every version up to `reached`
        for mut history in self.scopes.history(conn, &self.base.scope_name).await? {
            let stale = match history.version.as_deref() {
                Some(recorded) => parse_version(recorded)? < reached,
                None => false,
            };
            if stale {
                history.version = Some(reached.to_string());
                self.scopes.save_history(conn, &history).await?;
            }
        }

        if scope.version != reached.to_string() {
            scope.version = reached.to_string();
            self.store_scope(conn, scope).await?;
        }
        Ok(())
    }

    /// Upgrade from the oldest version any client or the server recorded
    pub async fn upgrade(&self) -> Result<ServerScopeInfo> {
        self.base
            .run_in_transaction(SyncStage::Provisioning, None, |conn| async move {
                let conn = conn.as_ref();
                let mut scope = self.load_scope(conn).await?;
                self.upgrade_on(conn, &mut scope).await?;
                Ok(scope)
            })
            .await
    }

    /// Provision the server on first use, migrate when the configured setup
    /// changed and upgrade a stale scope
    pub async fn ensure_schema(&self) -> Result<ServerScopeInfo> {
        self.base
            .run_in_transaction(SyncStage::Provisioning, None, |conn| async move {
                let mut scope = self.load_scope(conn.as_ref()).await?;
                let provisioned = match (&scope.setup, &scope.schema) {
                    (Some(setup), Some(schema)) if schema.has_tables() => Some((setup.clone(), schema.clone())),
                    _ => None,
                };

                match provisioned {
                    None => {
                        self.provision_on(conn.as_ref(), &SyncProvision::server_default(), false)
                            .await?;
                        scope = self.load_scope(conn.as_ref()).await?;
                    }
                    Some((old_setup, old_schema)) if old_setup != self.base.setup => {
                        let (old_setup, old_schema, scope) = (&old_setup, &old_schema, &mut scope);
                        self.base
                            .run_in_transaction(SyncStage::Migrating, Some(conn.clone()), |conn| async move {
                                let conn = conn.as_ref();
                                let new_schema = self.base.read_schema(conn).await?;
                                self.base.migrate_schema(conn, old_setup, old_schema, &new_schema).await?;
                                scope.schema = Some(new_schema);
                                scope.setup = Some(self.base.setup.clone());
                                self.store_scope(conn, scope).await
                            })
                            .await?;
                    }
                    Some(_) => self.upgrade_on(conn.as_ref(), &mut scope).await?,
                }
                Ok(scope)
            })
            .await
    }

    /// Apply the client's changes, then select what the client is missing
    pub async fn apply_then_get_changes(&self, request: ServerSyncRequest) -> Result<ServerSyncChanges> {
        let client = &request.client_scope;
        let reinitialize = request.reinitialize;
        let changes_applied = match &request.batch_info {
            Some(batch) if !batch.parts.is_empty() => {
                let applied = self
                    .base
                    .run_in_transaction(SyncStage::ChangesApplying, None, |conn| async move {
                        let conn = conn.as_ref();
                        let scope = self.load_scope(conn).await?;
                        ensure_not_outdated(client, &scope, reinitialize)?;
                        let schema = self.scope_schema(conn, &scope).await?;
                        let ctx = ApplyContext {
                            side: Side::Server,
                            policy: self.base.options.conflict_resolution_policy,
                            scope_id: client.id,
                            last_timestamp: client.last_server_sync_timestamp,
                            is_new_scope: client.is_new_scope,
                        };
                        self.base.apply_batch(conn, batch, &schema, &ctx).await
                    })
                    .await?;
                if self.base.options.clean_folder && !batch.is_snapshot {
                    if let Err(e) = batch.remove_directory().await {
                        tracing::warn!("Removing batch directory {} failed: {}", batch.directory_path().display(), e);
                    }
                }
                applied
            }
            _ => DatabaseChangesApplied::default(),
        };

        let mut changes = self.select_for_client(&request).await?;
        changes.changes_applied = changes_applied;
        Ok(changes)
    }

    /// Select what a client is missing, without applying anything
    pub async fn get_changes(&self, client: &ClientScopeInfo) -> Result<ServerSyncChanges> {
        self.select_for_client(&ServerSyncRequest::new(client.clone())).await
    }

    async fn select_for_client(&self, request: &ServerSyncRequest) -> Result<ServerSyncChanges> {
        let client = &request.client_scope;
        let parameters = request
            .parameters
            .clone()
            .unwrap_or_else(|| self.base.parameters.clone());
        let is_new = client.is_new_scope || request.reinitialize;
        let snapshot = if is_new { self.get_snapshot(Some(&parameters)).await? } else { None };
        let (p, s) = (&parameters, &snapshot);

        self.base
            .run_in_transaction(SyncStage::ChangesSelecting, None, |conn| async move {
                let conn = conn.as_ref();
                let scope = self.load_scope(conn).await?;
                ensure_not_outdated(client, &scope, request.reinitialize)?;

                let (remote_timestamp, batch_info, changes_selected) = match s {
                    Some(snapshot) => {
                        tracing::info!("Sending snapshot {} to client {}", snapshot.directory_name, client.id);
                        let changes = snapshot_changes(snapshot);
                        (snapshot.timestamp, snapshot.clone(), changes)
                    }
                    None => {
                        let schema = self.scope_schema(conn, &scope).await?;
                        let remote_timestamp = self.scopes.builder().get_local_timestamp(conn).await?;
                        let mut batch = BatchInfo::new(&self.base.options.batch_directory, self.base.serializer.key());
                        batch.timestamp = remote_timestamp;
                        let changes_request = ChangesRequest {
                            scope_id: client.id,
                            is_new,
                            last_timestamp: if is_new { None } else { client.last_server_sync_timestamp },
                            parameters: p.clone(),
                        };
                        let (batch, changes) = self.base.select_changes(conn, &schema, &changes_request, batch).await?;
                        (remote_timestamp, batch, changes)
                    }
                };

                let mut history = self
                    .scopes
                    .history_scope(conn, client.id, &self.base.scope_name)
                    .await?
                    .unwrap_or_else(|| ServerHistoryScopeInfo::new(client.id, self.base.scope_name.clone()));
                history.last_sync_timestamp = Some(remote_timestamp);
                history.last_sync = Some(Utc::now());
                history.last_sync_duration = client.last_sync_duration;
                history.version = Some(client.version.clone());
                self.scopes.save_history(conn, &history).await?;
                self.base.intercept(SyncEvent::ScopeSaved {
                    scope_name: history.name.clone(),
                    scope_type: ScopeType::ServerHistory,
                });

                Ok(ServerSyncChanges {
                    remote_timestamp,
                    batch_info,
                    changes_selected,
                    changes_applied: DatabaseChangesApplied::default(),
                })
            })
            .await
    }

    /// Count what a client is missing without writing a batch
    pub async fn get_estimated_changes_count(&self, client: &ClientScopeInfo) -> Result<DatabaseChangesSelected> {
        self.base
            .run_in_transaction(SyncStage::ChangesSelecting, None, |conn| async move {
                let conn = conn.as_ref();
                let scope = self.load_scope(conn).await?;
                let schema = self.scope_schema(conn, &scope).await?;
                let request = ChangesRequest {
                    scope_id: client.id,
                    is_new: client.is_new_scope,
                    last_timestamp: client.last_server_sync_timestamp,
                    parameters: self.base.parameters.clone(),
                };
                self.base.estimate_changes(conn, &schema, &request).await
            })
            .await
    }

    /// Purge tombstones up to `timestamp` and record the cleanup bound
    ///
    /// By default the bound is the oldest watermark of any client, so no
    /// client becomes outdated.
    pub async fn delete_metadatas(&self, timestamp: Option<i64>) -> Result<DatabaseMetadatasCleaned> {
        self.base
            .run_in_transaction(SyncStage::MetadataCleaning, None, |conn| async move {
                let conn = conn.as_ref();
                let mut scope = self.load_scope(conn).await?;
                let timestamp = match timestamp {
                    Some(timestamp) => Some(timestamp),
                    None => self
                        .scopes
                        .history(conn, &self.base.scope_name)
                        .await?
                        .iter()
                        .filter_map(|h| h.last_sync_timestamp)
                        .min(),
                };
                let Some(timestamp) = timestamp else {
                    tracing::debug!("No client synchronized yet, nothing to clean");
                    return Ok(DatabaseMetadatasCleaned::default());
                };

                let schema = self.scope_schema(conn, &scope).await?;
                let cleaned = self.base.clean_metadatas(conn, &schema, timestamp).await?;
                if timestamp > scope.last_cleanup_timestamp {
                    scope.last_cleanup_timestamp = timestamp;
                    self.store_scope(conn, &scope).await?;
                }
                Ok(cleaned)
            })
            .await
    }

    fn snapshot_location(&self, parameters: &SyncParameters) -> Option<std::path::PathBuf> {
        self.base
            .options
            .snapshots_directory
            .as_deref()
            .map(|root| snapshot_directory(root, &self.base.scope_name, parameters))
    }

    /// Select every row into the snapshot directory of `parameters`
    ///
    /// An existing snapshot for the same parameters is replaced.
    pub async fn create_snapshot(&self, parameters: Option<&SyncParameters>) -> Result<BatchInfo> {
        let parameters = parameters.cloned().unwrap_or_else(|| self.base.parameters.clone());
        let directory = self
            .snapshot_location(&parameters)
            .ok_or_else(|| SyncError::Config("no snapshots directory configured".to_string()))?;
        let (root, name) = match (directory.parent(), directory.file_name()) {
            (Some(root), Some(name)) => (root.to_path_buf(), name.to_string_lossy().to_string()),
            _ => {
                return Err(SyncError::Config(format!(
                    "invalid snapshot directory {}",
                    directory.display()
                )))
            }
        };
        let p = &parameters;

        let batch = self
            .base
            .run_in_transaction(SyncStage::SnapshotCreating, None, |conn| async move {
                let conn = conn.as_ref();
                let scope = self.load_scope(conn).await?;
                let schema = self.scope_schema(conn, &scope).await?;

                let mut batch = BatchInfo::at(root, name, self.base.serializer.key());
                batch.remove_directory().await?;
                batch.timestamp = self.scopes.builder().get_local_timestamp(conn).await?;
                batch.is_snapshot = true;
                let request = ChangesRequest {
                    scope_id: Uuid::nil(),
                    is_new: true,
                    last_timestamp: None,
                    parameters: p.clone(),
                };
                let (batch, _) = self.base.select_changes(conn, &schema, &request, batch).await?;
                Ok(batch)
            })
            .await?;

        tracing::info!(
            "Created snapshot of {} rows in {}",
            batch.rows_count,
            batch.directory_path().display()
        );
        self.base.intercept(SyncEvent::SnapshotCreated {
            directory: batch.directory_path(),
            rows: batch.rows_count,
        });
        Ok(batch)
    }

    /// Snapshot stored for `parameters`, if one was created
    pub async fn get_snapshot(&self, parameters: Option<&SyncParameters>) -> Result<Option<BatchInfo>> {
        let parameters = parameters.cloned().unwrap_or_else(|| self.base.parameters.clone());
        let Some(directory) = self.snapshot_location(&parameters) else {
            return Ok(None);
        };
        if !tokio::fs::try_exists(directory.join(SUMMARY_FILE_NAME)).await? {
            return Ok(None);
        }
        let mut batch = BatchInfo::load(&directory).await?;
        batch.is_snapshot = true;
        Ok(Some(batch))
    }
}
