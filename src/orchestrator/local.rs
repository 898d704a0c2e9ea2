//! Client side orchestrator

use std::sync::Arc;

use chrono::Utc;
use tokio::sync::mpsc::UnboundedSender;
use tokio_util::sync::CancellationToken;

use super::remote::ServerSyncChanges;
use super::{Interceptors, Orchestrator, ProgressArgs, SyncEvent};
use crate::batch::{BatchInfo, SerializerFactory};
use crate::changes::{ChangesRequest, DatabaseChangesApplied, DatabaseChangesSelected, DatabaseMetadatasCleaned};
use crate::config::SyncOptions;
use crate::error::{Result, SyncError};
use crate::migration::MigrationPlan;
use crate::provider::{ApplyContext, DbConnection, Provider};
use crate::provision::{Provision, SyncProvision};
use crate::schema::{SyncSet, SyncSetup};
use crate::scope::{is_outdated, ClientScopeInfo, ClientScopeStore, OutdatedAction, ServerScopeInfo};
use crate::types::{ScopeType, Side, SyncParameters, SyncStage};
use crate::upgrade::{self, parse_version};

/// Changes selected on the client for upload
#[derive(Debug, Clone, PartialEq)]
pub struct ClientChanges {
    /// Local clock read before the selection started
    pub timestamp: i64,
    pub batch_info: BatchInfo,
    pub changes_selected: DatabaseChangesSelected,
}

/// Orchestrator of a client database
pub struct LocalOrchestrator {
    base: Orchestrator,
    scopes: ClientScopeStore,
}

impl LocalOrchestrator {
    pub fn new(provider: Arc<dyn Provider>, setup: SyncSetup, options: SyncOptions) -> Result<Self> {
        let base = Orchestrator::new(provider, setup, options, Side::Client)?;
        let scopes = ClientScopeStore::new(base.scope_builder.clone());
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

    /// Filter parameters sent with every selection
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

    pub fn begin_session(&self) -> Result<()> {
        self.base.check_cancelled()?;
        self.base.set_stage(SyncStage::BeginSession);
        tracing::info!("Session begins on scope {}", self.base.scope_name);
        self.base.intercept(SyncEvent::SessionBegin {
            scope_name: self.base.scope_name.clone(),
        });
        Ok(())
    }

    pub fn end_session(&self) -> Result<()> {
        self.base.set_stage(SyncStage::EndSession);
        tracing::info!("Session ends on scope {}", self.base.scope_name);
        self.base.intercept(SyncEvent::SessionEnd {
            scope_name: self.base.scope_name.clone(),
        });
        self.base.set_stage(SyncStage::None);
        Ok(())
    }

    async fn load_scope(&self, conn: &dyn DbConnection) -> Result<ClientScopeInfo> {
        let scope = self.scopes.get_or_create(conn, &self.base.scope_name).await?;
        self.base.intercept(SyncEvent::ScopeLoaded {
            scope_name: scope.name.clone(),
            scope_type: ScopeType::Client,
            is_new: scope.is_new_scope,
        });
        Ok(scope)
    }

    async fn store_scope(&self, conn: &dyn DbConnection, scope: &ClientScopeInfo) -> Result<()> {
        self.scopes.save(conn, scope).await?;
        self.base.intercept(SyncEvent::ScopeSaved {
            scope_name: scope.name.clone(),
            scope_type: ScopeType::Client,
        });
        Ok(())
    }

    /// Load the client scope, creating it on first access
    pub async fn get_client_scope(&self) -> Result<ClientScopeInfo> {
        self.base
            .run_in_transaction(SyncStage::ScopeLoading, None, |conn| async move {
                self.load_scope(conn.as_ref()).await
            })
            .await
    }

    pub async fn save_client_scope(&self, scope: &ClientScopeInfo) -> Result<()> {
        self.base
            .run_in_transaction(SyncStage::ScopeLoading, None, |conn| async move {
                self.store_scope(conn.as_ref(), scope).await
            })
            .await
    }

    /// Read the setup's tables from the client database
    pub async fn get_schema(&self) -> Result<SyncSet> {
        self.base
            .run_in_transaction(SyncStage::SchemaReading, None, |conn| async move {
                self.base.read_schema(conn.as_ref()).await
            })
            .await
    }

    /// Stored schema of the scope, or the one read from the database
    async fn scope_schema(&self, conn: &dyn DbConnection, scope: &ClientScopeInfo) -> Result<SyncSet> {
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
        schema: Option<&SyncSet>,
    ) -> Result<SyncSet> {
        let schema = match schema {
            Some(schema) => schema.clone(),
            None => self.base.read_schema(conn).await?,
        };
        self.base.provision_schema(conn, &schema, provision, overwrite).await?;

        let name = &self.base.scope_name;
        let scope = match self.scopes.get(conn, name).await? {
            Some(scope) => Some(scope),
            None if provision.contains(Provision::ClientScope) => Some(ClientScopeInfo::new(name.clone())),
            None => None,
        };
        if let Some(mut scope) = scope {
            scope.schema = Some(schema.clone());
            scope.setup = Some(self.base.setup.clone());
            self.store_scope(conn, &scope).await?;
        }
        Ok(schema)
    }

    /// Create the requested artifacts
    ///
    /// Without a schema the tables are read from the client database, which
    /// then must already hold them. The schema and setup are saved in the
    /// client scope.
    pub async fn provision(
        &self,
        provision: &SyncProvision,
        overwrite: bool,
        schema: Option<&SyncSet>,
    ) -> Result<SyncSet> {
        self.base
            .run_in_transaction(SyncStage::Provisioning, None, |conn| async move {
                self.provision_on(conn.as_ref(), provision, overwrite, schema).await
            })
            .await
    }

    /// Drop the requested artifacts, named after the setup they were created with
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

    async fn migrate_on(
        &self,
        conn: &dyn DbConnection,
        scope: &mut ClientScopeInfo,
        old_setup: &SyncSetup,
        old_schema: &SyncSet,
        new_schema: &SyncSet,
    ) -> Result<MigrationPlan> {
        let plan = self.base.migrate_schema(conn, old_setup, old_schema, new_schema).await?;
        scope.schema = Some(new_schema.clone());
        scope.setup = Some(self.base.setup.clone());
        self.store_scope(conn, scope).await?;
        Ok(plan)
    }

    /// Move the client from `old_setup`/`old_schema` to the configured setup
    /// and `new_schema`
    pub async fn migrate(&self, old_setup: &SyncSetup, old_schema: &SyncSet, new_schema: &SyncSet) -> Result<MigrationPlan> {
        self.base
            .run_in_transaction(SyncStage::Migrating, None, |conn| async move {
                let conn = conn.as_ref();
                let mut scope = self.load_scope(conn).await?;
                self.migrate_on(conn, &mut scope, old_setup, old_schema, new_schema).await
            })
            .await
    }

    pub fn needs_upgrade(&self, scope: &ClientScopeInfo) -> Result<bool> {
        Ok(upgrade::needs_upgrade(parse_version(&scope.version)?))
    }

    async fn upgrade_on(&self, conn: &dyn DbConnection, scope: &mut ClientScopeInfo) -> Result<()> {
        let from = parse_version(&scope.version)?;
        let schema = self.scope_schema(conn, scope).await?;
        let reached = self.base.upgrade_schema(conn, &schema, from).await?;
        if reached != from {
            scope.version = reached.to_string();
            self.store_scope(conn, scope).await?;
        }
        Ok(())
    }

    /// Bring the client scope up to the current version
    pub async fn upgrade(&self) -> Result<ClientScopeInfo> {
        self.base
            .run_in_transaction(SyncStage::Provisioning, None, |conn| async move {
                let conn = conn.as_ref();
                let mut scope = self.load_scope(conn).await?;
                self.upgrade_on(conn, &mut scope).await?;
                Ok(scope)
            })
            .await
    }

    /// Make the client match the server: provision a new client, migrate
    /// when the setup drifted, upgrade a stale scope
    pub async fn ensure_schema(&self, scope: &ClientScopeInfo, server: &ServerScopeInfo) -> Result<ClientScopeInfo> {
        let server_schema = server
            .schema
            .as_ref()
            .filter(|s| s.has_tables())
            .ok_or_else(|| SyncError::InvalidProvision {
                side: Side::Server,
                detail: format!("server scope {} is not provisioned", server.name),
            })?;

        self.base
            .run_in_transaction(SyncStage::Provisioning, None, |conn| async move {
                let mut scope = scope.clone();
                let provisioned = match (&scope.setup, &scope.schema) {
                    (Some(setup), Some(schema)) if schema.has_tables() => Some((setup.clone(), schema.clone())),
                    _ => None,
                };

                match provisioned {
                    None => {
                        let provision = SyncProvision::client_default();
                        let schema = self
                            .provision_on(conn.as_ref(), &provision, false, Some(server_schema))
                            .await?;
                        scope.schema = Some(schema);
                        scope.setup = Some(self.base.setup.clone());
                    }
                    Some((old_setup, old_schema)) if old_setup != self.base.setup || old_schema != *server_schema => {
                        let (old_setup, old_schema, scope) = (&old_setup, &old_schema, &mut scope);
                        self.base
                            .run_in_transaction(SyncStage::Migrating, Some(conn.clone()), |conn| async move {
                                self.migrate_on(conn.as_ref(), scope, old_setup, old_schema, server_schema)
                                    .await
                            })
                            .await?;
                    }
                    Some(_) => {
                        if self.needs_upgrade(&scope)? {
                            self.upgrade_on(conn.as_ref(), &mut scope).await?;
                        }
                    }
                }
                Ok(scope)
            })
            .await
    }

    fn changes_request(&self, scope: &ClientScopeInfo) -> ChangesRequest {
        ChangesRequest {
            scope_id: scope.id,
            is_new: scope.is_new_scope,
            last_timestamp: scope.last_sync_timestamp,
            parameters: self.base.parameters.clone(),
        }
    }

    /// Select the local changes made since the scope's last sync
    pub async fn get_changes(&self, scope: &ClientScopeInfo) -> Result<ClientChanges> {
        self.base
            .run_in_transaction(SyncStage::ChangesSelecting, None, |conn| async move {
                let conn = conn.as_ref();
                let schema = self.scope_schema(conn, scope).await?;
                let timestamp = self.scopes.builder().get_local_timestamp(conn).await?;

                let mut batch = BatchInfo::new(&self.base.options.batch_directory, self.base.serializer.key());
                batch.timestamp = timestamp;
                let request = self.changes_request(scope);
                let (batch_info, changes_selected) = self.base.select_changes(conn, &schema, &request, batch).await?;
                Ok(ClientChanges {
                    timestamp,
                    batch_info,
                    changes_selected,
                })
            })
            .await
    }

    /// Count the local changes without writing a batch
    pub async fn get_estimated_changes_count(&self, scope: &ClientScopeInfo) -> Result<DatabaseChangesSelected> {
        self.base
            .run_in_transaction(SyncStage::ChangesSelecting, None, |conn| async move {
                let conn = conn.as_ref();
                let schema = self.scope_schema(conn, scope).await?;
                self.base.estimate_changes(conn, &schema, &self.changes_request(scope)).await
            })
            .await
    }

    /// Decide what to do with an outdated client
    ///
    /// Returns `None` when the client is up to date. Handlers of
    /// [`SyncEvent::OutdatedScope`] may change the default `Rollback`,
    /// which fails with [`SyncError::OutOfDate`].
    pub fn check_outdated(&self, client: &ClientScopeInfo, server: &ServerScopeInfo) -> Result<Option<OutdatedAction>> {
        if !is_outdated(client, server) {
            return Ok(None);
        }

        let event = self.base.intercept(SyncEvent::OutdatedScope {
            client_timestamp: client.last_server_sync_timestamp,
            cleanup_timestamp: server.last_cleanup_timestamp,
            action: OutdatedAction::default(),
        });
        let action = match event {
            SyncEvent::OutdatedScope { action, .. } => action,
            _ => OutdatedAction::default(),
        };

        tracing::warn!(
            "Scope {} is outdated (last server sync {:?}, server cleaned up to {}), action {:?}",
            client.name,
            client.last_server_sync_timestamp,
            server.last_cleanup_timestamp,
            action
        );
        match action {
            OutdatedAction::Rollback => Err(SyncError::OutOfDate {
                client_timestamp: client.last_server_sync_timestamp.unwrap_or(0),
                cleanup_timestamp: server.last_cleanup_timestamp,
            }
            .at_stage(self.base.stage(), Side::Client)),
            other => Ok(Some(other)),
        }
    }

    async fn apply_in_stage(
        &self,
        stage: SyncStage,
        scope: &ClientScopeInfo,
        batch: &BatchInfo,
        remote_timestamp: i64,
        uploaded: Option<&ClientChanges>,
        reinitialize: bool,
    ) -> Result<(ClientScopeInfo, DatabaseChangesApplied)> {
        let result = self
            .base
            .run_in_transaction(stage, None, |conn| async move {
                let conn = conn.as_ref();
                let schema = self.scope_schema(conn, scope).await?;
                let local_timestamp = match uploaded {
                    Some(changes) => changes.timestamp,
                    None => self.scopes.builder().get_local_timestamp(conn).await?,
                };

                if reinitialize {
                    self.base.reset_tables(conn, &schema).await?;
                }

                let ctx = ApplyContext {
                    side: Side::Client,
                    policy: self.base.options.conflict_resolution_policy,
                    scope_id: scope.id,
                    last_timestamp: uploaded.map(|c| c.timestamp).or(scope.last_sync_timestamp),
                    is_new_scope: scope.is_new_scope || reinitialize,
                };
                let applied = self.base.apply_batch(conn, batch, &schema, &ctx).await?;

                let mut scope = scope.clone();
                scope.is_new_scope = false;
                scope.last_server_sync_timestamp = Some(remote_timestamp);
                scope.last_sync_timestamp = Some(
                    scope
                        .last_sync_timestamp
                        .map_or(local_timestamp, |last| last.max(local_timestamp)),
                );
                scope.last_sync = Some(Utc::now());
                self.store_scope(conn, &scope).await?;
                Ok((scope, applied))
            })
            .await?;

        if self.base.options.clean_folder && !batch.is_snapshot {
            if let Err(e) = batch.remove_directory().await {
                tracing::warn!("Removing batch directory {} failed: {}", batch.directory_path().display(), e);
            }
        }
        Ok(result)
    }

    /// Apply what the server sent back and advance the scope watermarks
    ///
    /// `uploaded` are the changes this session sent, their timestamp
    /// becomes the new local watermark.
    pub async fn apply_changes(
        &self,
        scope: &ClientScopeInfo,
        server: &ServerSyncChanges,
        uploaded: Option<&ClientChanges>,
        reinitialize: bool,
    ) -> Result<(ClientScopeInfo, DatabaseChangesApplied)> {
        self.apply_in_stage(
            SyncStage::ChangesApplying,
            scope,
            &server.batch_info,
            server.remote_timestamp,
            uploaded,
            reinitialize,
        )
        .await
    }

    /// Apply a server snapshot to a client, replacing its rows
    pub async fn apply_snapshot(
        &self,
        scope: &ClientScopeInfo,
        snapshot: &BatchInfo,
    ) -> Result<(ClientScopeInfo, DatabaseChangesApplied)> {
        let (scope, applied) = self
            .apply_in_stage(SyncStage::SnapshotApplying, scope, snapshot, snapshot.timestamp, None, true)
            .await?;
        self.base.intercept(SyncEvent::SnapshotApplied {
            rows: applied.total_applied(),
        });
        Ok((scope, applied))
    }

    /// Purge local tombstones up to `timestamp`, by default the last
    /// uploaded watermark
    pub async fn delete_metadatas(&self, timestamp: Option<i64>) -> Result<DatabaseMetadatasCleaned> {
        self.base
            .run_in_transaction(SyncStage::MetadataCleaning, None, |conn| async move {
                let conn = conn.as_ref();
                let scope = self.load_scope(conn).await?;
                let Some(timestamp) = timestamp.or(scope.last_sync_timestamp) else {
                    return Ok(DatabaseMetadatasCleaned::default());
                };
                let schema = self.scope_schema(conn, &scope).await?;
                self.base.clean_metadatas(conn, &schema, timestamp).await
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::orchestrator::EventKind;
    use crate::provider::memory::InMemoryProvider;
    use crate::schema::tests::customer_table;
    use serde_json::json;

    fn local(provider: &InMemoryProvider, dir: &std::path::Path) -> LocalOrchestrator {
        let options = SyncOptions::default().with_batch_directory(dir);
        LocalOrchestrator::new(Arc::new(provider.clone()), SyncSetup::new(["Customer"]), options).unwrap()
    }

    async fn provisioned(provider: &InMemoryProvider, dir: &std::path::Path) -> LocalOrchestrator {
        let orchestrator = local(provider, dir);
        let schema = SyncSet::new().with_table(customer_table());
        orchestrator
            .provision(&SyncProvision::client_default(), false, Some(&schema))
            .await
            .unwrap();
        orchestrator
    }

    #[tokio::test]
    async fn test_scope_is_created_once() {
        let provider = InMemoryProvider::new();
        let dir = tempfile::tempdir().unwrap();
        let orchestrator = local(&provider, dir.path());

        let first = orchestrator.get_client_scope().await.unwrap();
        let second = orchestrator.get_client_scope().await.unwrap();
        assert_eq!(first.id, second.id);
        assert!(first.is_new_scope);
    }

    #[tokio::test]
    async fn test_provision_saves_schema_and_setup() {
        let provider = InMemoryProvider::new();
        let dir = tempfile::tempdir().unwrap();
        let orchestrator = provisioned(&provider, dir.path()).await;

        let scope = orchestrator.get_client_scope().await.unwrap();
        assert!(scope.is_provisioned());
        assert_eq!(scope.setup.as_ref(), Some(orchestrator.base().setup()));
        assert!(provider.has_artifact("tracking_table:Customer_tracking"));
    }

    #[tokio::test]
    async fn test_server_provision_is_rejected() {
        let provider = InMemoryProvider::new();
        let dir = tempfile::tempdir().unwrap();
        let orchestrator = local(&provider, dir.path());
        let schema = SyncSet::new().with_table(customer_table());

        let err = orchestrator
            .provision(&SyncProvision::server_default(), false, Some(&schema))
            .await
            .unwrap_err();
        assert!(matches!(err.root(), SyncError::InvalidProvision { .. }));
        assert!(err.is_configuration());
    }

    #[tokio::test]
    async fn test_get_changes_then_incremental() {
        let provider = InMemoryProvider::new();
        let dir = tempfile::tempdir().unwrap();
        let orchestrator = provisioned(&provider, dir.path()).await;
        for (id, name) in [(1, "Ada"), (2, "Grace"), (3, "Linus")] {
            provider.upsert_row("Customer", json!({"Id": id, "Name": name})).unwrap();
        }

        let mut scope = orchestrator.get_client_scope().await.unwrap();
        let first = orchestrator.get_changes(&scope).await.unwrap();
        assert_eq!(first.batch_info.rows_count, 3);
        assert_eq!(first.changes_selected.total_upserts(), 3);

        provider.delete_row("Customer", json!({"Id": 2})).unwrap();
        scope.is_new_scope = false;
        scope.last_sync_timestamp = Some(first.timestamp);
        let second = orchestrator.get_changes(&scope).await.unwrap();
        assert_eq!(second.changes_selected.total_deletes(), 1);
        assert_eq!(second.changes_selected.total_upserts(), 0);
        assert!(second.timestamp > first.timestamp);

        let estimate = orchestrator.get_estimated_changes_count(&scope).await.unwrap();
        assert_eq!(estimate, second.changes_selected);
    }

    #[tokio::test]
    async fn test_outdated_rollback_and_override() {
        let provider = InMemoryProvider::new();
        let dir = tempfile::tempdir().unwrap();
        let mut client = ClientScopeInfo::new("DefaultScope");
        client.is_new_scope = false;
        client.last_server_sync_timestamp = Some(10);
        let mut server = ServerScopeInfo::new("DefaultScope");
        server.last_cleanup_timestamp = 20;

        let orchestrator = local(&provider, dir.path());
        let err = orchestrator.check_outdated(&client, &server).unwrap_err();
        assert!(matches!(
            err.root(),
            SyncError::OutOfDate {
                client_timestamp: 10,
                cleanup_timestamp: 20
            }
        ));

        let interceptors = Interceptors::builder()
            .on(EventKind::OutdatedScope, |event| {
                if let SyncEvent::OutdatedScope { action, .. } = event {
                    *action = OutdatedAction::Reinitialize;
                }
            })
            .build();
        let orchestrator = local(&provider, dir.path()).with_interceptors(interceptors);
        assert_eq!(
            orchestrator.check_outdated(&client, &server).unwrap(),
            Some(OutdatedAction::Reinitialize)
        );

        client.last_server_sync_timestamp = Some(25);
        assert_eq!(orchestrator.check_outdated(&client, &server).unwrap(), None);
    }

    #[tokio::test]
    async fn test_upgrade_persists_only_changes() {
        let provider = InMemoryProvider::new();
        let dir = tempfile::tempdir().unwrap();
        let orchestrator = provisioned(&provider, dir.path()).await;

        let mut scope = orchestrator.get_client_scope().await.unwrap();
        assert!(!orchestrator.needs_upgrade(&scope).unwrap());
        scope.version = "0.7.0".to_string();
        orchestrator.save_client_scope(&scope).await.unwrap();
        assert!(orchestrator.needs_upgrade(&scope).unwrap());

        let upgraded = orchestrator.upgrade().await.unwrap();
        assert_eq!(upgraded.version, crate::upgrade::CURRENT_VERSION.to_string());
        assert_eq!(orchestrator.get_client_scope().await.unwrap().version, upgraded.version);

        scope.version = "seven".to_string();
        assert!(matches!(orchestrator.needs_upgrade(&scope), Err(SyncError::InvalidVersion(_))));
    }

    #[tokio::test]
    async fn test_session_stages() {
        let provider = InMemoryProvider::new();
        let dir = tempfile::tempdir().unwrap();
        let orchestrator = local(&provider, dir.path());

        orchestrator.begin_session().unwrap();
        assert_eq!(orchestrator.base().stage(), SyncStage::BeginSession);
        orchestrator.get_client_scope().await.unwrap();
        assert_eq!(orchestrator.base().stage(), SyncStage::BeginSession);
        orchestrator.end_session().unwrap();
        assert_eq!(orchestrator.base().stage(), SyncStage::None);
    }

    #[tokio::test]
    async fn test_delete_metadatas_purges_uploaded_tombstones() {
        let provider = InMemoryProvider::new();
        let dir = tempfile::tempdir().unwrap();
        let orchestrator = provisioned(&provider, dir.path()).await;
        provider.upsert_row("Customer", json!({"Id": 1, "Name": "Ada"})).unwrap();
        provider.delete_row("Customer", json!({"Id": 1})).unwrap();

        let nothing = orchestrator.delete_metadatas(None).await.unwrap();
        assert_eq!(nothing.rows_cleaned(), 0);

        let cleaned = orchestrator.delete_metadatas(Some(provider.timestamp())).await.unwrap();
        assert_eq!(cleaned.rows_cleaned(), 1);
        assert_eq!(provider.tombstone_count("Customer"), 0);
    }
}
