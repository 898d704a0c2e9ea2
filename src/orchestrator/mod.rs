//! Orchestrators: the façade combining scopes, provisioning, migration,
//! upgrades and change batches for one side of a synchronization
//!
//! [`Orchestrator`] holds what both sides share: the provider, the options,
//! the setup, the interceptors and the transaction helper every operation
//! runs through. [`LocalOrchestrator`] drives a client database and
//! [`RemoteOrchestrator`] a server database.

mod interceptor;
mod local;
mod remote;

pub use interceptor::{EventKind, Interceptors, InterceptorsBuilder, ProgressArgs, SyncEvent};
pub use local::{ClientChanges, LocalOrchestrator};
pub use remote::{RemoteOrchestrator, ServerSyncChanges, ServerSyncRequest};

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::mpsc::UnboundedSender;
use tokio_util::sync::CancellationToken;

use crate::batch::{JsonSerializerFactory, SerializerFactory};
use crate::changes::DatabaseMetadatasCleaned;
use crate::config::SyncOptions;
use crate::error::{Result, SyncError};
use crate::provider::{DbConnection, ProcedureKind, Provider, ScopeBuilder, SyncAdapter};
use crate::schema::{SetupTable, SyncSet, SyncSetup, SyncTable, TableRef};
use crate::scope::DEFAULT_SCOPE_NAME;
use crate::types::{Side, SyncParameters, SyncStage};

/// Resolve a serializer from its configured key
pub fn serializer_for(key: &str) -> Result<Arc<dyn SerializerFactory>> {
    match key.to_ascii_lowercase().as_str() {
        "json" => Ok(Arc::new(JsonSerializerFactory)),
        other => Err(SyncError::Config(format!("unknown serializer '{}'", other))),
    }
}

/// State and helpers shared by both orchestrator kinds
pub struct Orchestrator {
    pub(crate) provider: Arc<dyn Provider>,
    pub(crate) options: SyncOptions,
    pub(crate) setup: SyncSetup,
    pub(crate) scope_name: String,
    pub(crate) side: Side,
    pub(crate) interceptors: Interceptors,
    pub(crate) progress: Option<UnboundedSender<ProgressArgs>>,
    pub(crate) parameters: SyncParameters,
    pub(crate) cancellation: CancellationToken,
    pub(crate) serializer: Arc<dyn SerializerFactory>,
    pub(crate) scope_builder: Arc<dyn ScopeBuilder>,
    stage: Mutex<SyncStage>,
    adapters: DashMap<String, Arc<dyn SyncAdapter>>,
}

impl Orchestrator {
    /// Validate the options and the setup, then build the orchestrator
    pub fn new(provider: Arc<dyn Provider>, setup: SyncSetup, options: SyncOptions, side: Side) -> Result<Self> {
        options.validate()?;
        setup.ensure_valid()?;
        let serializer = serializer_for(&options.serializer)?;
        let scope_builder = provider.scope_builder(&options.scope_info_table_name);

        Ok(Self {
            provider,
            options,
            setup,
            scope_name: DEFAULT_SCOPE_NAME.to_string(),
            side,
            interceptors: Interceptors::default(),
            progress: None,
            parameters: SyncParameters::new(),
            cancellation: CancellationToken::new(),
            serializer,
            scope_builder,
            stage: Mutex::new(SyncStage::None),
            adapters: DashMap::new(),
        })
    }

    pub fn provider(&self) -> &Arc<dyn Provider> {
        &self.provider
    }

    pub fn options(&self) -> &SyncOptions {
        &self.options
    }

    pub fn setup(&self) -> &SyncSetup {
        &self.setup
    }

    pub fn scope_name(&self) -> &str {
        &self.scope_name
    }

    pub fn side(&self) -> Side {
        self.side
    }

    pub fn parameters(&self) -> &SyncParameters {
        &self.parameters
    }

    /// Stage the orchestrator is currently in
    pub fn stage(&self) -> SyncStage {
        *self.stage.lock()
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancellation.clone()
    }

    /// Request cancellation of the running operation
    pub fn cancel(&self) {
        self.cancellation.cancel();
    }

    pub(crate) fn check_cancelled(&self) -> Result<()> {
        if self.cancellation.is_cancelled() {
            Err(SyncError::Cancelled)
        } else {
            Ok(())
        }
    }

    pub(crate) fn set_stage(&self, stage: SyncStage) -> SyncStage {
        std::mem::replace(&mut *self.stage.lock(), stage)
    }

    /// Log an event, run its handlers and report progress
    ///
    /// Returns the event as left by the handlers.
    pub(crate) fn intercept(&self, mut event: SyncEvent) -> SyncEvent {
        tracing::debug!("[{}] {}", self.side, event);
        self.interceptors.dispatch(&mut event);
        if let Some(progress) = &self.progress {
            let args = ProgressArgs {
                stage: self.stage(),
                side: self.side,
                message: event.to_string(),
                timestamp: Utc::now(),
            };
            if progress.send(args).is_err() {
                tracing::debug!("Progress receiver dropped, {:?} not reported", event.kind());
            }
        }
        event
    }

    /// Row commands of a table, cached until the next migration or upgrade
    pub(crate) fn adapter(&self, table: &SyncTable) -> Arc<dyn SyncAdapter> {
        let key = table.full_name().to_lowercase();
        if let Some(adapter) = self.adapters.get(&key) {
            return adapter.value().clone();
        }
        let adapter = self.provider.sync_adapter(table, &self.setup);
        self.adapters.insert(key, adapter.clone());
        adapter
    }

    pub(crate) fn clear_adapters(&self) {
        self.adapters.clear();
    }

    /// Stored procedures a table needs under a setup
    pub(crate) fn procedures_for(&self, table: &SyncTable, setup: &SyncSetup) -> Vec<ProcedureKind> {
        ProcedureKind::required(
            setup.has_filter(&table.table_name, table.schema_name.as_deref()),
            self.provider.supports_bulk_operations(),
        )
    }

    /// Open a connection, retrying transient failures with a linear backoff
    async fn open_connection(&self, conn: &dyn DbConnection) -> Result<()> {
        let mut attempt = 0u32;
        loop {
            match conn.open().await {
                Ok(()) => {
                    self.intercept(SyncEvent::ConnectionOpened);
                    return Ok(());
                }
                Err(e) if attempt < self.options.connection_retry_count && self.provider.should_retry_on(&e) => {
                    attempt += 1;
                    let delay_ms = self
                        .options
                        .connection_retry_delay_ms
                        .saturating_mul(u64::from(attempt));
                    tracing::warn!(
                        "Opening a {} connection failed ({}), retry {} in {} ms",
                        self.provider.provider_type(),
                        e,
                        attempt,
                        delay_ms
                    );
                    self.intercept(SyncEvent::Reconnecting {
                        attempt,
                        delay_ms,
                        error: e.to_string(),
                    });
                    tokio::select! {
                        _ = self.cancellation.cancelled() => return Err(SyncError::Cancelled),
                        _ = tokio::time::sleep(Duration::from_millis(delay_ms)) => {}
                    }
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Run `operation` inside a transaction at `stage`
    ///
    /// A caller supplied connection is reused: it is only opened, begun,
    /// committed or closed here when it was not already open or inside a
    /// transaction. Errors are tagged with the stage and this side.
    pub async fn run_in_transaction<T, F, Fut>(
        &self,
        stage: SyncStage,
        connection: Option<Arc<dyn DbConnection>>,
        operation: F,
    ) -> Result<T>
    where
        F: FnOnce(Arc<dyn DbConnection>) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let previous = self.set_stage(stage);
        // Errors are reported while the failing stage is still current
        let result = self.transaction_scope(connection, operation).await.map_err(|e| {
            if e.stage().is_some() {
                return e;
            }
            tracing::error!("Sync failed while {} on the {} side: {}", stage, self.side, e);
            self.intercept(SyncEvent::Error {
                stage,
                message: e.to_string(),
            });
            e.at_stage(stage, self.side)
        });
        self.set_stage(previous);
        result
    }

    async fn transaction_scope<T, F, Fut>(&self, connection: Option<Arc<dyn DbConnection>>, operation: F) -> Result<T>
    where
        F: FnOnce(Arc<dyn DbConnection>) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.check_cancelled()?;
        let conn = connection.unwrap_or_else(|| self.provider.create_connection());

        let opened_here = !conn.is_open();
        if opened_here {
            self.open_connection(conn.as_ref()).await?;
        }

        let began_here = !conn.in_transaction();
        if began_here {
            if let Err(e) = conn.begin(self.provider.isolation_level()).await {
                if opened_here {
                    if let Err(close) = conn.close().await {
                        tracing::warn!("Closing the connection failed: {}", close);
                    }
                }
                return Err(e);
            }
            self.intercept(SyncEvent::TransactionOpened);
        }

        let result = operation(conn.clone()).await;

        let result = match result {
            Ok(value) if began_here => match conn.commit().await {
                Ok(()) => {
                    self.intercept(SyncEvent::TransactionCommitted);
                    Ok(value)
                }
                Err(e) => Err(e),
            },
            Ok(value) => Ok(value),
            Err(e) => {
                if began_here {
                    if let Err(rollback) = conn.rollback().await {
                        tracing::warn!("Rollback failed: {}", rollback);
                    }
                }
                Err(e)
            }
        };

        if opened_here {
            if let Err(e) = conn.close().await {
                tracing::warn!("Closing the connection failed: {}", e);
            }
            self.intercept(SyncEvent::ConnectionClosed);
        }
        result
    }

    /// Read the declared tables from the database
    ///
    /// Columns are restricted to the ones the setup lists (primary keys are
    /// always kept) and relations to parents outside the set are dropped.
    pub(crate) async fn read_schema(&self, conn: &dyn DbConnection) -> Result<SyncSet> {
        let builder = self.provider.database_builder();
        builder.ensure_database(conn).await?;

        let mut schema = SyncSet::new();
        let mut relations = Vec::new();
        for setup_table in &self.setup.tables {
            let schema_name = setup_table.schema_name.as_deref();
            let table = builder
                .get_table(conn, &setup_table.table_name, schema_name)
                .await?
                .ok_or_else(|| {
                    SyncError::MissingTable(
                        TableRef::new(setup_table.table_name.clone(), setup_table.schema_name.clone()).to_string(),
                    )
                })?;
            let table = restrict_to_setup(table, setup_table)?;
            table.ensure_provisionable()?;

            relations.extend(builder.get_relations(conn, &setup_table.table_name, schema_name).await?);
            schema.tables.push(table);
        }

        relations.retain(|relation| {
            schema.table_by_ref(&relation.parent).is_some() && schema.table_by_ref(&relation.child).is_some()
        });
        schema.relations = relations;

        self.intercept(SyncEvent::SchemaLoaded {
            tables: schema.tables.len(),
        });
        Ok(schema)
    }
}

impl Orchestrator {
    /// Purge tombstone metadata up to `timestamp` from every table
    pub(crate) async fn clean_metadatas(
        &self,
        conn: &dyn DbConnection,
        schema: &SyncSet,
        timestamp: i64,
    ) -> Result<DatabaseMetadatasCleaned> {
        let mut cleaned = DatabaseMetadatasCleaned {
            timestamp,
            tables: Vec::new(),
        };
        for table in schema.reverse_dependency_order() {
            self.check_cancelled()?;
            let rows = self.adapter(table).delete_metadata(conn, timestamp).await?;
            if rows > 0 {
                cleaned.tables.push((table.table_ref(), rows));
            }
        }

        tracing::info!(
            "Cleaned {} metadata rows up to {} on the {} side",
            cleaned.rows_cleaned(),
            timestamp,
            self.side
        );
        self.intercept(SyncEvent::MetadataCleaned {
            timestamp,
            rows_cleaned: cleaned.rows_cleaned(),
        });
        Ok(cleaned)
    }
}

fn restrict_to_setup(mut table: SyncTable, setup_table: &SetupTable) -> Result<SyncTable> {
    table.sync_direction = setup_table.sync_direction;
    if setup_table.columns.is_empty() {
        return Ok(table);
    }
    for column in &setup_table.columns {
        if !table.has_column(column) {
            return Err(SyncError::MissingColumn {
                table: table.full_name(),
                column: column.clone(),
            });
        }
    }
    let primary_keys = table.primary_keys.clone();
    table.columns.retain(|c| {
        setup_table.columns.iter().any(|name| name.eq_ignore_ascii_case(&c.name))
            || primary_keys.iter().any(|key| key.eq_ignore_ascii_case(&c.name))
    });
    Ok(table)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::memory::InMemoryProvider;
    use crate::schema::tests::customer_table;
    use crate::schema::SyncColumn;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn orchestrator(provider: &InMemoryProvider, setup: SyncSetup) -> Orchestrator {
        let options = SyncOptions::default().with_connection_retry_delay_ms(1);
        Orchestrator::new(Arc::new(provider.clone()), setup, options, Side::Client).unwrap()
    }

    #[test]
    fn test_unknown_serializer_is_rejected() {
        let mut options = SyncOptions::default();
        options.serializer = "msgpack".to_string();
        let result = Orchestrator::new(
            Arc::new(InMemoryProvider::new()),
            SyncSetup::new(["Customer"]),
            options,
            Side::Client,
        );
        assert!(matches!(result, Err(SyncError::Config(_))));
    }

    #[test]
    fn test_empty_setup_is_rejected() {
        let result = Orchestrator::new(
            Arc::new(InMemoryProvider::new()),
            SyncSetup::default(),
            SyncOptions::default(),
            Side::Client,
        );
        assert!(matches!(result, Err(SyncError::MissingTables)));
    }

    #[tokio::test]
    async fn test_transaction_commits_and_restores_stage() {
        let provider = InMemoryProvider::new();
        let orchestrator = orchestrator(&provider, SyncSetup::new(["Customer"]));
        let (p, o) = (&provider, &orchestrator);

        let stage = orchestrator
            .run_in_transaction(SyncStage::Provisioning, None, |conn| async move {
                p.create_table(customer_table());
                assert!(conn.in_transaction());
                Ok(o.stage())
            })
            .await
            .unwrap();

        assert_eq!(stage, SyncStage::Provisioning);
        assert_eq!(orchestrator.stage(), SyncStage::None);
        assert!(provider.has_table("Customer"));
    }

    #[tokio::test]
    async fn test_failed_operation_rolls_back_and_is_tagged() {
        let provider = InMemoryProvider::new();
        let orchestrator = orchestrator(&provider, SyncSetup::new(["Customer"]));
        let p = &provider;

        let err = orchestrator
            .run_in_transaction(SyncStage::ChangesApplying, None, |_conn| async move {
                p.create_table(customer_table());
                Err::<(), _>(SyncError::Provider("boom".to_string()))
            })
            .await
            .unwrap_err();

        assert_eq!(err.stage(), Some(SyncStage::ChangesApplying));
        assert!(!provider.has_table("Customer"));
    }

    #[tokio::test]
    async fn test_error_progress_carries_failing_stage() {
        let provider = InMemoryProvider::new();
        let mut orchestrator = orchestrator(&provider, SyncSetup::new(["Customer"]));
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        orchestrator.progress = Some(tx);

        orchestrator
            .run_in_transaction(SyncStage::ChangesApplying, None, |_conn| async move {
                Err::<(), _>(SyncError::Provider("boom".to_string()))
            })
            .await
            .unwrap_err();
        assert_eq!(orchestrator.stage(), SyncStage::None);

        let mut reports = Vec::new();
        while let Ok(args) = rx.try_recv() {
            reports.push(args);
        }
        let error = reports.last().unwrap();
        assert!(error.message.contains("boom"), "{}", error.message);
        assert_eq!(error.stage, SyncStage::ChangesApplying);

        // Nobody listening is not an error
        drop(rx);
        orchestrator
            .run_in_transaction(SyncStage::ScopeLoading, None, |_| async { Ok(()) })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_caller_connection_is_reused_untouched() {
        let provider = InMemoryProvider::new();
        let orchestrator = orchestrator(&provider, SyncSetup::new(["Customer"]));
        let conn = provider.create_connection();
        conn.open().await.unwrap();
        conn.begin(Default::default()).await.unwrap();

        orchestrator
            .run_in_transaction(SyncStage::ScopeLoading, Some(conn.clone()), |_| async { Ok(()) })
            .await
            .unwrap();

        assert!(conn.is_open());
        assert!(conn.in_transaction());
    }

    #[tokio::test]
    async fn test_open_is_retried_on_transient_errors() {
        let provider = InMemoryProvider::new();
        let reconnects = Arc::new(AtomicUsize::new(0));
        let counter = reconnects.clone();
        let mut orchestrator = orchestrator(&provider, SyncSetup::new(["Customer"]));
        orchestrator.interceptors = Interceptors::builder()
            .on(EventKind::Reconnecting, move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
            })
            .build();

        provider.fail_next_opens(2, true);
        orchestrator
            .run_in_transaction(SyncStage::ScopeLoading, None, |_| async { Ok(()) })
            .await
            .unwrap();
        assert_eq!(reconnects.load(Ordering::SeqCst), 2);

        provider.fail_next_opens(5, true);
        let err = orchestrator
            .run_in_transaction(SyncStage::ScopeLoading, None, |_| async { Ok(()) })
            .await
            .unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(reconnects.load(Ordering::SeqCst), 5);
    }

    #[tokio::test]
    async fn test_fatal_open_error_is_not_retried() {
        let provider = InMemoryProvider::new();
        let orchestrator = orchestrator(&provider, SyncSetup::new(["Customer"]));
        provider.fail_next_opens(1, false);

        let err = orchestrator
            .run_in_transaction(SyncStage::ScopeLoading, None, |_| async { Ok(()) })
            .await
            .unwrap_err();
        assert!(matches!(err.root(), SyncError::Provider(_)));
    }

    #[tokio::test]
    async fn test_cancelled_before_start() {
        let provider = InMemoryProvider::new();
        let orchestrator = orchestrator(&provider, SyncSetup::new(["Customer"]));
        orchestrator.cancel();

        let err = orchestrator
            .run_in_transaction(SyncStage::ChangesSelecting, None, |_| async { Ok(()) })
            .await
            .unwrap_err();
        assert!(matches!(err.root(), SyncError::Cancelled));
    }

    #[tokio::test]
    async fn test_read_schema_restricts_columns() {
        let provider = InMemoryProvider::new();
        provider.create_table(
            customer_table().with_column(SyncColumn::new("Email", "text").nullable()),
        );
        let setup = SyncSetup::new([SetupTable::new("Customer").with_columns(["Name"])]);
        let orchestrator = orchestrator(&provider, setup);
        let o = &orchestrator;

        let schema = orchestrator
            .run_in_transaction(SyncStage::SchemaReading, None, |conn| async move {
                o.read_schema(conn.as_ref()).await
            })
            .await
            .unwrap();

        let names: Vec<&str> = schema.tables[0].columns.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["Id", "Name"]);
    }

    #[tokio::test]
    async fn test_read_schema_missing_table_and_column() {
        let provider = InMemoryProvider::new();
        provider.create_table(customer_table());

        let orchestrator = orchestrator(&provider, SyncSetup::new(["Product"]));
        let o = &orchestrator;
        let err = orchestrator
            .run_in_transaction(SyncStage::SchemaReading, None, |conn| async move {
                o.read_schema(conn.as_ref()).await
            })
            .await
            .unwrap_err();
        assert!(matches!(err.root(), SyncError::MissingTable(_)));

        let setup = SyncSetup::new([SetupTable::new("Customer").with_columns(["Phone"])]);
        let orchestrator = self::orchestrator(&provider, setup);
        let o = &orchestrator;
        let err = orchestrator
            .run_in_transaction(SyncStage::SchemaReading, None, |conn| async move {
                o.read_schema(conn.as_ref()).await
            })
            .await
            .unwrap_err();
        assert!(matches!(err.root(), SyncError::MissingColumn { .. }));
    }
}
