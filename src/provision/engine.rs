//! Creating and dropping synchronization artifacts
//!
//! Artifacts are created parents first and dropped children first. Every
//! DDL call is preceded by an existence check, so provisioning twice is a
//! no-op.

use super::{Provision, SyncProvision};
use crate::error::{Result, SyncError};
use crate::orchestrator::{Orchestrator, SyncEvent};
use crate::provider::{DbArtifact, DbConnection, ProcedureKind, TableBuilder, TriggerKind};
use crate::schema::{SyncSet, SyncSetup, SyncTable};
use crate::types::{ScopeType, Side};

/// Fail unless the provision set suits the side
pub(crate) fn validate_provision(side: Side, provision: &SyncProvision) -> Result<()> {
    if provision.is_empty() {
        return Err(SyncError::InvalidProvision {
            side,
            detail: "nothing to provision".to_string(),
        });
    }
    let forbidden: &[Provision] = match side {
        Side::Client => &[Provision::ServerScope, Provision::ServerHistoryScope],
        Side::Server => &[Provision::ClientScope],
    };
    if let Some(p) = forbidden.iter().find(|p| provision.contains(**p)) {
        return Err(SyncError::InvalidProvision {
            side,
            detail: format!("{} cannot be provisioned on this side", p),
        });
    }
    Ok(())
}

fn has_schema_name(table: &SyncTable) -> bool {
    table.schema_name.as_deref().is_some_and(|s| !s.is_empty())
}

impl Orchestrator {
    /// Create `artifact` unless it exists, returning whether it was created
    pub(crate) async fn create_if_missing(
        &self,
        conn: &dyn DbConnection,
        builder: &dyn TableBuilder,
        table: &SyncTable,
        artifact: DbArtifact,
    ) -> Result<bool> {
        if builder.exists_artifact(conn, artifact).await? {
            return Ok(false);
        }
        builder.create_artifact(conn, artifact).await?;
        tracing::debug!("Created {} of {}", artifact, table.full_name());
        self.intercept(SyncEvent::artifact_created(table, artifact, builder.tracking_table_name()));
        Ok(true)
    }

    /// Drop `artifact` if it exists, returning whether it was dropped
    pub(crate) async fn drop_if_present(
        &self,
        conn: &dyn DbConnection,
        builder: &dyn TableBuilder,
        table: &SyncTable,
        artifact: DbArtifact,
    ) -> Result<bool> {
        if !builder.exists_artifact(conn, artifact).await? {
            return Ok(false);
        }
        builder.drop_artifact(conn, artifact).await?;
        tracing::debug!("Dropped {} of {}", artifact, table.full_name());
        self.intercept(SyncEvent::artifact_dropped(table, artifact, builder.tracking_table_name()));
        Ok(true)
    }

    async fn ensure_scope_table(&self, conn: &dyn DbConnection, scope_type: ScopeType) -> Result<()> {
        if !self.scope_builder.exists_scope_table(conn, scope_type).await? {
            self.scope_builder.create_scope_table(conn, scope_type).await?;
            self.intercept(SyncEvent::ScopeTableCreated { scope_type });
        }
        Ok(())
    }

    async fn drop_scope_table(&self, conn: &dyn DbConnection, scope_type: ScopeType) -> Result<()> {
        if self.scope_builder.exists_scope_table(conn, scope_type).await? {
            self.scope_builder.drop_scope_table(conn, scope_type).await?;
            self.intercept(SyncEvent::ScopeTableDropped { scope_type });
        }
        Ok(())
    }

    /// Create the artifacts of `provision` for every table of `schema`
    ///
    /// With `overwrite`, the table artifacts are dropped first so they are
    /// recreated from the current schema. The user table is never dropped.
    pub(crate) async fn provision_schema(
        &self,
        conn: &dyn DbConnection,
        schema: &SyncSet,
        provision: &SyncProvision,
        overwrite: bool,
    ) -> Result<()> {
        validate_provision(self.side, provision)?;
        schema.ensure_valid()?;

        if overwrite {
            let recreated = provision.intersection(&SyncProvision::table_artifacts());
            if !recreated.is_empty() {
                self.deprovision_schema(conn, schema, &self.setup, &recreated).await?;
            }
        }

        for (provision_kind, scope_type) in [
            (Provision::ClientScope, ScopeType::Client),
            (Provision::ServerScope, ScopeType::Server),
            (Provision::ServerHistoryScope, ScopeType::ServerHistory),
        ] {
            if provision.contains(provision_kind) {
                self.ensure_scope_table(conn, scope_type).await?;
            }
        }

        for table in schema.sort_by_dependencies() {
            self.check_cancelled()?;
            let builder = self.provider.table_builder(table, &self.setup);
            let builder = builder.as_ref();

            if has_schema_name(table) && provision.has_table_artifacts() {
                self.create_if_missing(conn, builder, table, DbArtifact::SchemaName).await?;
            }
            if provision.contains(Provision::Table) {
                self.create_if_missing(conn, builder, table, DbArtifact::Table).await?;
            }
            if provision.contains(Provision::TrackingTable) {
                self.create_if_missing(conn, builder, table, DbArtifact::TrackingTable).await?;
            }
            if provision.contains(Provision::Triggers) {
                for kind in TriggerKind::ALL {
                    self.create_if_missing(conn, builder, table, DbArtifact::Trigger(kind)).await?;
                }
            }
            if provision.contains(Provision::StoredProcedures) {
                for kind in self.procedures_for(table, &self.setup) {
                    self.create_if_missing(conn, builder, table, DbArtifact::StoredProcedure(kind))
                        .await?;
                }
            }
        }

        tracing::info!(
            "Provisioned [{}] for {} tables on the {} side",
            provision,
            schema.tables.len(),
            self.side
        );
        self.intercept(SyncEvent::Provisioned {
            provision: provision.clone(),
        });
        Ok(())
    }

    /// Drop the artifacts of `provision`, named after `setup`, children first
    pub(crate) async fn deprovision_schema(
        &self,
        conn: &dyn DbConnection,
        schema: &SyncSet,
        setup: &SyncSetup,
        provision: &SyncProvision,
    ) -> Result<()> {
        for table in schema.reverse_dependency_order() {
            self.check_cancelled()?;
            let builder = self.provider.table_builder(table, setup);
            let builder = builder.as_ref();

            if provision.contains(Provision::StoredProcedures) {
                for kind in ProcedureKind::ALL {
                    self.drop_if_present(conn, builder, table, DbArtifact::StoredProcedure(kind))
                        .await?;
                }
            }
            if provision.contains(Provision::Triggers) {
                for kind in TriggerKind::ALL {
                    self.drop_if_present(conn, builder, table, DbArtifact::Trigger(kind)).await?;
                }
            }
            if provision.contains(Provision::TrackingTable) {
                self.drop_if_present(conn, builder, table, DbArtifact::TrackingTable).await?;
            }
            if provision.contains(Provision::Table) {
                self.drop_if_present(conn, builder, table, DbArtifact::Table).await?;
            }
        }

        for (provision_kind, scope_type) in [
            (Provision::ClientScope, ScopeType::Client),
            (Provision::ServerScope, ScopeType::Server),
            (Provision::ServerHistoryScope, ScopeType::ServerHistory),
        ] {
            if provision.contains(provision_kind) {
                self.drop_scope_table(conn, scope_type).await?;
            }
        }

        self.clear_adapters();
        tracing::info!("Deprovisioned [{}] on the {} side", provision, self.side);
        self.intercept(SyncEvent::Deprovisioned {
            provision: provision.clone(),
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SyncOptions;
    use crate::provider::memory::InMemoryProvider;
    use crate::schema::tests::customer_table;
    use crate::schema::{SyncColumn, SyncRelation, TableRef};
    use crate::types::SyncStage;
    use std::sync::Arc;

    fn order_table() -> SyncTable {
        SyncTable::new("Order")
            .with_key_column(SyncColumn::new("Id", "int"))
            .with_column(SyncColumn::new("CustomerId", "int"))
    }

    fn schema() -> SyncSet {
        // Children declared first on purpose
        SyncSet::new()
            .with_table(order_table())
            .with_table(customer_table())
            .with_relation(
                SyncRelation::new(
                    "FK_Order_Customer",
                    TableRef::new("Order", None),
                    TableRef::new("Customer", None),
                )
                .with_keys("CustomerId", "Id"),
            )
    }

    fn orchestrator(provider: &InMemoryProvider, side: Side) -> Orchestrator {
        Orchestrator::new(
            Arc::new(provider.clone()),
            SyncSetup::new(["Order", "Customer"]),
            SyncOptions::default(),
            side,
        )
        .unwrap()
    }

    async fn provision(orchestrator: &Orchestrator, provision: SyncProvision, overwrite: bool) -> Result<()> {
        let schema = schema();
        let (schema, provision) = (&schema, &provision);
        orchestrator
            .run_in_transaction(SyncStage::Provisioning, None, |conn| async move {
                orchestrator
                    .provision_schema(conn.as_ref(), schema, provision, overwrite)
                    .await
            })
            .await
    }

    fn creates(provider: &InMemoryProvider) -> Vec<String> {
        provider
            .calls()
            .into_iter()
            .filter(|c| c.starts_with("create "))
            .collect()
    }

    #[test]
    fn test_validate_provision_by_side() {
        assert!(validate_provision(Side::Client, &SyncProvision::client_default()).is_ok());
        assert!(validate_provision(Side::Server, &SyncProvision::server_default()).is_ok());
        assert!(validate_provision(Side::Client, &Provision::ServerScope.into()).is_err());
        assert!(validate_provision(Side::Server, &Provision::ClientScope.into()).is_err());
        assert!(validate_provision(Side::Client, &SyncProvision::new()).is_err());
    }

    #[tokio::test]
    async fn test_client_provision_creates_parents_first() {
        let provider = InMemoryProvider::new();
        let orchestrator = orchestrator(&provider, Side::Client);
        provision(&orchestrator, SyncProvision::client_default(), false)
            .await
            .unwrap();

        let creates = creates(&provider);
        let position = |needle: &str| creates.iter().position(|c| c == needle).unwrap();
        assert!(position("create table:Customer") < position("create table:Order"));
        assert!(position("create tracking_table:Customer_tracking") < position("create table:Order"));
        assert!(provider.has_table("Order"));
        assert!(provider.has_artifact("trigger:Order_update_trigger"));
        assert!(provider.has_artifact("stored_procedure:Customer_changes"));
        assert!(!provider.has_artifact("stored_procedure:Customer_changes_filtered"));
        assert!(provider.has_artifact("scope_table:scope_info"));
    }

    #[tokio::test]
    async fn test_provisioning_twice_creates_nothing() {
        let provider = InMemoryProvider::new();
        let orchestrator = orchestrator(&provider, Side::Client);
        provision(&orchestrator, SyncProvision::client_default(), false)
            .await
            .unwrap();
        let artifacts = provider.artifacts();

        provider.clear_calls();
        provision(&orchestrator, SyncProvision::client_default(), false)
            .await
            .unwrap();

        assert!(creates(&provider).is_empty());
        assert_eq!(provider.artifacts(), artifacts);
    }

    #[tokio::test]
    async fn test_overwrite_recreates_table_artifacts_only() {
        let provider = InMemoryProvider::new();
        let orchestrator = orchestrator(&provider, Side::Client);
        provision(&orchestrator, SyncProvision::client_default(), false)
            .await
            .unwrap();
        provider
            .upsert_row("Customer", serde_json::json!({"Id": 1, "Name": "Ada"}))
            .unwrap();

        provider.clear_calls();
        provision(&orchestrator, SyncProvision::client_default(), true)
            .await
            .unwrap();

        let calls = provider.calls();
        assert!(calls.contains(&"drop tracking_table:Order_tracking".to_string()));
        assert!(!calls.iter().any(|c| c.starts_with("drop table:")));
        assert!(calls.contains(&"create tracking_table:Order_tracking".to_string()));
        assert_eq!(provider.row_count("Customer"), 1);
    }

    #[tokio::test]
    async fn test_server_rejects_client_scope() {
        let provider = InMemoryProvider::new();
        let orchestrator = orchestrator(&provider, Side::Server);
        let err = provision(&orchestrator, SyncProvision::client_default(), false)
            .await
            .unwrap_err();
        assert!(matches!(err.root(), SyncError::InvalidProvision { .. }));
        assert!(provider.calls().is_empty());
    }

    #[tokio::test]
    async fn test_deprovision_drops_children_first() {
        let provider = InMemoryProvider::new();
        let orchestrator = orchestrator(&provider, Side::Client);
        provision(&orchestrator, SyncProvision::client_default(), false)
            .await
            .unwrap();

        provider.clear_calls();
        let schema = schema();
        let (o, s) = (&orchestrator, &schema);
        orchestrator
            .run_in_transaction(SyncStage::Deprovisioning, None, |conn| async move {
                o.deprovision_schema(conn.as_ref(), s, o.setup(), &SyncProvision::table_artifacts())
                    .await
            })
            .await
            .unwrap();

        let drops: Vec<String> = provider
            .calls()
            .into_iter()
            .filter(|c| c.starts_with("drop "))
            .collect();
        let position = |needle: &str| drops.iter().position(|c| c == needle).unwrap();
        assert!(position("drop tracking_table:Order_tracking") < position("drop tracking_table:Customer_tracking"));
        assert!(provider.has_table("Customer"));
        assert!(!provider.has_artifact("trigger:Customer_insert_trigger"));
        assert!(provider.has_artifact("scope_table:scope_info"));
    }
}
