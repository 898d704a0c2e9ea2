//! Applying a batch to the local database
//!
//! Deletes go first, children before parents, so no foreign key is left
//! dangling. Upserts follow, parents before children.

use super::{DatabaseChangesApplied, RowState, SyncRow, TableChangesApplied};
use crate::batch::BatchInfo;
use crate::error::{Result, SyncError};
use crate::orchestrator::{Orchestrator, SyncEvent};
use crate::provider::{ApplyContext, DbConnection};
use crate::schema::{SyncSet, SyncTable};

impl Orchestrator {
    /// Apply every part of `batch` to the tables of `schema`
    pub(crate) async fn apply_batch(
        &self,
        conn: &dyn DbConnection,
        batch: &BatchInfo,
        schema: &SyncSet,
        ctx: &ApplyContext,
    ) -> Result<DatabaseChangesApplied> {
        let mut applied = DatabaseChangesApplied::default();
        if batch.parts.is_empty() {
            return Ok(applied);
        }
        if !batch.serializer.eq_ignore_ascii_case(self.serializer.key()) {
            return Err(SyncError::Batch(format!(
                "batch was written with the {} serializer, {} is configured",
                batch.serializer,
                self.serializer.key()
            )));
        }

        let way = self.side.applying_way();
        for table in schema.reverse_dependency_order() {
            if table.sync_direction.allows(way) {
                if let Some(changes) = self.apply_table(conn, batch, table, RowState::Deleted, ctx).await? {
                    applied.tables.push(changes);
                }
            }
        }
        for table in schema.sort_by_dependencies() {
            if table.sync_direction.allows(way) {
                if let Some(changes) = self.apply_table(conn, batch, table, RowState::Modified, ctx).await? {
                    applied.tables.push(changes);
                }
            }
        }

        tracing::info!(
            "Applied {} changes on the {} side ({} failed, {} conflicts resolved)",
            applied.total_applied(),
            self.side,
            applied.total_failed(),
            applied.total_resolved_conflicts()
        );
        self.intercept(SyncEvent::DatabaseChangesApplied {
            changes: applied.clone(),
        });
        Ok(applied)
    }

    /// Empty every table, children first
    pub(crate) async fn reset_tables(&self, conn: &dyn DbConnection, schema: &SyncSet) -> Result<()> {
        for table in schema.reverse_dependency_order() {
            self.check_cancelled()?;
            self.adapter(table).reset_table(conn).await?;
            tracing::debug!("Reset table {}", table.full_name());
        }
        Ok(())
    }

    async fn apply_table(
        &self,
        conn: &dyn DbConnection,
        batch: &BatchInfo,
        table: &SyncTable,
        state: RowState,
        ctx: &ApplyContext,
    ) -> Result<Option<TableChangesApplied>> {
        let table_ref = table.table_ref();
        let mut changes = TableChangesApplied::new(&table_ref, state);
        let mut touched = false;

        for part in batch.parts_for(&table_ref) {
            self.check_cancelled()?;
            let content = self.serializer.read_part(&batch.part_path(part)).await?;
            let rows: Vec<SyncRow> = content.rows.into_iter().filter(|r| r.state == state).collect();
            if rows.is_empty() {
                continue;
            }
            for row in &rows {
                if row.values.len() != table.columns.len() {
                    return Err(SyncError::Batch(format!(
                        "row of {} has {} values, the table has {} columns",
                        table.full_name(),
                        row.values.len(),
                        table.columns.len()
                    )));
                }
            }

            let result = self.adapter(table).apply_changes(conn, state, &rows, ctx).await?;
            changes.applied += result.applied;
            changes.failed += result.failed;
            changes.resolved_conflicts += result.resolved_conflicts;
            touched = true;
        }

        if !touched {
            return Ok(None);
        }
        tracing::debug!(
            "Applied {} {:?} rows to {}",
            changes.applied,
            state,
            table.full_name()
        );
        self.intercept(SyncEvent::TableChangesApplied {
            changes: changes.clone(),
        });
        Ok(Some(changes))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::changes::ChangesRequest;
    use crate::config::SyncOptions;
    use crate::provider::memory::InMemoryProvider;
    use crate::provision::SyncProvision;
    use crate::schema::tests::customer_table;
    use crate::schema::SyncSetup;
    use crate::types::{ConflictResolutionPolicy, Side, SyncParameters, SyncStage};
    use serde_json::json;
    use std::path::Path;
    use std::sync::Arc;
    use uuid::Uuid;

    async fn provisioned(provider: &InMemoryProvider, side: Side) -> Orchestrator {
        let orchestrator = Orchestrator::new(
            Arc::new(provider.clone()),
            SyncSetup::new(["Customer"]),
            SyncOptions::default(),
            side,
        )
        .unwrap();
        let provision = match side {
            Side::Client => SyncProvision::client_default(),
            Side::Server => {
                provider.create_table(customer_table());
                SyncProvision::server_default()
            }
        };
        let schema = SyncSet::new().with_table(customer_table());
        let (o, s, p) = (&orchestrator, &schema, &provision);
        orchestrator
            .run_in_transaction(SyncStage::Provisioning, None, |conn| async move {
                o.provision_schema(conn.as_ref(), s, p, false).await
            })
            .await
            .unwrap();
        orchestrator
    }

    async fn select_all(orchestrator: &Orchestrator, root: &Path) -> BatchInfo {
        let schema = SyncSet::new().with_table(customer_table());
        let request = ChangesRequest {
            scope_id: Uuid::new_v4(),
            is_new: false,
            last_timestamp: None,
            parameters: SyncParameters::new(),
        };
        let (s, r) = (&schema, &request);
        let (batch, _) = orchestrator
            .run_in_transaction(SyncStage::ChangesSelecting, None, |conn| async move {
                orchestrator
                    .select_changes(conn.as_ref(), s, r, BatchInfo::new(root, "json"))
                    .await
            })
            .await
            .unwrap();
        batch
    }

    async fn apply(orchestrator: &Orchestrator, batch: &BatchInfo, ctx: &ApplyContext) -> Result<DatabaseChangesApplied> {
        let schema = SyncSet::new().with_table(customer_table());
        let s = &schema;
        orchestrator
            .run_in_transaction(SyncStage::ChangesApplying, None, |conn| async move {
                orchestrator.apply_batch(conn.as_ref(), batch, s, ctx).await
            })
            .await
    }

    fn server_context(policy: ConflictResolutionPolicy) -> ApplyContext {
        ApplyContext {
            side: Side::Server,
            policy,
            scope_id: Uuid::new_v4(),
            last_timestamp: None,
            is_new_scope: false,
        }
    }

    #[tokio::test]
    async fn test_upserts_and_deletes_reach_the_server() {
        let client = InMemoryProvider::new();
        let server = InMemoryProvider::new();
        let local = provisioned(&client, Side::Client).await;
        let remote = provisioned(&server, Side::Server).await;

        server.upsert_row("Customer", json!({"Id": 2, "Name": "Grace"})).unwrap();
        client.upsert_row("Customer", json!({"Id": 1, "Name": "Ada"})).unwrap();
        client.upsert_row("Customer", json!({"Id": 2, "Name": "Grace"})).unwrap();
        client.delete_row("Customer", json!({"Id": 2})).unwrap();

        let dir = tempfile::tempdir().unwrap();
        let batch = select_all(&local, dir.path()).await;
        // Server rows predate the session, so the ctx timestamp covers them
        let mut ctx = server_context(ConflictResolutionPolicy::ServerWins);
        ctx.last_timestamp = Some(server.timestamp());
        let applied = apply(&remote, &batch, &ctx).await.unwrap();

        assert_eq!(applied.total_applied(), 2);
        assert_eq!(applied.tables[0].state, RowState::Deleted);
        assert_eq!(applied.tables[1].state, RowState::Modified);
        assert_eq!(server.row_count("Customer"), 1);
        assert_eq!(server.tombstone_count("Customer"), 1);
    }

    #[tokio::test]
    async fn test_conflict_resolution_follows_policy() {
        for (policy, expected) in [
            (ConflictResolutionPolicy::ServerWins, "Server"),
            (ConflictResolutionPolicy::ClientWins, "Client"),
        ] {
            let client = InMemoryProvider::new();
            let server = InMemoryProvider::new();
            let local = provisioned(&client, Side::Client).await;
            let remote = provisioned(&server, Side::Server).await;

            client.upsert_row("Customer", json!({"Id": 1, "Name": "Client"})).unwrap();
            server.upsert_row("Customer", json!({"Id": 1, "Name": "Server"})).unwrap();

            let dir = tempfile::tempdir().unwrap();
            let batch = select_all(&local, dir.path()).await;
            let applied = apply(&remote, &batch, &server_context(policy)).await.unwrap();

            assert_eq!(applied.total_resolved_conflicts(), 1);
            assert_eq!(server.rows("Customer")[0]["Name"], json!(expected));
        }
    }

    #[tokio::test]
    async fn test_foreign_serializer_is_rejected() {
        let server = InMemoryProvider::new();
        let remote = provisioned(&server, Side::Server).await;
        let mut batch = BatchInfo::at("/tmp", "foreign", "xml");
        batch.parts.push(crate::batch::BatchPartInfo::new(
            "Customer_0000.xml",
            &customer_table().table_ref(),
            1,
        ));

        let err = apply(&remote, &batch, &server_context(ConflictResolutionPolicy::ServerWins))
            .await
            .unwrap_err();
        assert!(matches!(err.root(), SyncError::Batch(_)));
        assert_eq!(err.stage(), Some(SyncStage::ChangesApplying));
    }
}
