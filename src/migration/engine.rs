//! Applying a migration plan
//!
//! Every artifact the plan drops or recreates is dropped first, children
//! first and named after the old setup. Artifacts are then created parents
//! first under the new setup.

use super::{MigrationAction, MigrationPlan};
use crate::error::Result;
use crate::orchestrator::{Orchestrator, SyncEvent};
use crate::provider::{DbArtifact, DbConnection, ProcedureKind, TriggerKind};
use crate::schema::{SyncSet, SyncSetup};
use crate::types::Side;

impl Orchestrator {
    /// Move the database from `old_setup`/`old_schema` to the orchestrator's
    /// setup and `new_schema`
    pub(crate) async fn migrate_schema(
        &self,
        conn: &dyn DbConnection,
        old_setup: &SyncSetup,
        old_schema: &SyncSet,
        new_schema: &SyncSet,
    ) -> Result<MigrationPlan> {
        new_schema.ensure_valid()?;
        let plan = MigrationPlan::compare(old_setup, &self.setup, old_schema, new_schema);
        if !plan.has_changes() {
            tracing::debug!("Nothing to migrate on the {} side", self.side);
            return Ok(plan);
        }

        // Drop what goes away or gets recreated
        for table in old_schema.reverse_dependency_order() {
            self.check_cancelled()?;
            let Some(migration) = plan.table_by_ref(&table.table_ref()) else {
                continue;
            };
            let builder = self.provider.table_builder(table, old_setup);
            let builder = builder.as_ref();

            if migration.stored_procedures.drops() {
                for kind in ProcedureKind::ALL {
                    self.drop_if_present(conn, builder, table, DbArtifact::StoredProcedure(kind))
                        .await?;
                }
            }
            if migration.triggers.drops() {
                for kind in TriggerKind::ALL {
                    self.drop_if_present(conn, builder, table, DbArtifact::Trigger(kind)).await?;
                }
            }
            if migration.tracking_table.drops() {
                self.drop_if_present(conn, builder, table, DbArtifact::TrackingTable).await?;
            }
        }

        // Recreate under the new setup
        for table in new_schema.sort_by_dependencies() {
            self.check_cancelled()?;
            let Some(migration) = plan.table_by_ref(&table.table_ref()) else {
                continue;
            };
            let builder = self.provider.table_builder(table, &self.setup);
            let builder = builder.as_ref();

            match migration.table_action {
                MigrationAction::Create if self.side == Side::Client => {
                    self.create_if_missing(conn, builder, table, DbArtifact::Table).await?;
                }
                MigrationAction::Alter => {
                    for column in &migration.added_columns {
                        if builder.exists_column(conn, &column.name).await? {
                            continue;
                        }
                        builder.add_column(conn, column).await?;
                        tracing::debug!("Added column {} to {}", column.name, table.full_name());
                        self.intercept(SyncEvent::ColumnAdded {
                            table: table.full_name(),
                            column: column.name.clone(),
                        });
                    }
                }
                _ => {}
            }

            if migration.tracking_table == MigrationAction::Rename {
                let old_name = match old_schema.table_by_ref(&table.table_ref()) {
                    Some(old_table) => self.provider.table_builder(old_table, old_setup).tracking_table_name(),
                    None => self.provider.table_builder(table, old_setup).tracking_table_name(),
                };
                if !builder.exists_artifact(conn, DbArtifact::TrackingTable).await? {
                    builder.rename_tracking_table(conn, &old_name).await?;
                    let new_name = builder.tracking_table_name();
                    tracing::debug!("Renamed tracking table {} to {}", old_name, new_name);
                    self.intercept(SyncEvent::TrackingTableRenamed {
                        table: table.full_name(),
                        old_name,
                        new_name,
                    });
                }
            }

            if migration.tracking_table == MigrationAction::Create {
                self.create_if_missing(conn, builder, table, DbArtifact::TrackingTable).await?;
            }
            if migration.triggers == MigrationAction::Create {
                for kind in TriggerKind::ALL {
                    self.create_if_missing(conn, builder, table, DbArtifact::Trigger(kind)).await?;
                }
            }
            if migration.stored_procedures == MigrationAction::Create {
                for kind in self.procedures_for(table, &self.setup) {
                    self.create_if_missing(conn, builder, table, DbArtifact::StoredProcedure(kind))
                        .await?;
                }
            }
        }

        self.clear_adapters();
        let migrated = plan.tables.iter().filter(|t| t.has_changes()).count();
        tracing::info!("Migrated {} tables on the {} side", migrated, self.side);
        self.intercept(SyncEvent::Migrated { tables: migrated });
        Ok(plan)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SyncOptions;
    use crate::provider::memory::InMemoryProvider;
    use crate::provision::SyncProvision;
    use crate::schema::{SyncColumn, SyncTable};
    use crate::types::SyncStage;
    use pretty_assertions::assert_eq;
    use std::sync::Arc;

    fn table_ab() -> SyncTable {
        SyncTable::new("T")
            .with_key_column(SyncColumn::new("A", "int"))
            .with_column(SyncColumn::new("B", "text"))
    }

    fn table_abc() -> SyncTable {
        table_ab().with_column(SyncColumn::new("C", "text").nullable())
    }

    fn orchestrator(provider: &InMemoryProvider, setup: SyncSetup) -> Orchestrator {
        Orchestrator::new(Arc::new(provider.clone()), setup, SyncOptions::default(), Side::Client).unwrap()
    }

    async fn provision(provider: &InMemoryProvider, setup: &SyncSetup, schema: &SyncSet) {
        let orchestrator = orchestrator(provider, setup.clone());
        let o = &orchestrator;
        orchestrator
            .run_in_transaction(SyncStage::Provisioning, None, |conn| async move {
                o.provision_schema(conn.as_ref(), schema, &SyncProvision::client_default(), false)
                    .await
            })
            .await
            .unwrap();
    }

    async fn migrate(
        orchestrator: &Orchestrator,
        old_setup: &SyncSetup,
        old_schema: &SyncSet,
        new_schema: &SyncSet,
    ) -> MigrationPlan {
        orchestrator
            .run_in_transaction(SyncStage::Migrating, None, |conn| async move {
                orchestrator
                    .migrate_schema(conn.as_ref(), old_setup, old_schema, new_schema)
                    .await
            })
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_added_column_checks_then_adds_once() {
        let provider = InMemoryProvider::new();
        let setup = SyncSetup::new(["T"]);
        let old = SyncSet::new().with_table(table_ab());
        provision(&provider, &setup, &old).await;

        provider.clear_calls();
        let orchestrator = orchestrator(&provider, setup.clone());
        let new = SyncSet::new().with_table(table_abc());
        migrate(&orchestrator, &setup, &old, &new).await;

        let column_calls: Vec<String> = provider
            .calls()
            .into_iter()
            .filter(|c| c.contains("column"))
            .collect();
        assert_eq!(column_calls, vec!["exists_column T.C".to_string(), "add_column T.C".to_string()]);
        assert_eq!(provider.columns("T"), vec!["A", "B", "C"]);
        assert!(provider.has_artifact("stored_procedure:T_changes"));
        assert!(provider.has_artifact("trigger:T_insert_trigger"));
    }

    #[tokio::test]
    async fn test_tracking_rename_preserves_table() {
        let provider = InMemoryProvider::new();
        let old_setup = SyncSetup::new(["T"]);
        let schema = SyncSet::new().with_table(table_ab());
        provision(&provider, &old_setup, &schema).await;

        let new_setup = SyncSetup::new(["T"]).with_tracking_tables_naming("", "_changes");
        let orchestrator = orchestrator(&provider, new_setup);
        provider.clear_calls();
        migrate(&orchestrator, &old_setup, &schema, &schema).await;

        assert!(provider
            .calls()
            .contains(&"rename_tracking_table T_tracking -> T_changes".to_string()));
        assert!(provider.has_artifact("tracking_table:T_changes"));
        assert!(!provider.has_artifact("tracking_table:T_tracking"));
    }

    #[tokio::test]
    async fn test_removed_table_loses_its_artifacts() {
        let provider = InMemoryProvider::new();
        let old_setup = SyncSetup::new(["T", "U"]);
        let u = SyncTable::new("U").with_key_column(SyncColumn::new("Id", "int"));
        let old = SyncSet::new().with_table(table_ab()).with_table(u);
        provision(&provider, &old_setup, &old).await;

        let new_setup = SyncSetup::new(["T"]);
        let new = SyncSet::new().with_table(table_ab());
        let orchestrator = orchestrator(&provider, new_setup);
        migrate(&orchestrator, &old_setup, &old, &new).await;

        assert!(provider.has_table("U"));
        assert!(!provider.has_artifact("tracking_table:U_tracking"));
        assert!(!provider.has_artifact("stored_procedure:U_changes"));
        assert!(provider.has_artifact("tracking_table:T_tracking"));
    }

    #[tokio::test]
    async fn test_no_changes_issues_no_ddl() {
        let provider = InMemoryProvider::new();
        let setup = SyncSetup::new(["T"]);
        let schema = SyncSet::new().with_table(table_ab());
        provision(&provider, &setup, &schema).await;

        provider.clear_calls();
        let orchestrator = orchestrator(&provider, setup.clone());
        let plan = migrate(&orchestrator, &setup, &schema, &schema).await;
        assert!(!plan.has_changes());
        assert!(provider.calls().is_empty());
    }
}
