//! Walking the upgrade chain against a database

use super::{next_step, SyncVersion};
use crate::error::Result;
use crate::orchestrator::{Orchestrator, SyncEvent};
use crate::provider::{DbArtifact, DbConnection, TriggerKind};
use crate::schema::SyncSet;

impl Orchestrator {
    /// Upgrade every table of `schema` from `from` to the current version
    ///
    /// Artifacts are only recreated where they exist. Returns the version
    /// reached.
    pub(crate) async fn upgrade_schema(
        &self,
        conn: &dyn DbConnection,
        schema: &SyncSet,
        from: SyncVersion,
    ) -> Result<SyncVersion> {
        let mut version = from;

        while let Some(step) = next_step(version)? {
            self.check_cancelled()?;
            let procedures = step.action.procedures();

            if step.action.recreates_triggers() || !procedures.is_empty() {
                for table in schema.sort_by_dependencies() {
                    let builder = self.provider.table_builder(table, &self.setup);
                    let builder = builder.as_ref();

                    if step.action.recreates_triggers() {
                        for kind in TriggerKind::ALL {
                            let artifact = DbArtifact::Trigger(kind);
                            if self.drop_if_present(conn, builder, table, artifact).await? {
                                self.create_if_missing(conn, builder, table, artifact).await?;
                            }
                        }
                    }

                    let required = self.procedures_for(table, &self.setup);
                    for kind in procedures.iter().filter(|k| required.contains(k)) {
                        let artifact = DbArtifact::StoredProcedure(*kind);
                        if self.drop_if_present(conn, builder, table, artifact).await? {
                            self.create_if_missing(conn, builder, table, artifact).await?;
                        }
                    }
                }
            }

            tracing::debug!("Upgrade step {} -> {} on scope {}", version, step.to, self.scope_name);
            self.intercept(SyncEvent::UpgradeStep {
                from: version,
                to: step.to,
            });
            version = step.to;
        }

        if version != from {
            self.clear_adapters();
            tracing::info!(
                "Upgraded scope {} on the {} side from {} to {}",
                self.scope_name,
                self.side,
                from,
                version
            );
            self.intercept(SyncEvent::Upgraded { from, to: version });
        }
        Ok(version)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SyncOptions;
    use crate::orchestrator::{EventKind, Interceptors};
    use crate::provider::memory::InMemoryProvider;
    use crate::provision::SyncProvision;
    use crate::schema::tests::customer_table;
    use crate::schema::SyncSetup;
    use crate::types::{Side, SyncStage};
    use crate::upgrade::CURRENT_VERSION;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn test_upgrade_from_0_6_0_reaches_current() {
        let provider = InMemoryProvider::new();
        let steps = Arc::new(AtomicUsize::new(0));
        let counter = steps.clone();
        let mut orchestrator = Orchestrator::new(
            Arc::new(provider.clone()),
            SyncSetup::new(["Customer"]),
            SyncOptions::default(),
            Side::Client,
        )
        .unwrap();
        orchestrator.interceptors = Interceptors::builder()
            .on(EventKind::UpgradeStep, move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
            })
            .build();

        let schema = SyncSet::new().with_table(customer_table());
        let (o, s) = (&orchestrator, &schema);
        orchestrator
            .run_in_transaction(SyncStage::Provisioning, None, |conn| async move {
                o.provision_schema(conn.as_ref(), s, &SyncProvision::client_default(), false)
                    .await
            })
            .await
            .unwrap();
        let artifacts = provider.artifacts();

        provider.clear_calls();
        let version = orchestrator
            .run_in_transaction(SyncStage::Provisioning, None, |conn| async move {
                o.upgrade_schema(conn.as_ref(), s, SyncVersion::new(0, 6, 0)).await
            })
            .await
            .unwrap();

        assert_eq!(version, CURRENT_VERSION);
        assert_eq!(steps.load(Ordering::SeqCst), 10);
        assert_eq!(provider.artifacts(), artifacts);
        assert!(provider
            .calls()
            .contains(&"drop trigger:Customer_insert_trigger".to_string()));
        // Filtered procedures do not exist and are not created by an upgrade
        assert!(!provider
            .calls()
            .contains(&"create stored_procedure:Customer_changes_filtered".to_string()));
    }

    #[tokio::test]
    async fn test_current_version_is_untouched() {
        let provider = InMemoryProvider::new();
        let orchestrator = Orchestrator::new(
            Arc::new(provider.clone()),
            SyncSetup::new(["Customer"]),
            SyncOptions::default(),
            Side::Server,
        )
        .unwrap();
        let schema = SyncSet::new().with_table(customer_table());
        let (o, s) = (&orchestrator, &schema);

        let version = orchestrator
            .run_in_transaction(SyncStage::Provisioning, None, |conn| async move {
                o.upgrade_schema(conn.as_ref(), s, CURRENT_VERSION).await
            })
            .await
            .unwrap();
        assert_eq!(version, CURRENT_VERSION);
        assert!(provider.calls().is_empty());
    }
}
