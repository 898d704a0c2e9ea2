//! Schema migrations between two setups
//!
//! [`MigrationPlan::compare`] diffs the setup and schema a scope was
//! provisioned with against the new ones and decides, per table, what
//! happens to each synchronization artifact. The engine then applies the
//! plan.

mod engine;

use serde::{Deserialize, Serialize};

use crate::schema::{same_name, SyncColumn, SyncSet, SyncSetup, SyncTable, TableRef};

/// What happens to one artifact during a migration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MigrationAction {
    #[default]
    None,
    /// Created, or dropped then recreated when it exists
    Create,
    Alter,
    Drop,
    Rename,
}

impl MigrationAction {
    pub fn is_none(&self) -> bool {
        matches!(self, MigrationAction::None)
    }

    /// Whether the artifact must be dropped before anything is created
    pub(crate) fn drops(&self) -> bool {
        matches!(self, MigrationAction::Create | MigrationAction::Drop)
    }
}

/// Migration of one table
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableMigration {
    pub table: TableRef,
    pub table_action: MigrationAction,
    pub tracking_table: MigrationAction,
    pub triggers: MigrationAction,
    pub stored_procedures: MigrationAction,
    /// Columns to add to the user table when `table_action` is `Alter`
    #[serde(default)]
    pub added_columns: Vec<SyncColumn>,
}

impl TableMigration {
    fn new(table: TableRef) -> Self {
        Self {
            table,
            table_action: MigrationAction::None,
            tracking_table: MigrationAction::None,
            triggers: MigrationAction::None,
            stored_procedures: MigrationAction::None,
            added_columns: Vec::new(),
        }
    }

    pub fn has_changes(&self) -> bool {
        !(self.table_action.is_none()
            && self.tracking_table.is_none()
            && self.triggers.is_none()
            && self.stored_procedures.is_none())
    }

    /// Artifacts of a table new to the setup
    fn created(table: TableRef) -> Self {
        Self {
            table_action: MigrationAction::Create,
            tracking_table: MigrationAction::Create,
            triggers: MigrationAction::Create,
            stored_procedures: MigrationAction::Create,
            ..Self::new(table)
        }
    }

    /// Artifacts of a table removed from the setup, the user table is kept
    fn removed(table: TableRef) -> Self {
        Self {
            tracking_table: MigrationAction::Drop,
            triggers: MigrationAction::Drop,
            stored_procedures: MigrationAction::Drop,
            ..Self::new(table)
        }
    }
}

/// Per table migrations, in new schema order followed by removed tables
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MigrationPlan {
    pub tables: Vec<TableMigration>,
}

fn column_names(table: &SyncTable) -> Vec<String> {
    table.columns.iter().map(|c| c.name.to_lowercase()).collect()
}

fn key_names(table: &SyncTable) -> Vec<String> {
    table.primary_keys.iter().map(|k| k.to_lowercase()).collect()
}

impl MigrationPlan {
    /// Diff what a scope was provisioned with against what it should become
    pub fn compare(old_setup: &SyncSetup, new_setup: &SyncSetup, old_schema: &SyncSet, new_schema: &SyncSet) -> Self {
        let tracking_renamed = old_setup.tracking_naming_changed(new_setup);
        let triggers_renamed = old_setup.triggers_naming_changed(new_setup);
        let procedures_renamed = old_setup.stored_procedures_naming_changed(new_setup);

        let mut tables = Vec::new();
        for new_table in &new_schema.tables {
            let table_ref = new_table.table_ref();
            let name = new_table.table_name.as_str();
            let schema_name = new_table.schema_name.as_deref();

            let Some(old_table) = old_schema.table(name, schema_name) else {
                tables.push(TableMigration::created(table_ref));
                continue;
            };

            let mut migration = TableMigration::new(table_ref);

            let old_setup_table = old_setup.table(name, schema_name);
            let new_setup_table = new_setup.table(name, schema_name);
            let setup_columns_changed = match (old_setup_table, new_setup_table) {
                (Some(old), Some(new)) => {
                    old.columns.len() != new.columns.len()
                        || !old.columns.iter().zip(&new.columns).all(|(a, b)| same_name(a, b))
                }
                _ => false,
            };
            if setup_columns_changed || column_names(old_table) != column_names(new_table) {
                migration.table_action = MigrationAction::Alter;
                migration.added_columns = new_table
                    .columns
                    .iter()
                    .filter(|c| !old_table.has_column(&c.name))
                    .cloned()
                    .collect();
                migration.triggers = MigrationAction::Create;
                migration.stored_procedures = MigrationAction::Create;
            }

            if old_setup.filter_for(name, schema_name) != new_setup.filter_for(name, schema_name) {
                migration.stored_procedures = MigrationAction::Create;
            }

            if key_names(old_table) != key_names(new_table) {
                migration.tracking_table = MigrationAction::Create;
                migration.triggers = MigrationAction::Create;
                migration.stored_procedures = MigrationAction::Create;
            } else if tracking_renamed {
                migration.tracking_table = MigrationAction::Rename;
                migration.triggers = MigrationAction::Create;
                migration.stored_procedures = MigrationAction::Create;
            }

            if triggers_renamed {
                migration.triggers = MigrationAction::Create;
            }
            if procedures_renamed {
                migration.stored_procedures = MigrationAction::Create;
            }
            if old_table.sync_direction != new_table.sync_direction {
                migration.stored_procedures = MigrationAction::Create;
            }

            tables.push(migration);
        }

        for old_table in &old_schema.tables {
            if new_schema
                .table(&old_table.table_name, old_table.schema_name.as_deref())
                .is_none()
            {
                tables.push(TableMigration::removed(old_table.table_ref()));
            }
        }

        Self { tables }
    }

    pub fn has_changes(&self) -> bool {
        self.tables.iter().any(TableMigration::has_changes)
    }

    pub fn table(&self, table_name: &str, schema_name: Option<&str>) -> Option<&TableMigration> {
        self.tables
            .iter()
            .find(|t| t.table.matches(table_name, schema_name))
    }

    pub(crate) fn table_by_ref(&self, table: &TableRef) -> Option<&TableMigration> {
        self.table(&table.table_name, table.schema_name.as_deref())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::tests::customer_table;
    use crate::schema::{SetupFilter, SetupTable};

    fn schema(tables: Vec<SyncTable>) -> SyncSet {
        SyncSet {
            tables,
            relations: Vec::new(),
        }
    }

    #[test]
    fn test_identical_setups_need_nothing() {
        let setup = SyncSetup::new(["Customer"]);
        let set = schema(vec![customer_table()]);
        let plan = MigrationPlan::compare(&setup, &setup, &set, &set);
        assert!(!plan.has_changes());
    }

    #[test]
    fn test_added_column_alters_table() {
        let setup = SyncSetup::new(["Customer"]);
        let old = schema(vec![customer_table()]);
        let new = schema(vec![customer_table().with_column(SyncColumn::new("Email", "text").nullable())]);

        let plan = MigrationPlan::compare(&setup, &setup, &old, &new);
        let migration = plan.table("customer", None).unwrap();
        assert_eq!(migration.table_action, MigrationAction::Alter);
        assert_eq!(migration.added_columns.len(), 1);
        assert_eq!(migration.added_columns[0].name, "Email");
        assert_eq!(migration.tracking_table, MigrationAction::None);
        assert_eq!(migration.triggers, MigrationAction::Create);
        assert_eq!(migration.stored_procedures, MigrationAction::Create);
    }

    #[test]
    fn test_new_and_removed_tables() {
        let product = SyncTable::new("Product").with_key_column(SyncColumn::new("Id", "int"));
        let old_setup = SyncSetup::new(["Customer"]);
        let new_setup = SyncSetup::new(["Product"]);
        let plan = MigrationPlan::compare(
            &old_setup,
            &new_setup,
            &schema(vec![customer_table()]),
            &schema(vec![product]),
        );

        let created = plan.table("Product", None).unwrap();
        assert_eq!(created.table_action, MigrationAction::Create);
        assert_eq!(created.tracking_table, MigrationAction::Create);

        let removed = plan.table("Customer", None).unwrap();
        assert_eq!(removed.table_action, MigrationAction::None);
        assert_eq!(removed.tracking_table, MigrationAction::Drop);
        assert_eq!(removed.stored_procedures, MigrationAction::Drop);
    }

    #[test]
    fn test_tracking_naming_change_renames() {
        let old_setup = SyncSetup::new(["Customer"]);
        let new_setup = SyncSetup::new(["Customer"]).with_tracking_tables_naming("t_", "_changes");
        let set = schema(vec![customer_table()]);

        let plan = MigrationPlan::compare(&old_setup, &new_setup, &set, &set);
        let migration = plan.table("Customer", None).unwrap();
        assert_eq!(migration.tracking_table, MigrationAction::Rename);
        assert_eq!(migration.triggers, MigrationAction::Create);
        assert_eq!(migration.table_action, MigrationAction::None);
    }

    #[test]
    fn test_filter_change_recreates_procedures_only() {
        let old_setup = SyncSetup::new(["Customer"]);
        let new_setup = SyncSetup::new(["Customer"])
            .with_filter(SetupFilter::new("Customer").with_column_parameter("Name", "text"));
        let set = schema(vec![customer_table()]);

        let plan = MigrationPlan::compare(&old_setup, &new_setup, &set, &set);
        let migration = plan.table("Customer", None).unwrap();
        assert_eq!(migration.stored_procedures, MigrationAction::Create);
        assert_eq!(migration.triggers, MigrationAction::None);
        assert_eq!(migration.tracking_table, MigrationAction::None);
    }

    #[test]
    fn test_setup_column_list_change_alters() {
        let old_setup = SyncSetup::new([SetupTable::new("Customer").with_columns(["Id"])]);
        let new_setup = SyncSetup::new([SetupTable::new("Customer").with_columns(["Id", "Name"])]);
        let old = schema(vec![SyncTable::new("Customer").with_key_column(SyncColumn::new("Id", "int"))]);
        let new = schema(vec![customer_table()]);

        let plan = MigrationPlan::compare(&old_setup, &new_setup, &old, &new);
        assert_eq!(
            plan.table("Customer", None).map(|t| t.table_action),
            Some(MigrationAction::Alter)
        );
    }
}
