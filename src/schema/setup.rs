//! Declared synchronization setup

use serde::{Deserialize, Serialize};

use super::{same_name, same_schema};
use crate::error::{Result, SyncError};
use crate::types::SyncDirection;

fn default_tracking_suffix() -> String {
    "_tracking".to_string()
}

/// What to synchronize: tables, row filters and artifact naming
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncSetup {
    pub tables: Vec<SetupTable>,
    #[serde(default)]
    pub filters: Vec<SetupFilter>,
    #[serde(default)]
    pub tracking_tables_prefix: String,
    #[serde(default = "default_tracking_suffix")]
    pub tracking_tables_suffix: String,
    #[serde(default)]
    pub triggers_prefix: String,
    #[serde(default)]
    pub triggers_suffix: String,
    #[serde(default)]
    pub stored_procedures_prefix: String,
    #[serde(default)]
    pub stored_procedures_suffix: String,
}

impl Default for SyncSetup {
    fn default() -> Self {
        Self {
            tables: Vec::new(),
            filters: Vec::new(),
            tracking_tables_prefix: String::new(),
            tracking_tables_suffix: default_tracking_suffix(),
            triggers_prefix: String::new(),
            triggers_suffix: String::new(),
            stored_procedures_prefix: String::new(),
            stored_procedures_suffix: String::new(),
        }
    }
}

impl SyncSetup {
    /// Setup over the given tables, e.g. `SyncSetup::new(["Customer", "sales.Order"])`
    pub fn new<I, T>(tables: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<SetupTable>,
    {
        Self {
            tables: tables.into_iter().map(Into::into).collect(),
            ..Default::default()
        }
    }

    pub fn with_table(mut self, table: impl Into<SetupTable>) -> Self {
        self.tables.push(table.into());
        self
    }

    pub fn with_filter(mut self, filter: SetupFilter) -> Self {
        self.filters.push(filter);
        self
    }

    pub fn with_tracking_tables_naming(
        mut self,
        prefix: impl Into<String>,
        suffix: impl Into<String>,
    ) -> Self {
        self.tracking_tables_prefix = prefix.into();
        self.tracking_tables_suffix = suffix.into();
        self
    }

    pub fn with_triggers_naming(mut self, prefix: impl Into<String>, suffix: impl Into<String>) -> Self {
        self.triggers_prefix = prefix.into();
        self.triggers_suffix = suffix.into();
        self
    }

    pub fn with_stored_procedures_naming(
        mut self,
        prefix: impl Into<String>,
        suffix: impl Into<String>,
    ) -> Self {
        self.stored_procedures_prefix = prefix.into();
        self.stored_procedures_suffix = suffix.into();
        self
    }

    pub fn has_tables(&self) -> bool {
        !self.tables.is_empty()
    }

    pub fn table(&self, table_name: &str, schema_name: Option<&str>) -> Option<&SetupTable> {
        self.tables
            .iter()
            .find(|t| same_name(&t.table_name, table_name) && same_schema(t.schema_name.as_deref(), schema_name))
    }

    pub fn filter_for(&self, table_name: &str, schema_name: Option<&str>) -> Option<&SetupFilter> {
        self.filters
            .iter()
            .find(|f| same_name(&f.table_name, table_name) && same_schema(f.schema_name.as_deref(), schema_name))
    }

    /// Whether the table's change selection goes through the filtered commands
    pub fn has_filter(&self, table_name: &str, schema_name: Option<&str>) -> bool {
        self.filter_for(table_name, schema_name)
            .is_some_and(SetupFilter::has_parameters)
    }

    pub fn tracking_naming_changed(&self, other: &SyncSetup) -> bool {
        self.tracking_tables_prefix != other.tracking_tables_prefix
            || self.tracking_tables_suffix != other.tracking_tables_suffix
    }

    pub fn triggers_naming_changed(&self, other: &SyncSetup) -> bool {
        self.triggers_prefix != other.triggers_prefix || self.triggers_suffix != other.triggers_suffix
    }

    pub fn stored_procedures_naming_changed(&self, other: &SyncSetup) -> bool {
        self.stored_procedures_prefix != other.stored_procedures_prefix
            || self.stored_procedures_suffix != other.stored_procedures_suffix
    }

    /// Fail on a setup that cannot be synchronized, before any I/O
    pub fn ensure_valid(&self) -> Result<()> {
        if !self.has_tables() {
            return Err(SyncError::MissingTables);
        }
        for table in &self.tables {
            if table.table_name.trim().is_empty() {
                return Err(SyncError::Config("setup contains an empty table name".to_string()));
            }
        }
        for filter in &self.filters {
            if self
                .table(&filter.table_name, filter.schema_name.as_deref())
                .is_none()
            {
                return Err(SyncError::Config(format!(
                    "filter references table {} which is not part of the setup",
                    filter.table_name
                )));
            }
            for clause in &filter.wheres {
                if filter.parameter(&clause.parameter_name).is_none() {
                    return Err(SyncError::Config(format!(
                        "filter on {} uses undeclared parameter {}",
                        filter.table_name, clause.parameter_name
                    )));
                }
            }
        }
        Ok(())
    }
}

/// A table declared in the setup
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SetupTable {
    pub table_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schema_name: Option<String>,
    /// Columns to synchronize, all columns when empty
    #[serde(default)]
    pub columns: Vec<String>,
    #[serde(default)]
    pub sync_direction: SyncDirection,
}

impl SetupTable {
    pub fn new(table_name: impl Into<String>) -> Self {
        Self {
            table_name: table_name.into(),
            schema_name: None,
            columns: Vec::new(),
            sync_direction: SyncDirection::default(),
        }
    }

    pub fn with_schema(mut self, schema_name: impl Into<String>) -> Self {
        self.schema_name = Some(schema_name.into());
        self
    }

    pub fn with_columns<I, S>(mut self, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.columns = columns.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_direction(mut self, direction: SyncDirection) -> Self {
        self.sync_direction = direction;
        self
    }
}

impl From<&str> for SetupTable {
    fn from(name: &str) -> Self {
        match name.split_once('.') {
            Some((schema, table)) => SetupTable::new(table).with_schema(schema),
            None => SetupTable::new(name),
        }
    }
}

impl From<String> for SetupTable {
    fn from(name: String) -> Self {
        SetupTable::from(name.as_str())
    }
}

/// A named parameter a filter compares columns against
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FilterParameter {
    pub name: String,
    pub data_type: String,
    #[serde(default)]
    pub allow_null: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_value: Option<serde_json::Value>,
}

/// `table.column = @parameter`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilterWhere {
    pub table_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schema_name: Option<String>,
    pub column_name: String,
    pub parameter_name: String,
}

/// Row filter restricting which rows of a table a scope receives
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SetupFilter {
    pub table_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schema_name: Option<String>,
    #[serde(default)]
    pub parameters: Vec<FilterParameter>,
    #[serde(default)]
    pub wheres: Vec<FilterWhere>,
    /// Provider specific where clauses, passed through verbatim
    #[serde(default)]
    pub custom_wheres: Vec<String>,
}

impl SetupFilter {
    pub fn new(table_name: impl Into<String>) -> Self {
        Self {
            table_name: table_name.into(),
            schema_name: None,
            parameters: Vec::new(),
            wheres: Vec::new(),
            custom_wheres: Vec::new(),
        }
    }

    pub fn with_schema(mut self, schema_name: impl Into<String>) -> Self {
        self.schema_name = Some(schema_name.into());
        self
    }

    /// Filter rows of the filtered table on `column = @column`
    pub fn with_column_parameter(mut self, column: impl Into<String>, data_type: impl Into<String>) -> Self {
        let column = column.into();
        self.parameters.push(FilterParameter {
            name: column.clone(),
            data_type: data_type.into(),
            allow_null: false,
            default_value: None,
        });
        self.wheres.push(FilterWhere {
            table_name: self.table_name.clone(),
            schema_name: self.schema_name.clone(),
            column_name: column.clone(),
            parameter_name: column,
        });
        self
    }

    pub fn with_parameter(mut self, parameter: FilterParameter) -> Self {
        self.parameters.push(parameter);
        self
    }

    pub fn with_where(mut self, clause: FilterWhere) -> Self {
        self.wheres.push(clause);
        self
    }

    pub fn with_custom_where(mut self, clause: impl Into<String>) -> Self {
        self.custom_wheres.push(clause.into());
        self
    }

    pub fn has_parameters(&self) -> bool {
        !self.parameters.is_empty()
    }

    pub fn parameter(&self, name: &str) -> Option<&FilterParameter> {
        self.parameters.iter().find(|p| same_name(&p.name, name))
    }
}
