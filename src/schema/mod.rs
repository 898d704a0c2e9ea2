//! In-memory schema of the synchronized tables
//!
//! A `SyncSet` is what the orchestrators provision and select changes for.
//! It is read from the database through the provider's `DatabaseBuilder`
//! (restricted to what the `SyncSetup` declares), serialized into the scope
//! table, and compared across scope generations by the migration engine.

mod order;
mod setup;

pub use setup::{FilterParameter, FilterWhere, SetupFilter, SetupTable, SyncSetup};

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{Result, SyncError};
use crate::types::SyncDirection;

/// Marker column returned by change selection commands
pub const TOMBSTONE_COLUMN: &str = "sync_row_is_tombstone";

/// Case-insensitive identifier comparison
pub(crate) fn same_name(a: &str, b: &str) -> bool {
    a.eq_ignore_ascii_case(b)
}

/// Schema namespaces match when equal, an empty namespace matching none
pub(crate) fn same_schema(a: Option<&str>, b: Option<&str>) -> bool {
    let a = a.filter(|s| !s.is_empty());
    let b = b.filter(|s| !s.is_empty());
    match (a, b) {
        (None, None) => true,
        (Some(a), Some(b)) => same_name(a, b),
        _ => false,
    }
}

/// Fully qualified name of a table
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TableRef {
    pub table_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schema_name: Option<String>,
}

impl TableRef {
    pub fn new(table_name: impl Into<String>, schema_name: Option<String>) -> Self {
        Self {
            table_name: table_name.into(),
            schema_name,
        }
    }

    pub fn matches(&self, table_name: &str, schema_name: Option<&str>) -> bool {
        same_name(&self.table_name, table_name)
            && same_schema(self.schema_name.as_deref(), schema_name)
    }
}

impl fmt::Display for TableRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.schema_name.as_deref().filter(|s| !s.is_empty()) {
            Some(schema) => write!(f, "{}.{}", schema, self.table_name),
            None => write!(f, "{}", self.table_name),
        }
    }
}

/// A column of a synchronized table
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncColumn {
    pub name: String,
    pub data_type: String,
    #[serde(default)]
    pub allow_null: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_length: Option<u32>,
    #[serde(default)]
    pub is_auto_increment: bool,
}

impl SyncColumn {
    pub fn new(name: impl Into<String>, data_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            data_type: data_type.into(),
            allow_null: false,
            max_length: None,
            is_auto_increment: false,
        }
    }

    pub fn nullable(mut self) -> Self {
        self.allow_null = true;
        self
    }

    pub fn with_max_length(mut self, max_length: u32) -> Self {
        self.max_length = Some(max_length);
        self
    }
}

/// A synchronized table: columns, primary key and direction
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncTable {
    pub table_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schema_name: Option<String>,
    #[serde(default)]
    pub columns: Vec<SyncColumn>,
    #[serde(default)]
    pub primary_keys: Vec<String>,
    #[serde(default)]
    pub sync_direction: SyncDirection,
}

impl SyncTable {
    pub fn new(table_name: impl Into<String>) -> Self {
        Self {
            table_name: table_name.into(),
            schema_name: None,
            columns: Vec::new(),
            primary_keys: Vec::new(),
            sync_direction: SyncDirection::default(),
        }
    }

    pub fn with_schema(mut self, schema_name: impl Into<String>) -> Self {
        self.schema_name = Some(schema_name.into());
        self
    }

    pub fn with_column(mut self, column: SyncColumn) -> Self {
        self.columns.push(column);
        self
    }

    /// Add a column that is also part of the primary key
    pub fn with_key_column(mut self, column: SyncColumn) -> Self {
        self.primary_keys.push(column.name.clone());
        self.columns.push(column);
        self
    }

    pub fn with_direction(mut self, direction: SyncDirection) -> Self {
        self.sync_direction = direction;
        self
    }

    pub fn table_ref(&self) -> TableRef {
        TableRef::new(self.table_name.clone(), self.schema_name.clone())
    }

    /// `schema.table`, or `table` without a namespace
    pub fn full_name(&self) -> String {
        self.table_ref().to_string()
    }

    pub fn matches(&self, table_name: &str, schema_name: Option<&str>) -> bool {
        same_name(&self.table_name, table_name)
            && same_schema(self.schema_name.as_deref(), schema_name)
    }

    pub fn column(&self, name: &str) -> Option<&SyncColumn> {
        self.columns.iter().find(|c| same_name(&c.name, name))
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| same_name(&c.name, name))
    }

    pub fn has_column(&self, name: &str) -> bool {
        self.column(name).is_some()
    }

    /// Column positions of the primary key, in key order
    pub fn primary_key_indexes(&self) -> Vec<usize> {
        self.primary_keys
            .iter()
            .filter_map(|key| self.column_index(key))
            .collect()
    }

    /// Fail unless the table can be provisioned and have its changes selected
    pub fn ensure_provisionable(&self) -> Result<()> {
        if self.columns.is_empty() {
            return Err(SyncError::MissingColumns(self.full_name()));
        }
        if self.primary_keys.is_empty() {
            return Err(SyncError::MissingPrimaryKey(self.full_name()));
        }
        for key in &self.primary_keys {
            if !self.has_column(key) {
                return Err(SyncError::MissingColumn {
                    table: self.full_name(),
                    column: key.clone(),
                });
            }
        }
        Ok(())
    }
}

/// A foreign key from a child table to its parent
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncRelation {
    pub name: String,
    pub child: TableRef,
    #[serde(default)]
    pub child_keys: Vec<String>,
    pub parent: TableRef,
    #[serde(default)]
    pub parent_keys: Vec<String>,
}

impl SyncRelation {
    pub fn new(name: impl Into<String>, child: TableRef, parent: TableRef) -> Self {
        Self {
            name: name.into(),
            child,
            child_keys: Vec::new(),
            parent,
            parent_keys: Vec::new(),
        }
    }

    pub fn with_keys(mut self, child_key: impl Into<String>, parent_key: impl Into<String>) -> Self {
        self.child_keys.push(child_key.into());
        self.parent_keys.push(parent_key.into());
        self
    }
}

/// The set of synchronized tables and their relations
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncSet {
    #[serde(default)]
    pub tables: Vec<SyncTable>,
    #[serde(default)]
    pub relations: Vec<SyncRelation>,
}

impl SyncSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_table(mut self, table: SyncTable) -> Self {
        self.tables.push(table);
        self
    }

    pub fn with_relation(mut self, relation: SyncRelation) -> Self {
        self.relations.push(relation);
        self
    }

    pub fn has_tables(&self) -> bool {
        !self.tables.is_empty()
    }

    pub fn table(&self, table_name: &str, schema_name: Option<&str>) -> Option<&SyncTable> {
        self.tables
            .iter()
            .find(|t| t.matches(table_name, schema_name))
    }

    pub fn table_by_ref(&self, table: &TableRef) -> Option<&SyncTable> {
        self.table(&table.table_name, table.schema_name.as_deref())
    }

    /// Fail unless every table can be provisioned
    pub fn ensure_valid(&self) -> Result<()> {
        if !self.has_tables() {
            return Err(SyncError::MissingTables);
        }
        for table in &self.tables {
            table.ensure_provisionable()?;
        }
        Ok(())
    }
}
