//! Captured rows and change statistics

mod apply;
mod selector;

pub(crate) use selector::ChangesRequest;

use serde::{Deserialize, Serialize};

use crate::schema::{SyncTable, TableRef};

pub use crate::schema::TOMBSTONE_COLUMN;

/// State of a captured row, encoded with its on-disk code
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RowState {
    /// Upsert
    Modified,
    /// Tombstone
    Deleted,
}

impl RowState {
    pub fn code(&self) -> u8 {
        match self {
            RowState::Modified => 16,
            RowState::Deleted => 8,
        }
    }

    pub fn from_code(code: u64) -> Option<Self> {
        match code {
            16 => Some(RowState::Modified),
            8 => Some(RowState::Deleted),
            _ => None,
        }
    }
}

fn is_truthy(value: &serde_json::Value) -> bool {
    match value {
        serde_json::Value::Bool(b) => *b,
        serde_json::Value::Number(n) => n.as_i64().is_some_and(|n| n != 0),
        serde_json::Value::String(s) => s == "1" || s.eq_ignore_ascii_case("true"),
        _ => false,
    }
}

/// One captured row, values aligned to the table's column order
#[derive(Debug, Clone, PartialEq)]
pub struct SyncRow {
    pub state: RowState,
    pub values: Vec<serde_json::Value>,
}

impl SyncRow {
    pub fn new(state: RowState, values: Vec<serde_json::Value>) -> Self {
        Self { state, values }
    }

    /// Build a row from a selection record, the tombstone marker deciding its state
    pub fn from_record(table: &SyncTable, record: &serde_json::Map<String, serde_json::Value>) -> Self {
        let state = match record.get(TOMBSTONE_COLUMN) {
            Some(marker) if is_truthy(marker) => RowState::Deleted,
            _ => RowState::Modified,
        };
        let values = table
            .columns
            .iter()
            .map(|column| {
                record
                    .get(&column.name)
                    .or_else(|| {
                        record
                            .iter()
                            .find(|(key, _)| key.eq_ignore_ascii_case(&column.name))
                            .map(|(_, value)| value)
                    })
                    .cloned()
                    .unwrap_or(serde_json::Value::Null)
            })
            .collect();
        Self { state, values }
    }

    pub fn value(&self, table: &SyncTable, column: &str) -> Option<&serde_json::Value> {
        table.column_index(column).and_then(|i| self.values.get(i))
    }

    /// Primary key values, in key order
    pub fn primary_key(&self, table: &SyncTable) -> Vec<serde_json::Value> {
        table
            .primary_key_indexes()
            .into_iter()
            .map(|i| self.values.get(i).cloned().unwrap_or(serde_json::Value::Null))
            .collect()
    }
}

/// Rows selected from one table
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableChangesSelected {
    pub table_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schema_name: Option<String>,
    pub upserts: u64,
    pub deletes: u64,
}

impl TableChangesSelected {
    pub fn new(table: &TableRef) -> Self {
        Self {
            table_name: table.table_name.clone(),
            schema_name: table.schema_name.clone(),
            upserts: 0,
            deletes: 0,
        }
    }

    pub fn record(&mut self, state: RowState) {
        match state {
            RowState::Modified => self.upserts += 1,
            RowState::Deleted => self.deletes += 1,
        }
    }

    pub fn total_changes(&self) -> u64 {
        self.upserts + self.deletes
    }
}

/// Rows selected from a database
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatabaseChangesSelected {
    pub tables: Vec<TableChangesSelected>,
}

impl DatabaseChangesSelected {
    pub fn total_upserts(&self) -> u64 {
        self.tables.iter().map(|t| t.upserts).sum()
    }

    pub fn total_deletes(&self) -> u64 {
        self.tables.iter().map(|t| t.deletes).sum()
    }

    pub fn total_changes_selected(&self) -> u64 {
        self.total_upserts() + self.total_deletes()
    }

    pub fn table(&self, table_name: &str) -> Option<&TableChangesSelected> {
        self.tables
            .iter()
            .find(|t| t.table_name.eq_ignore_ascii_case(table_name))
    }
}

/// Rows of one state applied to one table
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableChangesApplied {
    pub table_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schema_name: Option<String>,
    pub state: RowState,
    pub applied: u64,
    pub failed: u64,
    pub resolved_conflicts: u64,
}

impl TableChangesApplied {
    pub fn new(table: &TableRef, state: RowState) -> Self {
        Self {
            table_name: table.table_name.clone(),
            schema_name: table.schema_name.clone(),
            state,
            applied: 0,
            failed: 0,
            resolved_conflicts: 0,
        }
    }
}

/// Rows applied to a database
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatabaseChangesApplied {
    pub tables: Vec<TableChangesApplied>,
}

impl DatabaseChangesApplied {
    pub fn total_applied(&self) -> u64 {
        self.tables.iter().map(|t| t.applied).sum()
    }

    pub fn total_failed(&self) -> u64 {
        self.tables.iter().map(|t| t.failed).sum()
    }

    pub fn total_resolved_conflicts(&self) -> u64 {
        self.tables.iter().map(|t| t.resolved_conflicts).sum()
    }
}

/// Tracking metadata purged from a database
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatabaseMetadatasCleaned {
    /// Metadata older than or at this timestamp was purged
    pub timestamp: i64,
    pub tables: Vec<(TableRef, u64)>,
}

impl DatabaseMetadatasCleaned {
    pub fn rows_cleaned(&self) -> u64 {
        self.tables.iter().map(|(_, rows)| rows).sum()
    }
}
