//! Selecting changed rows into batch part files
//!
//! Tables are scanned parents first. When the provider can stream several
//! result sets over one connection, up to `max_parallel_tables` scans run
//! concurrently; results are reordered by table position afterwards so the
//! batch layout does not depend on scheduling.
//!
//! Before each write the part's final size is projected; a row that would
//! push the part over the batch size starts a new part instead.

use std::path::Path;

use futures::stream::{self, StreamExt};
use uuid::Uuid;

use super::{DatabaseChangesSelected, SyncRow, TableChangesSelected};
use crate::batch::{BatchInfo, BatchPartInfo, BatchPartWriter, SerializerFactory};
use crate::error::{Result, SyncError};
use crate::orchestrator::{Orchestrator, SyncEvent};
use crate::provider::{DbConnection, SelectChangesKind, SelectChangesQuery};
use crate::schema::{SyncSet, SyncTable, TableRef};
use crate::types::SyncParameters;

/// What to select for a scope
#[derive(Debug, Clone)]
pub(crate) struct ChangesRequest {
    /// Rows last written on behalf of this scope are skipped
    pub scope_id: Uuid,
    /// A new scope gets every live row instead of the changes
    pub is_new: bool,
    pub last_timestamp: Option<i64>,
    pub parameters: SyncParameters,
}

/// File name stem of a table's parts
///
/// Sanitizing can map two tables to the same name ("Order Lines" and
/// "Order_Lines"), so the stem ends with the table's scan position.
fn part_stem(table: &TableRef, position: usize) -> String {
    let name: String = table
        .to_string()
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { '_' })
        .collect();
    format!("{}_{}", name, position)
}

/// Outcome of one table scan
struct TableSelection {
    position: usize,
    parts: Vec<BatchPartInfo>,
    changes: TableChangesSelected,
}

/// Writes the rows of one table into size bounded parts
struct PartSink<'a> {
    serializer: &'a dyn SerializerFactory,
    directory: &'a Path,
    table: TableRef,
    stem: String,
    max_size: usize,
    sequence: usize,
    writer: Option<(String, Box<dyn BatchPartWriter>)>,
    parts: Vec<BatchPartInfo>,
}

impl<'a> PartSink<'a> {
    fn new(
        serializer: &'a dyn SerializerFactory,
        directory: &'a Path,
        table: TableRef,
        position: usize,
        max_size: usize,
    ) -> Self {
        Self {
            serializer,
            directory,
            stem: part_stem(&table, position),
            table,
            max_size,
            sequence: 0,
            writer: None,
            parts: Vec::new(),
        }
    }

    async fn open_part(&mut self) -> Result<()> {
        let file_name = format!("{}_{:04}.{}", self.stem, self.sequence, self.serializer.extension());
        self.sequence += 1;
        let writer = self
            .serializer
            .create_writer(&self.directory.join(&file_name), &self.table)
            .await?;
        self.writer = Some((file_name, writer));
        Ok(())
    }

    /// Close the current part; a part without rows is deleted
    async fn close_part(&mut self) -> Result<()> {
        let Some((file_name, mut writer)) = self.writer.take() else {
            return Ok(());
        };
        writer.close().await?;
        let rows = writer.rows_count();
        if rows > 0 {
            self.parts.push(BatchPartInfo::new(file_name, &self.table, rows));
        } else {
            match tokio::fs::remove_file(self.directory.join(&file_name)).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    fn projection(&self, row: &SyncRow) -> Result<(usize, u64)> {
        let (_, writer) = self
            .writer
            .as_ref()
            .ok_or_else(|| SyncError::Internal("no open batch part".to_string()))?;
        Ok((writer.current_size() + writer.row_size(row)?, writer.rows_count()))
    }

    async fn write(&mut self, row: &SyncRow) -> Result<()> {
        if self.writer.is_none() {
            self.open_part().await?;
        }

        let (projected, rows) = self.projection(row)?;
        if projected > self.max_size && rows > 0 {
            self.close_part().await?;
            self.open_part().await?;
        }

        let (projected, _) = self.projection(row)?;
        if projected > self.max_size {
            return Err(SyncError::RowTooLarge {
                table: self.table.to_string(),
                size: projected,
                max: self.max_size,
            });
        }

        let (_, writer) = self
            .writer
            .as_mut()
            .ok_or_else(|| SyncError::Internal("no open batch part".to_string()))?;
        writer.write_row(row).await
    }

    async fn finish(mut self) -> Result<Vec<BatchPartInfo>> {
        self.close_part().await?;
        Ok(self.parts)
    }

    /// Close without recording anything, used when the scan failed
    async fn abort(mut self) {
        if let Err(e) = self.close_part().await {
            tracing::warn!("Closing a part of {} failed: {}", self.table, e);
        }
    }
}

impl Orchestrator {
    /// Tables whose rows leave this side, parents first
    fn selectable_tables<'s>(&self, schema: &'s SyncSet) -> Vec<&'s SyncTable> {
        let way = self.side.selecting_way();
        schema
            .sort_by_dependencies()
            .into_iter()
            .filter(|t| t.sync_direction.allows(way))
            .collect()
    }

    fn select_query(&self, table: &SyncTable, request: &ChangesRequest) -> SelectChangesQuery {
        let has_filter = self
            .setup
            .has_filter(&table.table_name, table.schema_name.as_deref());
        SelectChangesQuery {
            kind: SelectChangesKind::for_scope(request.is_new, has_filter),
            last_timestamp: request.last_timestamp,
            scope_id: request.scope_id,
            parameters: request.parameters.clone(),
        }
    }

    /// Select the changes of every table into `batch`
    ///
    /// The batch directory is created, filled and summarized; on failure it
    /// is removed again.
    pub(crate) async fn select_changes(
        &self,
        conn: &dyn DbConnection,
        schema: &SyncSet,
        request: &ChangesRequest,
        mut batch: BatchInfo,
    ) -> Result<(BatchInfo, DatabaseChangesSelected)> {
        for table in &schema.tables {
            table.ensure_provisionable()?;
        }
        let tables = self.selectable_tables(schema);
        let directory = batch.directory_path();
        tokio::fs::create_dir_all(&directory).await?;

        let scans = tables
            .iter()
            .enumerate()
            .map(|(position, table)| self.select_table(conn, position, table, request, &directory))
            .collect::<Vec<_>>();

        let results: Vec<Result<TableSelection>> = if self.provider.supports_multiple_active_result_sets() {
            stream::iter(scans)
                .buffer_unordered(self.options.max_parallel_tables)
                .collect()
                .await
        } else {
            let mut results = Vec::with_capacity(tables.len());
            for scan in scans {
                let result = scan.await;
                let failed = result.is_err();
                results.push(result);
                if failed {
                    break;
                }
            }
            results
        };

        let mut selections = Vec::with_capacity(results.len());
        let mut failure = None;
        for result in results {
            match result {
                Ok(selection) => selections.push(selection),
                Err(e) => {
                    // Cancellation of one scan is reported only if nothing worse happened
                    if failure.is_none() || matches!(failure, Some(SyncError::Cancelled)) {
                        failure = Some(e);
                    }
                }
            }
        }
        if let Some(e) = failure {
            if let Err(cleanup) = batch.remove_directory().await {
                tracing::warn!("Removing batch directory {} failed: {}", directory.display(), cleanup);
            }
            return Err(e);
        }

        selections.sort_by_key(|s| s.position);
        let mut changes = DatabaseChangesSelected::default();
        batch.parts.clear();
        for selection in selections {
            batch.parts.extend(selection.parts);
            changes.tables.push(selection.changes);
        }
        batch.serializer = self.serializer.key().to_string();
        batch.renumber();
        batch.save_summary().await?;

        tracing::info!(
            "Selected {} changes in {} parts on the {} side",
            changes.total_changes_selected(),
            batch.parts.len(),
            self.side
        );
        self.intercept(SyncEvent::DatabaseChangesSelected {
            changes: changes.clone(),
            parts: batch.parts.len(),
        });
        Ok((batch, changes))
    }

    async fn select_table(
        &self,
        conn: &dyn DbConnection,
        position: usize,
        table: &SyncTable,
        request: &ChangesRequest,
        directory: &Path,
    ) -> Result<TableSelection> {
        self.check_cancelled()?;
        let query = self.select_query(table, request);
        self.intercept(SyncEvent::TableChangesSelecting {
            table: table.full_name(),
            kind: query.kind,
        });

        let mut reader = self.adapter(table).select_changes(conn, &query).await?;
        let mut sink = PartSink::new(
            self.serializer.as_ref(),
            directory,
            table.table_ref(),
            position,
            self.options.batch_size_bytes(),
        );
        let mut changes = TableChangesSelected::new(&table.table_ref());

        loop {
            if self.cancellation.is_cancelled() {
                sink.abort().await;
                return Err(SyncError::Cancelled);
            }
            let record = match reader.read().await {
                Ok(Some(record)) => record,
                Ok(None) => break,
                Err(e) => {
                    sink.abort().await;
                    return Err(e);
                }
            };
            let row = SyncRow::from_record(table, &record);
            if let Err(e) = sink.write(&row).await {
                sink.abort().await;
                return Err(e);
            }
            changes.record(row.state);
        }

        let parts = sink.finish().await?;
        tracing::debug!(
            "Selected {} changes from {} into {} parts",
            changes.total_changes(),
            table.full_name(),
            parts.len()
        );
        self.intercept(SyncEvent::TableChangesSelected {
            changes: changes.clone(),
        });
        Ok(TableSelection {
            position,
            parts,
            changes,
        })
    }

    /// Count the changes a selection would return, writing nothing
    pub(crate) async fn estimate_changes(
        &self,
        conn: &dyn DbConnection,
        schema: &SyncSet,
        request: &ChangesRequest,
    ) -> Result<DatabaseChangesSelected> {
        let mut changes = DatabaseChangesSelected::default();
        for table in self.selectable_tables(schema) {
            self.check_cancelled()?;
            table.ensure_provisionable()?;
            let query = self.select_query(table, request);
            let mut reader = self.adapter(table).select_changes(conn, &query).await?;
            let mut stats = TableChangesSelected::new(&table.table_ref());
            while let Some(record) = reader.read().await? {
                stats.record(SyncRow::from_record(table, &record).state);
            }
            changes.tables.push(stats);
        }
        Ok(changes)
    }
}
