//! Batch part encoding
//!
//! The JSON part format is
//! `{"table":"Customer","schema":null,"rows":[[16,1,"Ada"],[8,2,null]]}`,
//! the first value of each row being its state code.

use std::path::Path;

use async_trait::async_trait;
use serde::Deserialize;
use tokio::io::{AsyncWriteExt, BufWriter};

use crate::changes::{RowState, SyncRow};
use crate::error::{Result, SyncError};
use crate::schema::TableRef;

/// Decoded content of one part file
#[derive(Debug, Clone, PartialEq)]
pub struct BatchPartContent {
    pub table: TableRef,
    pub rows: Vec<SyncRow>,
}

/// Streaming writer of one part file
#[async_trait]
pub trait BatchPartWriter: Send {
    /// Bytes `row` would add to the file
    fn row_size(&self, row: &SyncRow) -> Result<usize>;

    /// Bytes the file would hold if closed now
    fn current_size(&self) -> usize;

    fn rows_count(&self) -> u64;

    async fn write_row(&mut self, row: &SyncRow) -> Result<()>;

    /// Write the footer and flush; calling it twice is a no-op
    async fn close(&mut self) -> Result<()>;
}

/// Encoding of batch part files
#[async_trait]
pub trait SerializerFactory: Send + Sync {
    fn key(&self) -> &str;

    fn extension(&self) -> &str;

    async fn create_writer(&self, path: &Path, table: &TableRef) -> Result<Box<dyn BatchPartWriter>>;

    async fn read_part(&self, path: &Path) -> Result<BatchPartContent>;
}

/// Default JSON encoding
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonSerializerFactory;

#[async_trait]
impl SerializerFactory for JsonSerializerFactory {
    fn key(&self) -> &str {
        "json"
    }

    fn extension(&self) -> &str {
        "json"
    }

    async fn create_writer(&self, path: &Path, table: &TableRef) -> Result<Box<dyn BatchPartWriter>> {
        Ok(Box::new(JsonPartWriter::create(path, table).await?))
    }

    async fn read_part(&self, path: &Path) -> Result<BatchPartContent> {
        #[derive(Deserialize)]
        struct RawPart {
            table: String,
            schema: Option<String>,
            rows: Vec<Vec<serde_json::Value>>,
        }

        let content = tokio::fs::read(path).await?;
        let raw: RawPart = serde_json::from_slice(&content)?;
        let mut rows = Vec::with_capacity(raw.rows.len());
        for mut values in raw.rows {
            if values.is_empty() {
                return Err(SyncError::Batch(format!("empty row in {}", path.display())));
            }
            let code = values.remove(0);
            let state = code
                .as_u64()
                .and_then(RowState::from_code)
                .ok_or_else(|| SyncError::Batch(format!("invalid row state {} in {}", code, path.display())))?;
            rows.push(SyncRow::new(state, values));
        }
        Ok(BatchPartContent {
            table: TableRef::new(raw.table, raw.schema),
            rows,
        })
    }
}

const FOOTER: &[u8] = b"]}";

struct JsonPartWriter {
    writer: Option<BufWriter<tokio::fs::File>>,
    written: usize,
    rows: u64,
}

impl JsonPartWriter {
    async fn create(path: &Path, table: &TableRef) -> Result<Self> {
        let file = tokio::fs::File::create(path).await?;
        let mut writer = BufWriter::new(file);
        let header = format!(
            "{{\"table\":{},\"schema\":{},\"rows\":[",
            serde_json::to_string(&table.table_name)?,
            serde_json::to_string(&table.schema_name)?
        );
        writer.write_all(header.as_bytes()).await?;
        Ok(Self {
            writer: Some(writer),
            written: header.len(),
            rows: 0,
        })
    }

    fn encode(row: &SyncRow) -> Result<Vec<u8>> {
        let mut values = Vec::with_capacity(row.values.len() + 1);
        values.push(serde_json::Value::from(row.state.code()));
        values.extend(row.values.iter().cloned());
        Ok(serde_json::to_vec(&values)?)
    }
}

#[async_trait]
impl BatchPartWriter for JsonPartWriter {
    fn row_size(&self, row: &SyncRow) -> Result<usize> {
        let separator = usize::from(self.rows > 0);
        Ok(Self::encode(row)?.len() + separator)
    }

    fn current_size(&self) -> usize {
        self.written + FOOTER.len()
    }

    fn rows_count(&self) -> u64 {
        self.rows
    }

    async fn write_row(&mut self, row: &SyncRow) -> Result<()> {
        let encoded = Self::encode(row)?;
        let writer = self
            .writer
            .as_mut()
            .ok_or_else(|| SyncError::Batch("part file is already closed".to_string()))?;
        if self.rows > 0 {
            writer.write_all(b",").await?;
            self.written += 1;
        }
        writer.write_all(&encoded).await?;
        self.written += encoded.len();
        self.rows += 1;
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        if let Some(mut writer) = self.writer.take() {
            writer.write_all(FOOTER).await?;
            writer.flush().await?;
            writer.into_inner().sync_all().await?;
        }
        Ok(())
    }
}
