//! Parquet sink: a directory of part files written with Arrow.
//!
//! The type lattice maps onto Arrow logical types (timestamps as 64-bit UTC
//! milliseconds, dates as 32-bit day offsets, decimals as fixed-width
//! Decimal128), repeated fields become `List` columns and structs become
//! group fields. Rows are staged as JSON objects and decoded through
//! `arrow-json` into `RecordBatch`es, which an `ArrowWriter` flushes with
//! snappy compression by default.
//!
//! The target path is a directory: `append` adds a `part-<uuid>.parquet`
//! file, `overwrite` removes the existing parts first, `fail_if_exists`
//! refuses when any part is present.

use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use arrow_json::ReaderBuilder;
use arrow_schema::{DataType, Field, Schema as ArrowSchema, SchemaRef, TimeUnit};
use async_trait::async_trait;
use parquet::arrow::ArrowWriter;
use parquet::basic::{Compression, ZstdLevel};
use parquet::file::properties::WriterProperties;
use tracing::{info, warn};
use uuid::Uuid;

use xsink_core::{
    ColumnNamer, DataKind, FieldDef, ParquetCompression, ParquetSpec, Record, RecordSink,
    SanitizeRules, Schema, TableShape, WriteSummary, XsinkError,
};

use crate::convert::{cell_to_json, coerce_cell, flatten_pairs, JsonStyle};

/// Parquet accepts long identifiers and is case-sensitive.
const PARQUET_RULES: SanitizeRules = SanitizeRules::new(0, false);

struct PlannedColumn {
    /// Source element name the column is fed from.
    source: String,
    /// Assigned (sanitized, de-duplicated) column name.
    column: String,
    field: FieldDef,
}

pub struct ParquetSink {
    dir: PathBuf,
    shape: TableShape,
    mode: xsink_core::WriteMode,
    compression: ParquetCompression,
    batch_size: usize,
    columns: Vec<PlannedColumn>,
    arrow_schema: SchemaRef,
    writer: Option<ArrowWriter<File>>,
    staged: Vec<serde_json::Value>,
    rows: u64,
    dropped: u64,
}

impl ParquetSink {
    pub fn new(schema: &Schema, spec: &ParquetSpec) -> ParquetSink {
        // Column names are fixed eagerly so the mapping is stable for the
        // whole run.
        let mut namer = ColumnNamer::new(PARQUET_RULES);
        let columns: Vec<PlannedColumn> = schema
            .fields
            .iter()
            .map(|f| PlannedColumn {
                source: f.name.clone(),
                column: namer.assign(&f.name),
                field: f.clone(),
            })
            .collect();
        let arrow_schema = Arc::new(plan_arrow_schema(&columns, spec.shape));
        ParquetSink {
            dir: PathBuf::from(&spec.path),
            shape: spec.shape,
            mode: spec.mode,
            compression: spec.compression,
            batch_size: spec.batch_size.max(1),
            columns,
            arrow_schema,
            writer: None,
            staged: Vec::new(),
            rows: 0,
            dropped: 0,
        }
    }

    pub fn arrow_schema(&self) -> SchemaRef {
        self.arrow_schema.clone()
    }

    fn existing_parts(dir: &Path) -> Result<Vec<PathBuf>> {
        let mut parts = Vec::new();
        if dir.is_dir() {
            for entry in std::fs::read_dir(dir).with_context(|| format!("read {}", dir.display()))? {
                let path = entry?.path();
                if path.extension().is_some_and(|ext| ext == "parquet") {
                    parts.push(path);
                }
            }
        }
        Ok(parts)
    }

    fn flush_batch(&mut self) -> Result<()> {
        if self.staged.is_empty() {
            return Ok(());
        }
        let mut decoder = ReaderBuilder::new(self.arrow_schema.clone())
            .with_batch_size(self.batch_size)
            .build_decoder()?;
        decoder.serialize(&self.staged)?;
        let writer = self
            .writer
            .as_mut()
            .ok_or_else(|| anyhow::anyhow!("parquet sink used before begin"))?;
        while let Some(batch) = decoder.flush()? {
            writer.write(&batch)?;
        }
        self.staged.clear();
        Ok(())
    }
}

#[async_trait]
impl RecordSink for ParquetSink {
    fn name(&self) -> &str {
        "parquet"
    }

    async fn begin(&mut self) -> Result<()> {
        std::fs::create_dir_all(&self.dir)
            .with_context(|| format!("create {}", self.dir.display()))?;
        let parts = Self::existing_parts(&self.dir)?;
        match self.mode {
            xsink_core::WriteMode::FailIfExists if !parts.is_empty() => {
                return Err(XsinkError::Conflict(format!(
                    "{} already holds {} part file(s)",
                    self.dir.display(),
                    parts.len()
                ))
                .into());
            }
            xsink_core::WriteMode::Overwrite => {
                for part in &parts {
                    std::fs::remove_file(part)
                        .with_context(|| format!("remove {}", part.display()))?;
                }
            }
            _ => {}
        }

        let part = self.dir.join(format!("part-{}.parquet", Uuid::new_v4()));
        let file = File::create(&part).with_context(|| format!("create {}", part.display()))?;
        let compression = match self.compression {
            ParquetCompression::Snappy => Compression::SNAPPY,
            ParquetCompression::Zstd => Compression::ZSTD(ZstdLevel::default()),
            ParquetCompression::None => Compression::UNCOMPRESSED,
        };
        let props = WriterProperties::builder()
            .set_compression(compression)
            .build();
        self.writer = Some(ArrowWriter::try_new(file, self.arrow_schema.clone(), Some(props))?);
        info!("parquet sink opened: {}", part.display());
        Ok(())
    }

    async fn write(&mut self, record: Record) -> Result<()> {
        let mut row = serde_json::Map::new();
        match self.shape {
            TableShape::Columnar => {
                for planned in &self.columns {
                    if planned.source != record.name {
                        continue;
                    }
                    match coerce_cell(&planned.field, &record.tree, JsonStyle::Exact) {
                        Ok(cell) => {
                            row.insert(planned.column.clone(), cell_to_json(&cell, JsonStyle::Exact));
                        }
                        Err(e) => {
                            warn!("dropping cell: {e}");
                            self.dropped += 1;
                        }
                    }
                }
            }
            TableShape::Flattened => {
                let pairs: Vec<serde_json::Value> = flatten_pairs(&record.tree)
                    .into_iter()
                    .map(|(name, value)| serde_json::json!({ "name": name, "value": value }))
                    .collect();
                row.insert("fields".to_string(), serde_json::Value::Array(pairs));
            }
        }
        self.staged.push(serde_json::Value::Object(row));
        self.rows += 1;
        if self.staged.len() >= self.batch_size {
            self.flush_batch()?;
        }
        Ok(())
    }

    async fn finish(&mut self) -> Result<WriteSummary> {
        self.flush_batch()?;
        if let Some(writer) = self.writer.take() {
            writer.close()?;
        }
        info!(rows = self.rows, dropped = self.dropped, "parquet sink closed");
        Ok(WriteSummary {
            rows_written: self.rows,
            cells_dropped: self.dropped,
        })
    }
}

fn plan_arrow_schema(columns: &[PlannedColumn], shape: TableShape) -> ArrowSchema {
    match shape {
        TableShape::Columnar => ArrowSchema::new(
            columns
                .iter()
                .map(|planned| Field::new(&planned.column, plan_type(&planned.field), true))
                .collect::<Vec<_>>(),
        ),
        TableShape::Flattened => {
            let pair = DataType::Struct(
                vec![
                    Field::new("name", DataType::Utf8, true),
                    Field::new("value", DataType::Utf8, true),
                ]
                .into(),
            );
            ArrowSchema::new(vec![Field::new(
                "fields",
                DataType::List(Arc::new(Field::new("item", pair, true))),
                true,
            )])
        }
    }
}

/// The field's column type: its kind's arrow type, wrapped in a `List` when
/// the element repeats.
fn plan_type(field: &FieldDef) -> DataType {
    let base = arrow_type(&field.kind);
    if field.repeating && !matches!(field.kind, DataKind::Array(_)) {
        DataType::List(Arc::new(Field::new("item", base, true)))
    } else {
        base
    }
}

fn arrow_type(kind: &DataKind) -> DataType {
    match kind {
        DataKind::Str => DataType::Utf8,
        DataKind::I32 => DataType::Int32,
        DataKind::I64 => DataType::Int64,
        DataKind::F64 => DataType::Float64,
        DataKind::Bool => DataType::Boolean,
        DataKind::Date => DataType::Date32,
        // 64-bit time-of-day carrier; values parse from HH:MM:SS strings.
        DataKind::Time => DataType::Time64(TimeUnit::Microsecond),
        DataKind::Timestamp => DataType::Timestamp(TimeUnit::Millisecond, Some("UTC".into())),
        DataKind::Decimal { precision, scale } => {
            DataType::Decimal128(*precision, *scale as i8)
        }
        DataKind::Array(inner) => {
            DataType::List(Arc::new(Field::new("item", arrow_type(inner), true)))
        }
        DataKind::Struct(fields) => DataType::Struct(
            fields
                .iter()
                .map(|f| Field::new(&f.name, plan_type(f), true))
                .collect::<Vec<_>>()
                .into(),
        ),
    }
}
