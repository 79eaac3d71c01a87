//! Warehouse sink: HTTP-style batch inserts into a project/dataset/table
//! hierarchy.
//!
//! The sink speaks to the warehouse through the narrow [`WarehouseApi`]
//! trait, so tests run against an in-memory fake. The shipped implementation
//! ([`HttpWarehouse`]) drives a REST endpoint with JSON payloads.
//!
//! Every leaf scalar is treated as its widest native type: I32 inserts as
//! INT64 and Decimal as FLOAT64. This is a documented simplification.

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::json;
use tracing::{info, warn};

use xsink_core::{
    ColumnNamer, DataKind, FieldDef, Record, RecordSink, SanitizeRules, Schema, TableShape,
    WarehouseSpec, WriteMode, WriteSummary, XsinkError,
};

use crate::convert::{cell_to_json, coerce_cell, flatten_pairs, JsonStyle};

const WAREHOUSE_RULES: SanitizeRules = SanitizeRules::new(128, false);

/// Write protocol of the warehouse, kept narrow so tests can substitute an
/// in-memory implementation.
#[async_trait]
pub trait WarehouseApi: Send {
    async fn table_exists(&mut self, table: &str) -> Result<bool>;
    /// Creates the table with the given schema document. Idempotent: an
    /// already-existing table is not an error.
    async fn create_table(&mut self, table: &str, schema: &serde_json::Value) -> Result<()>;
    async fn truncate(&mut self, table: &str) -> Result<()>;
    async fn insert_rows(&mut self, table: &str, rows: &[serde_json::Value]) -> Result<()>;
}

/// REST implementation of [`WarehouseApi`].
pub struct HttpWarehouse {
    client: reqwest::Client,
    tables_url: String,
    project: String,
    dataset: String,
    token: Option<String>,
}

impl HttpWarehouse {
    pub fn new(spec: &WarehouseSpec) -> Result<HttpWarehouse> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(spec.timeout_secs))
            .build()
            .context("build warehouse http client")?;
        Ok(HttpWarehouse {
            client,
            tables_url: format!(
                "{}/projects/{}/datasets/{}/tables",
                spec.endpoint.trim_end_matches('/'),
                spec.project,
                spec.dataset
            ),
            project: spec.project.clone(),
            dataset: spec.dataset.clone(),
            token: spec.token.clone(),
        })
    }

    fn authed(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.token {
            Some(token) => req.bearer_auth(token),
            None => req,
        }
    }
}

#[derive(Debug, Deserialize)]
struct InsertResponse {
    #[serde(default, rename = "insertErrors")]
    insert_errors: Vec<InsertError>,
}

#[derive(Debug, Deserialize)]
struct InsertError {
    #[serde(default)]
    index: u64,
    #[serde(default)]
    errors: Vec<InsertErrorDetail>,
}

#[derive(Debug, Deserialize)]
struct InsertErrorDetail {
    #[serde(default)]
    message: String,
}

#[async_trait]
impl WarehouseApi for HttpWarehouse {
    async fn table_exists(&mut self, table: &str) -> Result<bool> {
        let url = format!("{}/{table}", self.tables_url);
        let response = self
            .authed(self.client.get(&url))
            .send()
            .await
            .map_err(|e| XsinkError::Sink(format!("warehouse unreachable: {e}")))?;
        match response.status() {
            StatusCode::NOT_FOUND => Ok(false),
            status if status.is_success() => Ok(true),
            status => Err(XsinkError::Sink(format!(
                "table lookup failed with status {status}"
            ))
            .into()),
        }
    }

    async fn create_table(&mut self, table: &str, schema: &serde_json::Value) -> Result<()> {
        let body = json!({
            "tableReference": {
                "projectId": self.project,
                "datasetId": self.dataset,
                "tableId": table,
            },
            "schema": schema,
        });
        let response = self
            .authed(self.client.post(&self.tables_url))
            .json(&body)
            .send()
            .await
            .map_err(|e| XsinkError::Sink(format!("warehouse unreachable: {e}")))?;
        // 409 means the table is already there; creation is idempotent.
        if response.status().is_success() || response.status() == StatusCode::CONFLICT {
            Ok(())
        } else {
            Err(XsinkError::Sink(format!(
                "table create failed with status {}",
                response.status()
            ))
            .into())
        }
    }

    async fn truncate(&mut self, table: &str) -> Result<()> {
        let url = format!("{}/{table}:truncate", self.tables_url);
        let response = self
            .authed(self.client.post(&url))
            .send()
            .await
            .map_err(|e| XsinkError::Sink(format!("warehouse unreachable: {e}")))?;
        if response.status().is_success() {
            Ok(())
        } else {
            Err(XsinkError::Sink(format!(
                "truncate failed with status {}",
                response.status()
            ))
            .into())
        }
    }

    async fn insert_rows(&mut self, table: &str, rows: &[serde_json::Value]) -> Result<()> {
        let url = format!("{}/{table}/insertAll", self.tables_url);
        let body = json!({
            "rows": rows.iter().map(|r| json!({ "json": r })).collect::<Vec<_>>(),
        });
        let response = self
            .authed(self.client.post(&url))
            .json(&body)
            .send()
            .await
            .map_err(|e| XsinkError::Sink(format!("warehouse unreachable: {e}")))?;
        if !response.status().is_success() {
            return Err(XsinkError::Sink(format!(
                "insert failed with status {}",
                response.status()
            ))
            .into());
        }
        let parsed: InsertResponse = response
            .json()
            .await
            .map_err(|e| XsinkError::Sink(format!("bad insert response: {e}")))?;
        if let Some(first) = parsed.insert_errors.first() {
            let message = first
                .errors
                .first()
                .map(|d| d.message.as_str())
                .unwrap_or("unknown error");
            return Err(XsinkError::Sink(format!(
                "insert rejected at row {}: {message}",
                first.index
            ))
            .into());
        }
        Ok(())
    }
}

struct PlannedColumn {
    source: String,
    column: String,
    field: FieldDef,
}

pub struct WarehouseSink {
    api: Box<dyn WarehouseApi>,
    table: String,
    shape: TableShape,
    mode: WriteMode,
    create_table: bool,
    batch_size: usize,
    columns: Vec<PlannedColumn>,
    buffer: Vec<serde_json::Value>,
    batch_index: u64,
    rows: u64,
    dropped: u64,
}

impl WarehouseSink {
    pub fn new(schema: &Schema, spec: &WarehouseSpec, api: Box<dyn WarehouseApi>) -> WarehouseSink {
        let mut namer = ColumnNamer::new(WAREHOUSE_RULES);
        let columns = schema
            .fields
            .iter()
            .map(|f| PlannedColumn {
                source: f.name.clone(),
                column: namer.assign(&f.name),
                field: f.clone(),
            })
            .collect();
        WarehouseSink {
            api,
            table: spec.table.clone(),
            shape: spec.shape,
            mode: spec.mode,
            create_table: spec.create_table,
            batch_size: spec.batch_size.max(1),
            columns,
            buffer: Vec::new(),
            batch_index: 0,
            rows: 0,
            dropped: 0,
        }
    }

    fn schema_json(&self) -> serde_json::Value {
        match self.shape {
            TableShape::Columnar => json!({
                "fields": self
                    .columns
                    .iter()
                    .map(|planned| field_schema_json(&planned.column, &planned.field))
                    .collect::<Vec<_>>(),
            }),
            TableShape::Flattened => json!({
                "fields": [{
                    "name": "fields",
                    "type": "RECORD",
                    "mode": "REPEATED",
                    "fields": [
                        { "name": "name", "type": "STRING", "mode": "NULLABLE" },
                        { "name": "value", "type": "STRING", "mode": "NULLABLE" },
                    ],
                }],
            }),
        }
    }

    async fn flush(&mut self) -> Result<()> {
        if self.buffer.is_empty() {
            return Ok(());
        }
        let start_row = self.rows - self.buffer.len() as u64;
        self.api
            .insert_rows(&self.table, &self.buffer)
            .await
            .with_context(|| {
                format!(
                    "batch {} (rows starting at {start_row})",
                    self.batch_index
                )
            })?;
        self.batch_index += 1;
        self.buffer.clear();
        Ok(())
    }
}

#[async_trait]
impl RecordSink for WarehouseSink {
    fn name(&self) -> &str {
        "warehouse"
    }

    async fn begin(&mut self) -> Result<()> {
        let exists = self.api.table_exists(&self.table).await?;
        match (exists, self.mode) {
            (true, WriteMode::FailIfExists) => {
                return Err(XsinkError::Conflict(format!(
                    "table {} already exists",
                    self.table
                ))
                .into());
            }
            (true, WriteMode::Overwrite) => {
                self.api.truncate(&self.table).await?;
            }
            (false, _) if self.create_table => {
                let schema = self.schema_json();
                self.api.create_table(&self.table, &schema).await?;
            }
            (false, _) => {
                return Err(XsinkError::Sink(format!(
                    "table {} is missing and create_table is disabled",
                    self.table
                ))
                .into());
            }
            _ => {}
        }
        info!(table = %self.table, "warehouse sink ready");
        Ok(())
    }

    async fn write(&mut self, record: Record) -> Result<()> {
        let row = match self.shape {
            TableShape::Columnar => {
                let mut row = serde_json::Map::new();
                for planned in &self.columns {
                    if planned.source != record.name {
                        continue;
                    }
                    match coerce_cell(&planned.field, &record.tree, JsonStyle::Widened) {
                        Ok(cell) => {
                            row.insert(
                                planned.column.clone(),
                                cell_to_json(&cell, JsonStyle::Widened),
                            );
                        }
                        Err(e) => {
                            warn!("dropping cell: {e}");
                            self.dropped += 1;
                        }
                    }
                }
                serde_json::Value::Object(row)
            }
            TableShape::Flattened => json!({
                "fields": flatten_pairs(&record.tree)
                    .into_iter()
                    .map(|(name, value)| json!({ "name": name, "value": value }))
                    .collect::<Vec<_>>(),
            }),
        };
        self.buffer.push(row);
        self.rows += 1;
        if self.buffer.len() >= self.batch_size {
            self.flush().await?;
        }
        Ok(())
    }

    async fn finish(&mut self) -> Result<WriteSummary> {
        self.flush().await?;
        info!(table = %self.table, rows = self.rows, "warehouse sink closed");
        Ok(WriteSummary {
            rows_written: self.rows,
            cells_dropped: self.dropped,
        })
    }
}

/// One column of the warehouse schema document. Leaf scalars widen to their
/// widest native type; nested records recurse; repeated fields get the
/// REPEATED mode.
fn field_schema_json(name: &str, field: &FieldDef) -> serde_json::Value {
    let mode = if field.is_repeated() {
        "REPEATED"
    } else {
        "NULLABLE"
    };
    let kind = field.element_kind();
    let mut out = json!({
        "name": name,
        "type": warehouse_type(kind),
        "mode": mode,
    });
    if let DataKind::Struct(fields) = kind {
        out["fields"] = serde_json::Value::Array(
            fields
                .iter()
                .map(|f| field_schema_json(&f.name, f))
                .collect(),
        );
    }
    out
}

fn warehouse_type(kind: &DataKind) -> &'static str {
    match kind {
        DataKind::Str => "STRING",
        DataKind::I32 | DataKind::I64 => "INT64",
        DataKind::F64 | DataKind::Decimal { .. } => "FLOAT64",
        DataKind::Bool => "BOOL",
        DataKind::Date => "DATE",
        DataKind::Time => "TIME",
        DataKind::Timestamp => "TIMESTAMP",
        DataKind::Struct(_) => "RECORD",
        DataKind::Array(inner) => warehouse_type(inner),
    }
}
