//! # xsink Core - Shared Types and Abstractions
//!
//! This crate provides the foundational types, traits, and configuration
//! structures for xsink ingestion pipelines: the recursive value tree parsed
//! from XML records, the type lattice and schema model, identifier
//! sanitization, the sink abstraction, and the YAML-loadable job
//! specification.
//!
//! ## Key Components
//!
//! - **Value Trees**: recursive representation of one XML record
//! - **Type Lattice**: the closed set of types every cell is coerced to
//! - **Sink Trait**: `begin` / `write` / `finish` lifecycle of every target
//! - **Configuration**: serde-based job specification structures
//! - **Error Handling**: structured error taxonomy for pipeline operations
//!
//! ## Example Usage
//!
//! ```rust
//! use xsink_core::{FieldDef, DataKind, Schema};
//!
//! let mut schema = Schema::new("catalog");
//! schema.fields.push(FieldDef::new("book", DataKind::Str));
//! assert!(schema.field("book").is_some());
//! ```

use std::collections::BTreeMap;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

pub mod error;
pub mod sanitize;
pub mod types;
pub mod value;

pub use error::XsinkError;
pub use sanitize::{sanitize, ColumnNamer, SanitizeRules};
pub use types::{kind_from_type_name, DataKind, FieldDef, Schema};
pub use value::{Value, ATTR_PREFIX, TEXT_KEY};

/// One extracted record: the local name of a depth-2 element plus its parsed
/// value tree. Records are created by the source, consumed exactly once, and
/// must not be retained past their write.
#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    pub name: String,
    pub tree: Value,
}

impl Record {
    pub fn new(name: impl Into<String>, tree: Value) -> Record {
        Record {
            name: name.into(),
            tree,
        }
    }
}

/// Totals reported by a sink when the stream ends.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WriteSummary {
    /// Rows accepted by the target.
    pub rows_written: u64,
    /// Cells dropped by per-cell coercion failures.
    pub cells_dropped: u64,
}

/// Trait for record sink operators.
///
/// Sinks are the exit points of an ingestion run. The orchestrator drives
/// them with a synchronous fold: `begin` once (table lifecycle), `write` once
/// per record in document order, `finish` once to flush the partial tail
/// batch and report totals. A sink holds at most one outstanding batch.
#[async_trait]
pub trait RecordSink: Send {
    /// Identifier used for logging and diagnostics.
    fn name(&self) -> &str;

    /// Prepares the target: existence check, truncate/conflict handling per
    /// write mode, idempotent create.
    async fn begin(&mut self) -> Result<()>;

    /// Writes one record. Cell-level coercion failures are absorbed and
    /// counted; anything else aborts the run.
    async fn write(&mut self, record: Record) -> Result<()>;

    /// Flushes buffered rows and releases the target.
    async fn finish(&mut self) -> Result<WriteSummary>;
}

/// Complete job specification loaded from YAML.
///
/// # Example YAML Configuration
///
/// ```yaml
/// input:
///   path: "catalog.xml"
/// schema:
///   mode: hybrid
///   sampling_size: 500
///   force_arrays: ["book"]
///   type_hints:
///     year: "int"
/// sink:
///   type: postgres
///   host: "localhost"
///   dbname: "catalog"
///   user: "loader"
///   password: "secret"
///   table: "books"
///   shape: columnar
///   mode: overwrite
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobSpec {
    pub input: InputSpec,
    #[serde(default)]
    pub schema: SchemaSpec,
    pub sink: SinkSpec,
}

/// Where the XML document comes from.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InputSpec {
    /// Path of the XML document on the local filesystem.
    pub path: String,

    /// Optional byte window. The window is a hint: the stream stops at the
    /// next record boundary after the end offset, and a non-zero start must
    /// be record-aligned.
    #[serde(default)]
    pub start_byte: Option<u64>,
    #[serde(default)]
    pub end_byte: Option<u64>,
}

/// How the unified schema is produced.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchemaSpec {
    #[serde(default)]
    pub mode: InferenceMode,

    /// Upper bound on records consumed for sampling inference.
    #[serde(default = "default_sampling_size")]
    pub sampling_size: usize,

    #[serde(default)]
    pub resolver: ResolverSpec,

    /// Paths whose top-level field is forced to `repeating`.
    #[serde(default)]
    pub force_arrays: Vec<String>,

    /// Path → type-name overrides for top-level fields.
    #[serde(default)]
    pub type_hints: BTreeMap<String, String>,
}

impl Default for SchemaSpec {
    fn default() -> SchemaSpec {
        SchemaSpec {
            mode: InferenceMode::default(),
            sampling_size: default_sampling_size(),
            resolver: ResolverSpec::default(),
            force_arrays: Vec::new(),
            type_hints: BTreeMap::new(),
        }
    }
}

/// Which schema sources participate, and how.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InferenceMode {
    /// Infer from sampled records only.
    #[default]
    Auto,
    /// Use the external schema only; fail when unavailable.
    External,
    /// Construct the schema from overrides only.
    Manual,
    /// External first, sampled fields fill the gaps, overrides last.
    Hybrid,
}

/// External schema resolver settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResolverSpec {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// HTTP timeout for the schema download, in seconds.
    #[serde(default = "default_resolver_timeout")]
    pub timeout_secs: u64,
}

impl Default for ResolverSpec {
    fn default() -> ResolverSpec {
        ResolverSpec {
            enabled: default_true(),
            timeout_secs: default_resolver_timeout(),
        }
    }
}

/// Behavior upon finding the target already present.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WriteMode {
    /// Add to the existing target; create if missing.
    #[default]
    Append,
    /// Remove all existing data first, then append.
    Overwrite,
    /// Fail when the target exists; else create and append.
    FailIfExists,
}

/// Table layout of a sink.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TableShape {
    /// One column per top-level schema field.
    #[default]
    Columnar,
    /// A single repeated `{name, value}` record, robust to unbounded field
    /// counts and heterogeneous record shapes.
    Flattened,
}

/// Parquet compression codecs exposed in configuration.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParquetCompression {
    #[default]
    Snappy,
    Zstd,
    None,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum SinkSpec {
    /// A single JSON document holding a top-level array of records.
    #[serde(rename = "json_file")]
    JsonFile(JsonFileSpec),
    /// One compact JSON record per line.
    #[serde(rename = "json_lines")]
    JsonLines(JsonLinesSpec),
    /// A directory of Parquet part files.
    #[serde(rename = "parquet")]
    Parquet(ParquetSpec),
    /// HTTP warehouse with batch inserts.
    #[serde(rename = "warehouse")]
    Warehouse(WarehouseSpec),
    /// PostgreSQL table with parameterized batch inserts.
    #[serde(rename = "postgres")]
    Postgres(PostgresSpec),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonFileSpec {
    pub path: String,
    #[serde(default)]
    pub pretty: bool,
    #[serde(default)]
    pub shape: TableShape,
    #[serde(default)]
    pub mode: WriteMode,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonLinesSpec {
    pub path: String,
    #[serde(default)]
    pub shape: TableShape,
    #[serde(default)]
    pub mode: WriteMode,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParquetSpec {
    /// Directory receiving `part-<uuid>.parquet` files.
    pub path: String,
    #[serde(default)]
    pub shape: TableShape,
    #[serde(default)]
    pub mode: WriteMode,
    #[serde(default)]
    pub compression: ParquetCompression,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WarehouseSpec {
    /// Base URL of the warehouse REST endpoint.
    pub endpoint: String,
    pub project: String,
    pub dataset: String,
    pub table: String,
    /// Bearer token; omitted for unauthenticated endpoints.
    #[serde(default)]
    pub token: Option<String>,
    #[serde(default)]
    pub shape: TableShape,
    #[serde(default)]
    pub mode: WriteMode,
    #[serde(default = "default_true")]
    pub create_table: bool,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_http_timeout")]
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PostgresSpec {
    pub host: String,
    #[serde(default = "default_pg_port")]
    pub port: u16,
    pub dbname: String,
    pub user: String,
    #[serde(default)]
    pub password: String,
    pub table: String,
    #[serde(default)]
    pub shape: TableShape,
    #[serde(default)]
    pub mode: WriteMode,
    #[serde(default = "default_true")]
    pub create_table: bool,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
}

/// Default number of rows buffered per insert batch.
fn default_batch_size() -> usize {
    500
}

/// Default upper bound on records consumed for schema sampling.
fn default_sampling_size() -> usize {
    1000
}

fn default_resolver_timeout() -> u64 {
    30
}

fn default_http_timeout() -> u64 {
    30
}

fn default_pg_port() -> u16 {
    5432
}

fn default_true() -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn job_spec_from_yaml_with_defaults() {
        let yaml = r#"
input:
  path: "data.xml"
sink:
  type: json_lines
  path: "out.ndjson"
"#;
        let spec: JobSpec = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(spec.schema.mode, InferenceMode::Auto);
        assert_eq!(spec.schema.sampling_size, 1000);
        assert!(spec.schema.resolver.enabled);
        let SinkSpec::JsonLines(lines) = &spec.sink else {
            panic!("expected json_lines sink");
        };
        assert_eq!(lines.mode, WriteMode::Append);
        assert_eq!(lines.shape, TableShape::Columnar);
    }

    #[test]
    fn sink_spec_round_trips_tagged_variants() {
        let yaml = r#"
type: postgres
host: "db"
dbname: "x"
user: "u"
table: "t"
mode: fail_if_exists
shape: flattened
"#;
        let spec: SinkSpec = serde_yaml::from_str(yaml).unwrap();
        let SinkSpec::Postgres(pg) = &spec else {
            panic!("expected postgres sink");
        };
        assert_eq!(pg.port, 5432);
        assert_eq!(pg.mode, WriteMode::FailIfExists);
        assert_eq!(pg.shape, TableShape::Flattened);
        assert_eq!(pg.batch_size, 500);
        assert!(pg.create_table);
    }

    #[test]
    fn schema_spec_overrides_parse() {
        let yaml = r#"
mode: hybrid
force_arrays: ["book", "tags/tag"]
type_hints:
  year: "int"
  price: "decimal"
"#;
        let spec: SchemaSpec = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(spec.mode, InferenceMode::Hybrid);
        assert_eq!(spec.force_arrays.len(), 2);
        assert_eq!(spec.type_hints.get("year").unwrap(), "int");
    }
}
