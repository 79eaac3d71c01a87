//! Text-file sinks: a JSON document holding one top-level array, and JSON
//! Lines with one compact record per line.
//!
//! Both are streaming-friendly and flush per record. Records serialize with
//! their raw value-tree structure: every child element stays a list, so two
//! runs over the same input produce byte-identical output.

use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde_json::json;
use tracing::info;

use xsink_core::{
    JsonFileSpec, JsonLinesSpec, Record, RecordSink, TableShape, WriteMode, WriteSummary,
    XsinkError,
};

use crate::convert::flatten_pairs;

/// Renders one record according to the sink shape. Columnar keeps the
/// `{element-name: [tree]}` wrapper; flattened emits an array of
/// `{name, value}` pairs, with nested values stringified.
fn shape_row(record: &Record, shape: TableShape) -> serde_json::Value {
    match shape {
        TableShape::Columnar => {
            let mut map = serde_json::Map::new();
            map.insert(
                record.name.clone(),
                serde_json::Value::Array(vec![record.tree.to_json()]),
            );
            serde_json::Value::Object(map)
        }
        TableShape::Flattened => serde_json::Value::Array(
            flatten_pairs(&record.tree)
                .into_iter()
                .map(|(name, value)| json!({ "name": name, "value": value }))
                .collect(),
        ),
    }
}

/// Opens the target file honoring the write mode. `rewrite_on_append` is set
/// by targets that cannot be extended in place (a closed JSON array).
fn open_target(path: &Path, mode: WriteMode, rewrite_on_append: bool) -> Result<File> {
    match mode {
        WriteMode::FailIfExists => {
            if path.exists() {
                return Err(XsinkError::Conflict(format!(
                    "target file {} already exists",
                    path.display()
                ))
                .into());
            }
            OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(path)
                .with_context(|| format!("create {}", path.display()))
        }
        WriteMode::Overwrite => {
            File::create(path).with_context(|| format!("create {}", path.display()))
        }
        WriteMode::Append => {
            if rewrite_on_append {
                File::create(path).with_context(|| format!("create {}", path.display()))
            } else {
                OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(path)
                    .with_context(|| format!("open {} for append", path.display()))
            }
        }
    }
}

/// Writes all records as a single JSON document: one top-level array.
///
/// `append` rewrites the whole document: a closed JSON array cannot be
/// extended in place.
pub struct JsonFileSink {
    path: PathBuf,
    pretty: bool,
    shape: TableShape,
    mode: WriteMode,
    writer: Option<BufWriter<File>>,
    first: bool,
    rows: u64,
}

impl JsonFileSink {
    pub fn new(spec: &JsonFileSpec) -> JsonFileSink {
        JsonFileSink {
            path: PathBuf::from(&spec.path),
            pretty: spec.pretty,
            shape: spec.shape,
            mode: spec.mode,
            writer: None,
            first: true,
            rows: 0,
        }
    }

    fn writer(&mut self) -> Result<&mut BufWriter<File>> {
        self.writer
            .as_mut()
            .ok_or_else(|| anyhow::anyhow!("json sink used before begin"))
    }
}

#[async_trait]
impl RecordSink for JsonFileSink {
    fn name(&self) -> &str {
        "json_file"
    }

    async fn begin(&mut self) -> Result<()> {
        let file = open_target(&self.path, self.mode, true)?;
        let mut writer = BufWriter::new(file);
        if self.pretty {
            writer.write_all(b"[\n")?;
        } else {
            writer.write_all(b"[")?;
        }
        self.writer = Some(writer);
        info!("json document sink opened: {}", self.path.display());
        Ok(())
    }

    async fn write(&mut self, record: Record) -> Result<()> {
        let row = shape_row(&record, self.shape);
        let rendered = if self.pretty {
            serde_json::to_string_pretty(&row)?
        } else {
            serde_json::to_string(&row)?
        };
        let first = std::mem::take(&mut self.first);
        let pretty = self.pretty;
        let writer = self.writer()?;
        if !first {
            writer.write_all(if pretty { b",\n" } else { b"," })?;
        }
        writer.write_all(rendered.as_bytes())?;
        writer.flush()?;
        self.rows += 1;
        Ok(())
    }

    async fn finish(&mut self) -> Result<WriteSummary> {
        let pretty = self.pretty;
        let writer = self.writer()?;
        writer.write_all(if pretty { b"\n]\n" } else { b"]\n" })?;
        writer.flush()?;
        self.writer = None;
        info!(rows = self.rows, "json document sink closed");
        Ok(WriteSummary {
            rows_written: self.rows,
            cells_dropped: 0,
        })
    }
}

/// Writes one compact JSON record per line, with a trailing newline after
/// the last line.
pub struct JsonLinesSink {
    path: PathBuf,
    shape: TableShape,
    mode: WriteMode,
    writer: Option<BufWriter<File>>,
    rows: u64,
}

impl JsonLinesSink {
    pub fn new(spec: &JsonLinesSpec) -> JsonLinesSink {
        JsonLinesSink {
            path: PathBuf::from(&spec.path),
            shape: spec.shape,
            mode: spec.mode,
            writer: None,
            rows: 0,
        }
    }
}

#[async_trait]
impl RecordSink for JsonLinesSink {
    fn name(&self) -> &str {
        "json_lines"
    }

    async fn begin(&mut self) -> Result<()> {
        let file = open_target(&self.path, self.mode, false)?;
        self.writer = Some(BufWriter::new(file));
        info!("json lines sink opened: {}", self.path.display());
        Ok(())
    }

    async fn write(&mut self, record: Record) -> Result<()> {
        let row = shape_row(&record, self.shape);
        let mut line = serde_json::to_string(&row)?;
        line.push('\n');
        let writer = self
            .writer
            .as_mut()
            .ok_or_else(|| anyhow::anyhow!("json lines sink used before begin"))?;
        writer.write_all(line.as_bytes())?;
        writer.flush()?;
        self.rows += 1;
        Ok(())
    }

    async fn finish(&mut self) -> Result<WriteSummary> {
        if let Some(writer) = self.writer.as_mut() {
            writer.flush()?;
        }
        self.writer = None;
        info!(rows = self.rows, "json lines sink closed");
        Ok(WriteSummary {
            rows_written: self.rows,
            cells_dropped: 0,
        })
    }
}
