//! # xsink I/O - XML Record Source and Sink Implementations
//!
//! This crate provides the streaming XML record source and the concrete sink
//! implementations of the xsink pipeline.
//!
//! ## Features
//!
//! ### Source
//! - **XML**: pull-mode tokenizer yielding one record per depth-2 element,
//!   with byte-window support and root/schema-location probes
//!
//! ### Sinks
//! - **JSON document**: one top-level array, pretty or compact
//! - **JSON Lines**: one compact record per line
//! - **Parquet**: columnar part files with snappy compression
//! - **Warehouse**: HTTP batch inserts behind a narrow API trait
//! - **PostgreSQL**: parameterized batch inserts behind a narrow SQL trait
//!
//! ## Example Usage
//!
//! ```no_run
//! use std::path::Path;
//! use xsink_io::source_xml::XmlRecordSource;
//!
//! # fn main() -> anyhow::Result<()> {
//! for record in XmlRecordSource::open(Path::new("catalog.xml"), None)? {
//!     let record = record?;
//!     println!("{} -> {:?}", record.name, record.tree);
//! }
//! # Ok(())
//! # }
//! ```

use anyhow::Result;

use xsink_core::{RecordSink, Schema, SinkSpec};

/// Shared per-cell value coercion
pub mod convert;

/// JSON document and JSON Lines sinks
pub mod sink_json;

/// Parquet part-file sink
pub mod sink_parquet;

/// PostgreSQL sink
pub mod sink_postgres;

/// HTTP warehouse sink
pub mod sink_warehouse;

/// Streaming XML record source
pub mod source_xml;

/// Builds the sink described by a spec, bound to the unified schema.
/// Connection-level failures surface here, before any record is pulled.
pub async fn create_sink(schema: &Schema, spec: &SinkSpec) -> Result<Box<dyn RecordSink>> {
    match spec {
        SinkSpec::JsonFile(file) => Ok(Box::new(sink_json::JsonFileSink::new(file))),
        SinkSpec::JsonLines(lines) => Ok(Box::new(sink_json::JsonLinesSink::new(lines))),
        SinkSpec::Parquet(parquet) => Ok(Box::new(sink_parquet::ParquetSink::new(schema, parquet))),
        SinkSpec::Warehouse(warehouse) => {
            let api = sink_warehouse::HttpWarehouse::new(warehouse)?;
            Ok(Box::new(sink_warehouse::WarehouseSink::new(
                schema,
                warehouse,
                Box::new(api),
            )))
        }
        SinkSpec::Postgres(postgres) => {
            let gateway = sink_postgres::PgGateway::connect(postgres).await?;
            Ok(Box::new(sink_postgres::PostgresSink::new(
                schema,
                postgres,
                Box::new(gateway),
            )))
        }
    }
}
