//! # xsink Schema - Resolution and Inference
//!
//! This crate unifies a typed schema for one XML document from three
//! sources, in priority order:
//!
//! 1. an external XSD referenced by the document root (downloaded once per
//!    URL and cached for the process lifetime),
//! 2. a sample of the document's own records,
//! 3. user-supplied overrides.
//!
//! Inference never touches the network except through the resolver, and the
//! resolver tolerates every failure by yielding nothing; only
//! `mode: external` turns a missing external schema into an error.
//!
//! ## Example Usage
//!
//! ```no_run
//! use std::path::Path;
//! use xsink_core::SchemaSpec;
//! use xsink_schema::infer_schema;
//!
//! # async fn example() -> anyhow::Result<()> {
//! let schema = infer_schema(Path::new("catalog.xml"), &SchemaSpec::default()).await?;
//! println!("{} fields under <{}>", schema.fields.len(), schema.root);
//! # Ok(())
//! # }
//! ```

/// Sampling inference and field merging
pub mod infer;

/// The leaf-type probe
pub mod probe;

/// External schema resolution and XSD parsing
pub mod resolver;

pub use infer::{infer_schema, merge_fields, merge_kind};
pub use probe::probe_leaf;
pub use resolver::{ExtElement, ExternalSchema, Occurs};
