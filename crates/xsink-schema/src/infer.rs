//! Schema inference and unification.
//!
//! The engine folds up to `sampling_size` records into an accumulator of
//! top-level fields, one per distinct record element name. Merging is a pure
//! binary operator on fields: kinds that disagree widen to `Str`, structs
//! merge keywise, `nullable` and `repeating` OR together, and a field seen
//! on only one side of a merge becomes nullable.
//!
//! Mode selection decides which sources participate: sampling only, the
//! external schema only, overrides only, or external-then-sampled. Overrides
//! are applied last in every mode.

use std::collections::HashMap;
use std::path::Path;

use anyhow::Result;
use tracing::{debug, info};

use xsink_core::{
    kind_from_type_name, DataKind, FieldDef, InferenceMode, Schema, SchemaSpec, Value, XsinkError,
    TEXT_KEY,
};
use xsink_io::source_xml::XmlRecordSource;

use crate::probe::probe_leaf;
use crate::resolver::{self, ExtElement, ExternalSchema};

/// Produces the unified schema for a document under a configuration.
pub async fn infer_schema(path: &Path, spec: &SchemaSpec) -> Result<Schema> {
    let root = XmlRecordSource::root_element_name(path)?
        .ok_or_else(|| XsinkError::Schema("document has no discernible root".into()))?;

    let mut fields = match spec.mode {
        InferenceMode::Auto => sample_fields(path, spec.sampling_size)?,
        InferenceMode::Manual => Vec::new(),
        InferenceMode::External => {
            let ext = resolver::resolve(path, &spec.resolver).await.ok_or_else(|| {
                XsinkError::Schema(
                    "external mode requested but no external schema could be resolved".into(),
                )
            })?;
            external_fields(&ext, &root)
        }
        InferenceMode::Hybrid => {
            let mut fields = match resolver::resolve(path, &spec.resolver).await {
                Some(ext) => external_fields(&ext, &root),
                None => Vec::new(),
            };
            // Sampled fields only fill top-level names the external schema
            // did not declare.
            for sampled in sample_fields(path, spec.sampling_size)? {
                if !fields.iter().any(|f| f.name == sampled.name) {
                    fields.push(sampled);
                }
            }
            fields
        }
    };

    apply_overrides(&mut fields, spec);
    info!(root = %root, fields = fields.len(), mode = ?spec.mode, "schema unified");
    Ok(Schema { root, fields })
}

/// Folds up to `limit` sampled records into top-level fields. A top-level
/// name seen in more than one record is marked repeating; a name missing
/// from some record is marked nullable.
fn sample_fields(path: &Path, limit: usize) -> Result<Vec<FieldDef>> {
    let source = XmlRecordSource::open(path, None)?;
    let mut fields: Vec<FieldDef> = Vec::new();
    let mut occurrences: HashMap<String, usize> = HashMap::new();
    let mut sampled = 0usize;

    for record in source.take(limit) {
        let record = record?;
        sampled += 1;
        *occurrences.entry(record.name.clone()).or_insert(0) += 1;
        let incoming = FieldDef::new(record.name.clone(), infer_tree_kind(&record.tree));
        match fields.iter_mut().find(|f| f.name == incoming.name) {
            Some(existing) => {
                *existing = merge_fields(existing, &incoming);
                existing.repeating = true;
            }
            None => fields.push(incoming),
        }
    }
    debug!(sampled, fields = fields.len(), "sampling fold complete");

    for field in &mut fields {
        if occurrences.get(&field.name).copied().unwrap_or(0) < sampled {
            field.nullable = true;
        }
    }
    Ok(fields)
}

/// Infers the kind of one value-tree node.
fn infer_tree_kind(tree: &Value) -> DataKind {
    match tree {
        Value::Text(s) => probe_leaf(s),
        Value::List(items) => infer_list_kind(items),
        Value::Record(_) => {
            if tree.is_leaf_record() {
                // Only #text and/or attributes: a leaf. Attributes alone
                // carry no typed payload and stay Str.
                match tree.text_content() {
                    Some(text) => probe_leaf(text),
                    None => DataKind::Str,
                }
            } else {
                DataKind::Struct(infer_struct_fields(tree))
            }
        }
    }
}

fn infer_struct_fields(tree: &Value) -> Vec<FieldDef> {
    tree.entries()
        .unwrap_or(&[])
        .iter()
        .filter(|(k, _)| k.as_str() != TEXT_KEY)
        .map(|(k, v)| infer_value_field(k, v))
        .collect()
}

/// Infers the field for one entry of a record. Child-element entries are
/// lists; more than one occurrence under a single parent marks the field
/// repeating.
fn infer_value_field(name: &str, v: &Value) -> FieldDef {
    match v {
        Value::List(items) => {
            let mut field = FieldDef::new(name, infer_list_kind(items));
            field.repeating = items.len() > 1;
            field
        }
        other => FieldDef::new(name, infer_tree_kind(other)),
    }
}

fn infer_list_kind(items: &[Value]) -> DataKind {
    items
        .iter()
        .map(infer_tree_kind)
        .reduce(|a, b| merge_kind(&a, &b))
        .unwrap_or(DataKind::Str)
}

/// Merges two same-named fields contributed by different records.
pub fn merge_fields(a: &FieldDef, b: &FieldDef) -> FieldDef {
    FieldDef {
        name: a.name.clone(),
        kind: merge_kind(&a.kind, &b.kind),
        nullable: a.nullable || b.nullable,
        repeating: a.repeating || b.repeating,
    }
}

/// Merges two kinds: structs keywise, arrays elementwise, equal kinds stay,
/// any other disagreement widens to `Str`.
pub fn merge_kind(a: &DataKind, b: &DataKind) -> DataKind {
    match (a, b) {
        (DataKind::Struct(left), DataKind::Struct(right)) => {
            DataKind::Struct(merge_struct_fields(left, right))
        }
        (DataKind::Array(left), DataKind::Array(right)) => {
            DataKind::Array(Box::new(merge_kind(left, right)))
        }
        _ if a == b => a.clone(),
        _ => DataKind::Str,
    }
}

fn merge_struct_fields(left: &[FieldDef], right: &[FieldDef]) -> Vec<FieldDef> {
    let mut out: Vec<FieldDef> = Vec::with_capacity(left.len());
    for f in left {
        match right.iter().find(|g| g.name == f.name) {
            Some(g) => out.push(merge_fields(f, g)),
            None => {
                let mut one_sided = f.clone();
                one_sided.nullable = true;
                out.push(one_sided);
            }
        }
    }
    for g in right {
        if !left.iter().any(|f| f.name == g.name) {
            let mut one_sided = g.clone();
            one_sided.nullable = true;
            out.push(one_sided);
        }
    }
    out
}

/// Fields contributed by an external schema, in declaration order. The
/// element matching the document root is a container, not a record, and is
/// skipped; duplicate declarations keep their first occurrence.
fn external_fields(ext: &ExternalSchema, root: &str) -> Vec<FieldDef> {
    let mut out: Vec<FieldDef> = Vec::new();
    for element in ext.elements.iter().filter(|e| e.name != root) {
        if !out.iter().any(|f| f.name == element.name) {
            out.push(ExtElement::to_field(element));
        }
    }
    out
}

/// Applies user overrides. Paths may traverse (`a/b/c`) but only the first
/// segment is matched, against top-level fields.
fn apply_overrides(fields: &mut Vec<FieldDef>, spec: &SchemaSpec) {
    for path in &spec.force_arrays {
        let key = top_level_key(path);
        if let Some(field) = fields.iter_mut().find(|f| f.name == key) {
            field.repeating = true;
        } else {
            debug!(path = %path, "force_arrays path does not match a top-level field");
        }
    }
    for (path, type_name) in &spec.type_hints {
        let key = top_level_key(path);
        match fields.iter_mut().find(|f| f.name == key) {
            Some(field) => field.kind = kind_from_type_name(type_name),
            None => {
                let mut created = FieldDef::new(key, kind_from_type_name(type_name));
                created.nullable = true;
                fields.push(created);
            }
        }
    }
}

fn top_level_key(path: &str) -> &str {
    let trimmed = path.trim_start_matches('/');
    trimmed.split('/').next().unwrap_or(trimmed)
}
