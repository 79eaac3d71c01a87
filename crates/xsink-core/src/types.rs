//! The type lattice shared by inference and every sink.
//!
//! Every value flowing through the system has exactly one [`DataKind`]. Only
//! `Array` and `Struct` recurse; all other kinds are leaves. Type conflicts
//! widen to `Str`, the top of the leaf lattice.

use std::fmt;

use serde::Serialize;

/// A node of the type lattice.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DataKind {
    Str,
    I32,
    I64,
    F64,
    Bool,
    Date,
    Time,
    Timestamp,
    Decimal { precision: u8, scale: u8 },
    Array(Box<DataKind>),
    Struct(Vec<FieldDef>),
}

impl DataKind {
    /// Default decimal shape used when a schema declares `decimal` without
    /// facets.
    pub fn default_decimal() -> DataKind {
        DataKind::Decimal {
            precision: 10,
            scale: 2,
        }
    }

    pub fn is_leaf(&self) -> bool {
        !matches!(self, DataKind::Array(_) | DataKind::Struct(_))
    }
}

impl fmt::Display for DataKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DataKind::Str => write!(f, "string"),
            DataKind::I32 => write!(f, "int32"),
            DataKind::I64 => write!(f, "int64"),
            DataKind::F64 => write!(f, "float64"),
            DataKind::Bool => write!(f, "boolean"),
            DataKind::Date => write!(f, "date"),
            DataKind::Time => write!(f, "time"),
            DataKind::Timestamp => write!(f, "timestamp"),
            DataKind::Decimal { precision, scale } => {
                write!(f, "decimal({precision},{scale})")
            }
            DataKind::Array(inner) => write!(f, "array<{inner}>"),
            DataKind::Struct(_) => write!(f, "struct"),
        }
    }
}

/// One named field of a schema or a `Struct`.
///
/// `repeating` records that the element can occur more than once under its
/// parent; it is orthogonal to `DataKind::Array`. A field materializes as a
/// repeated column when either is set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FieldDef {
    pub name: String,
    pub kind: DataKind,
    pub nullable: bool,
    pub repeating: bool,
}

impl FieldDef {
    pub fn new(name: impl Into<String>, kind: DataKind) -> FieldDef {
        FieldDef {
            name: name.into(),
            kind,
            nullable: false,
            repeating: false,
        }
    }

    pub fn is_repeated(&self) -> bool {
        self.repeating || matches!(self.kind, DataKind::Array(_))
    }

    /// The per-occurrence kind: the element type for arrays, the kind itself
    /// otherwise.
    pub fn element_kind(&self) -> &DataKind {
        match &self.kind {
            DataKind::Array(inner) => inner,
            other => other,
        }
    }
}

/// The unified schema of one run: the document root name plus the shape of
/// one record, keyed by record element name in first-seen order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Schema {
    pub root: String,
    pub fields: Vec<FieldDef>,
}

impl Schema {
    pub fn new(root: impl Into<String>) -> Schema {
        Schema {
            root: root.into(),
            fields: Vec::new(),
        }
    }

    pub fn field(&self, name: &str) -> Option<&FieldDef> {
        self.fields.iter().find(|f| f.name == name)
    }

    pub fn field_mut(&mut self, name: &str) -> Option<&mut FieldDef> {
        self.fields.iter_mut().find(|f| f.name == name)
    }
}

/// Maps a declared type name (XSD primitive or override hint) onto the
/// lattice. Namespace prefixes are stripped; unknown names collapse to `Str`.
pub fn kind_from_type_name(name: &str) -> DataKind {
    let local = name.rsplit(':').next().unwrap_or(name);
    match local {
        "string" => DataKind::Str,
        "int" | "integer" => DataKind::I32,
        "long" => DataKind::I64,
        "float" | "double" => DataKind::F64,
        "boolean" => DataKind::Bool,
        "date" => DataKind::Date,
        "time" => DataKind::Time,
        "dateTime" => DataKind::Timestamp,
        "decimal" => DataKind::default_decimal(),
        _ => DataKind::Str,
    }
}
