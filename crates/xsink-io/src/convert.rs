//! Per-cell value coercion shared by every sink.
//!
//! A parsed value tree is coerced against its schema field: leaves go
//! through a typed parse of their text content, arrays recurse per element,
//! structs become JSON objects whose leaves are themselves coerced. Sinks
//! decide what a failed coercion means (drop the cell, stringify, drop the
//! row); this module only classifies and converts.

use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, SecondsFormat, TimeZone, Utc};
use serde_json::json;

use xsink_core::{DataKind, FieldDef, Value, XsinkError};

/// How leaf scalars are rendered to JSON.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JsonStyle {
    /// Native forms: decimals as strings, int32 stays 32-bit.
    Exact,
    /// Widest native forms: I32 -> I64, Decimal -> F64. Used by the
    /// warehouse sink.
    Widened,
}

/// A coerced cell in sink-neutral form.
#[derive(Debug, Clone, PartialEq)]
pub enum Cell {
    Null,
    Str(String),
    I32(i32),
    I64(i64),
    F64(f64),
    Bool(bool),
    Date(NaiveDate),
    Time(NaiveTime),
    Timestamp(DateTime<Utc>),
    Decimal { unscaled: i128, scale: u8 },
    Json(serde_json::Value),
    Repeated(Vec<Cell>),
}

/// Coerces one field's value. Repeated fields accept either a list of
/// occurrences or a single occurrence; an empty list becomes `Null`.
pub fn coerce_cell(field: &FieldDef, v: &Value, style: JsonStyle) -> Result<Cell, XsinkError> {
    if field.is_repeated() {
        let items: Vec<&Value> = match v {
            Value::List(items) => items.iter().collect(),
            other => vec![other],
        };
        if items.is_empty() {
            return Ok(Cell::Null);
        }
        let kind = field.element_kind();
        let cells = items
            .into_iter()
            .map(|item| coerce_occurrence(kind, item, &field.name, style))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Cell::Repeated(cells))
    } else {
        // The tree wraps even single occurrences in a list.
        let v = match v {
            Value::List(items) if items.len() == 1 => &items[0],
            other => other,
        };
        coerce_occurrence(&field.kind, v, &field.name, style)
    }
}

/// Coerces one occurrence of a value against a kind.
pub fn coerce_occurrence(
    kind: &DataKind,
    v: &Value,
    name: &str,
    style: JsonStyle,
) -> Result<Cell, XsinkError> {
    match kind {
        DataKind::Struct(fields) => Ok(Cell::Json(coerce_struct(fields, v, style)?)),
        DataKind::Array(inner) => {
            let items: Vec<&Value> = match v {
                Value::List(items) => items.iter().collect(),
                other => vec![other],
            };
            if items.is_empty() {
                return Ok(Cell::Null);
            }
            let cells = items
                .into_iter()
                .map(|item| coerce_occurrence(inner, item, name, style))
                .collect::<Result<Vec<_>, _>>()?;
            Ok(Cell::Repeated(cells))
        }
        leaf => {
            let text = v.text_content().ok_or_else(|| {
                XsinkError::Coercion(format!("field {name}: no text content for {leaf} value"))
            })?;
            parse_leaf(leaf, text, name)
        }
    }
}

/// Coerces a record node against a struct's fields, producing a JSON object.
/// Fields missing from the record become JSON nulls.
pub fn coerce_struct(
    fields: &[FieldDef],
    v: &Value,
    style: JsonStyle,
) -> Result<serde_json::Value, XsinkError> {
    let mut map = serde_json::Map::new();
    for field in fields {
        let value = match v.get(&field.name) {
            Some(child) => cell_to_json(&coerce_cell(field, child, style)?, style),
            None => serde_json::Value::Null,
        };
        map.insert(field.name.clone(), value);
    }
    Ok(serde_json::Value::Object(map))
}

/// Renders a cell to its canonical JSON form under a style.
pub fn cell_to_json(cell: &Cell, style: JsonStyle) -> serde_json::Value {
    match cell {
        Cell::Null => serde_json::Value::Null,
        Cell::Str(s) => json!(s),
        Cell::I32(v) => match style {
            JsonStyle::Exact => json!(v),
            JsonStyle::Widened => json!(*v as i64),
        },
        Cell::I64(v) => json!(v),
        Cell::F64(v) => serde_json::Number::from_f64(*v)
            .map(serde_json::Value::Number)
            .unwrap_or(serde_json::Value::Null),
        Cell::Bool(v) => json!(v),
        Cell::Date(d) => json!(d.format("%Y-%m-%d").to_string()),
        Cell::Time(t) => json!(t.format("%H:%M:%S").to_string()),
        Cell::Timestamp(ts) => json!(ts.to_rfc3339_opts(SecondsFormat::Millis, true)),
        Cell::Decimal { unscaled, scale } => match style {
            JsonStyle::Exact => json!(format_decimal(*unscaled, *scale)),
            JsonStyle::Widened => serde_json::Number::from_f64(
                *unscaled as f64 / 10f64.powi(*scale as i32),
            )
            .map(serde_json::Value::Number)
            .unwrap_or(serde_json::Value::Null),
        },
        Cell::Json(v) => v.clone(),
        Cell::Repeated(cells) => serde_json::Value::Array(
            cells.iter().map(|c| cell_to_json(c, style)).collect(),
        ),
    }
}

fn parse_leaf(kind: &DataKind, text: &str, name: &str) -> Result<Cell, XsinkError> {
    let t = text.trim();
    let fail = || XsinkError::Coercion(format!("field {name}: cannot parse {t:?} as {kind}"));
    match kind {
        DataKind::Str => Ok(Cell::Str(t.to_string())),
        DataKind::I32 => t.parse::<i32>().map(Cell::I32).map_err(|_| fail()),
        DataKind::I64 => t.parse::<i64>().map(Cell::I64).map_err(|_| fail()),
        DataKind::F64 => t.parse::<f64>().map(Cell::F64).map_err(|_| fail()),
        DataKind::Bool => match t {
            "true" => Ok(Cell::Bool(true)),
            "false" => Ok(Cell::Bool(false)),
            _ => Err(fail()),
        },
        DataKind::Date => NaiveDate::parse_from_str(t, "%Y-%m-%d")
            .map(Cell::Date)
            .map_err(|_| fail()),
        DataKind::Time => NaiveTime::parse_from_str(t, "%H:%M:%S%.f")
            .map(Cell::Time)
            .map_err(|_| fail()),
        DataKind::Timestamp => parse_timestamp(t).map(Cell::Timestamp).ok_or_else(fail),
        DataKind::Decimal { precision, scale } => {
            parse_decimal(t, *precision, *scale)
                .map(|unscaled| Cell::Decimal { unscaled, scale: *scale })
                .ok_or_else(fail)
        }
        DataKind::Array(_) | DataKind::Struct(_) => Err(fail()),
    }
}

/// Accepted timestamp surface forms: ISO offset / instant (RFC 3339), local
/// `T`-separated, local space-separated. Naive forms are taken as UTC.
pub fn parse_timestamp(t: &str) -> Option<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(t) {
        return Some(dt.with_timezone(&Utc));
    }
    for format in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(t, format) {
            return Some(Utc.from_utc_datetime(&naive));
        }
    }
    None
}

/// Parses a decimal string to an unscaled integer at the declared scale.
/// Excess fractional digits truncate toward zero; integral overflow beyond
/// the declared precision rejects the value.
fn parse_decimal(s: &str, precision: u8, scale: u8) -> Option<i128> {
    let (negative, digits) = match s.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, s),
    };
    let (int_part, frac_part) = match digits.split_once('.') {
        Some((i, f)) => (i, f),
        None => (digits, ""),
    };
    if int_part.is_empty() && frac_part.is_empty() {
        return None;
    }
    if !int_part.bytes().all(|b| b.is_ascii_digit())
        || !frac_part.bytes().all(|b| b.is_ascii_digit())
    {
        return None;
    }
    let mut unscaled: i128 = 0;
    for b in int_part.bytes() {
        unscaled = unscaled.checked_mul(10)?.checked_add(i128::from(b - b'0'))?;
    }
    let mut taken = 0usize;
    for b in frac_part.bytes().take(scale as usize) {
        unscaled = unscaled.checked_mul(10)?.checked_add(i128::from(b - b'0'))?;
        taken += 1;
    }
    for _ in taken..scale as usize {
        unscaled = unscaled.checked_mul(10)?;
    }
    if unscaled >= 10i128.checked_pow(u32::from(precision))? {
        return None;
    }
    Some(if negative { -unscaled } else { unscaled })
}

/// Formats an unscaled decimal back to its string form.
pub fn format_decimal(unscaled: i128, scale: u8) -> String {
    let negative = unscaled < 0;
    let digits = unscaled.unsigned_abs().to_string();
    let sign = if negative { "-" } else { "" };
    if scale == 0 {
        return format!("{sign}{digits}");
    }
    let scale = scale as usize;
    let padded = if digits.len() <= scale {
        format!("{}{}", "0".repeat(scale + 1 - digits.len()), digits)
    } else {
        digits
    };
    let (int_part, frac_part) = padded.split_at(padded.len() - scale);
    format!("{sign}{int_part}.{frac_part}")
}

/// Flattens a record tree into `(name, value-string)` pairs, one per
/// top-level entry. Leaves flatten to their text; anything nested is
/// stringified as compact JSON. Never fails.
pub fn flatten_pairs(tree: &Value) -> Vec<(String, String)> {
    let entries = match tree.entries() {
        Some(entries) => entries,
        None => return Vec::new(),
    };
    entries
        .iter()
        .map(|(name, v)| {
            let rendered = match v {
                Value::Text(s) => s.clone(),
                Value::List(items) if items.len() == 1 => match items[0].text_content() {
                    Some(text) if items[0].is_leaf_record() || items[0].as_text().is_some() => {
                        text.to_string()
                    }
                    _ => items[0].to_json().to_string(),
                },
                other => other.to_json().to_string(),
            };
            (name.clone(), rendered)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use xsink_core::TEXT_KEY;

    fn leaf(text: &str) -> Value {
        Value::Record(vec![(TEXT_KEY.to_string(), Value::Text(text.into()))])
    }

    fn field(name: &str, kind: DataKind) -> FieldDef {
        FieldDef::new(name, kind)
    }

    #[test]
    fn leaf_parses_by_kind() {
        let f = field("year", DataKind::I32);
        let cell = coerce_cell(&f, &leaf("1965"), JsonStyle::Exact).unwrap();
        assert_eq!(cell, Cell::I32(1965));

        let f = field("price", DataKind::F64);
        let cell = coerce_cell(&f, &leaf("29.99"), JsonStyle::Exact).unwrap();
        assert_eq!(cell, Cell::F64(29.99));

        let f = field("ok", DataKind::Bool);
        assert_eq!(
            coerce_cell(&f, &leaf("true"), JsonStyle::Exact).unwrap(),
            Cell::Bool(true)
        );
    }

    #[test]
    fn bad_leaf_is_a_coercion_error() {
        let f = field("year", DataKind::I32);
        let err = coerce_cell(&f, &leaf("thirty"), JsonStyle::Exact).unwrap_err();
        assert!(matches!(err, XsinkError::Coercion(_)));
    }

    #[test]
    fn timestamp_surface_forms() {
        for form in [
            "2021-03-04T05:06:07Z",
            "2021-03-04T05:06:07+00:00",
            "2021-03-04T05:06:07",
            "2021-03-04 05:06:07",
            "2021-03-04T05:06:07.250Z",
        ] {
            let ts = parse_timestamp(form).unwrap();
            assert_eq!(ts.date_naive().to_string(), "2021-03-04", "form = {form}");
        }
        assert!(parse_timestamp("yesterday").is_none());
    }

    #[test]
    fn decimal_parse_and_format() {
        assert_eq!(parse_decimal("29.99", 10, 2), Some(2999));
        assert_eq!(parse_decimal("-3.5", 10, 2), Some(-350));
        assert_eq!(parse_decimal("7", 10, 2), Some(700));
        assert_eq!(parse_decimal("0.129", 10, 2), Some(12));
        assert_eq!(parse_decimal("123456789012", 10, 2), None);
        assert_eq!(parse_decimal("abc", 10, 2), None);
        assert_eq!(format_decimal(2999, 2), "29.99");
        assert_eq!(format_decimal(-350, 2), "-3.50");
        assert_eq!(format_decimal(5, 2), "0.05");
    }

    #[test]
    fn repeated_field_coerces_every_occurrence() {
        let mut f = field("tag", DataKind::Str);
        f.repeating = true;
        let v = Value::List(vec![leaf("a"), leaf("b")]);
        let cell = coerce_cell(&f, &v, JsonStyle::Exact).unwrap();
        assert_eq!(
            cell,
            Cell::Repeated(vec![Cell::Str("a".into()), Cell::Str("b".into())])
        );

        // Absence and emptiness are equivalent.
        let empty = coerce_cell(&f, &Value::List(vec![]), JsonStyle::Exact).unwrap();
        assert_eq!(empty, Cell::Null);
    }

    #[test]
    fn struct_coercion_types_nested_leaves() {
        let book = DataKind::Struct(vec![
            field("title", DataKind::Str),
            field("year", DataKind::I32),
        ]);
        let mut tree = Value::empty_record();
        tree.push_child("title", leaf("Dune"));
        tree.push_child("year", leaf("1965"));

        let f = field("book", book);
        let cell = coerce_cell(&f, &tree, JsonStyle::Exact).unwrap();
        let Cell::Json(obj) = cell else { panic!("expected json") };
        assert_eq!(obj, serde_json::json!({"title": "Dune", "year": 1965}));
    }

    #[test]
    fn widened_style_promotes_numerics() {
        let dec = Cell::Decimal { unscaled: 2999, scale: 2 };
        assert_eq!(cell_to_json(&dec, JsonStyle::Exact), serde_json::json!("29.99"));
        assert_eq!(cell_to_json(&dec, JsonStyle::Widened), serde_json::json!(29.99));
        assert_eq!(cell_to_json(&Cell::I32(5), JsonStyle::Widened), serde_json::json!(5));
    }

    #[test]
    fn flatten_pairs_render_leaves_and_nested() {
        let mut tree = Value::empty_record();
        tree.push_child("id", leaf("7"));
        let mut contact = Value::empty_record();
        contact.push_child("email", leaf("a@b.c"));
        tree.push_child("contact", contact);

        let pairs = flatten_pairs(&tree);
        assert_eq!(pairs[0], ("id".to_string(), "7".to_string()));
        assert_eq!(pairs[1].0, "contact");
        assert!(pairs[1].1.contains("a@b.c"));
    }
}
