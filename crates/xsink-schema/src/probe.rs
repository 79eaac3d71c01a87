//! The leaf-type probe: a pure function deciding the primitive type of a
//! text value.
//!
//! Deliberately simple, and a policy surface rather than a library: the
//! exact rules below are what every component agrees on. Booleans are the
//! literals `true`/`false`; integers fit I32 up to ten digits and I64 above;
//! a decimal point makes F64; date and timestamp shapes are ISO-like; and
//! everything else is a string.

use lazy_static::lazy_static;
use regex::Regex;

use xsink_core::DataKind;

lazy_static! {
    static ref INT_RE: Regex = Regex::new(r"^-?\d+$").unwrap();
    static ref FLOAT_RE: Regex = Regex::new(r"^-?\d+\.\d+$").unwrap();
    static ref TIMESTAMP_RE: Regex =
        Regex::new(r"^\d{4}-\d{2}-\d{2}T\d{2}:\d{2}:\d{2}.*$").unwrap();
    static ref DATE_RE: Regex = Regex::new(r"^\d{4}-\d{2}-\d{2}$").unwrap();
}

/// Probes a text value for its leaf type. Idempotent: probing the string
/// form of a probed value yields the same type.
pub fn probe_leaf(s: &str) -> DataKind {
    let t = s.trim();
    if t == "true" || t == "false" {
        return DataKind::Bool;
    }
    if INT_RE.is_match(t) {
        let digits = t.strip_prefix('-').unwrap_or(t);
        return if digits.len() <= 10 {
            DataKind::I32
        } else {
            DataKind::I64
        };
    }
    if FLOAT_RE.is_match(t) {
        return DataKind::F64;
    }
    if TIMESTAMP_RE.is_match(t) {
        return DataKind::Timestamp;
    }
    if DATE_RE.is_match(t) {
        return DataKind::Date;
    }
    DataKind::Str
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn primitive_shapes() {
        assert_eq!(probe_leaf("true"), DataKind::Bool);
        assert_eq!(probe_leaf("false"), DataKind::Bool);
        assert_eq!(probe_leaf("42"), DataKind::I32);
        assert_eq!(probe_leaf("-7"), DataKind::I32);
        assert_eq!(probe_leaf("29.99"), DataKind::F64);
        assert_eq!(probe_leaf("-0.5"), DataKind::F64);
        assert_eq!(probe_leaf("2021-03-04"), DataKind::Date);
        assert_eq!(probe_leaf("2021-03-04T05:06:07"), DataKind::Timestamp);
        assert_eq!(probe_leaf("2021-03-04T05:06:07.250Z"), DataKind::Timestamp);
        assert_eq!(probe_leaf("hello"), DataKind::Str);
        assert_eq!(probe_leaf(""), DataKind::Str);
        assert_eq!(probe_leaf("1e5"), DataKind::Str);
    }

    #[test]
    fn integer_width_boundary_is_ten_digits() {
        assert_eq!(probe_leaf("1234567890"), DataKind::I32);
        assert_eq!(probe_leaf("-1234567890"), DataKind::I32);
        assert_eq!(probe_leaf("12345678901"), DataKind::I64);
    }

    #[test]
    fn probing_is_idempotent() {
        for s in ["true", "42", "29.99", "2021-03-04", "2021-03-04T05:06:07", "word"] {
            assert_eq!(probe_leaf(s), probe_leaf(s.trim()), "input = {s:?}");
        }
    }
}
