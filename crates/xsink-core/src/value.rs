//! Recursive value trees for parsed XML records.
//!
//! A record is a tree of [`Value`] nodes. Keys inside a [`Value::Record`] are
//! either an attribute name prefixed with `@`, the accumulated text content
//! under `#text`, or a child element name. The value under a child element
//! name is *always* a [`Value::List`], even when the element occurred exactly
//! once; downstream inference and materialization rely on never having to
//! branch on cardinality.

use serde_json::json;

/// Key under which an element's accumulated text content is stored.
pub const TEXT_KEY: &str = "#text";

/// Prefix distinguishing attribute keys from child element keys.
pub const ATTR_PREFIX: char = '@';

/// A parsed XML value: a text leaf, an ordered list of occurrences, or a
/// record of named entries in first-seen order.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Text(String),
    List(Vec<Value>),
    Record(Vec<(String, Value)>),
}

impl Value {
    /// An empty record node.
    pub fn empty_record() -> Value {
        Value::Record(Vec::new())
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Value::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn entries(&self) -> Option<&[(String, Value)]> {
        match self {
            Value::Record(entries) => Some(entries),
            _ => None,
        }
    }

    /// Looks up an entry of a record node by key.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.entries()?
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v)
    }

    /// Appends one occurrence of a child element, creating the list on the
    /// first occurrence. Single occurrences are still wrapped in a list.
    pub fn push_child(&mut self, name: &str, child: Value) {
        let Value::Record(entries) = self else {
            return;
        };
        if let Some((_, Value::List(items))) =
            entries.iter_mut().find(|(k, _)| k == name)
        {
            items.push(child);
        } else {
            entries.push((name.to_string(), Value::List(vec![child])));
        }
    }

    /// Inserts an entry verbatim (used for attributes and `#text`).
    pub fn insert_entry(&mut self, key: String, value: Value) {
        if let Value::Record(entries) = self {
            entries.push((key, value));
        }
    }

    /// The text content of this node: the `#text` entry of a record, or the
    /// string itself for a text leaf.
    pub fn text_content(&self) -> Option<&str> {
        match self {
            Value::Text(s) => Some(s),
            Value::Record(_) => self.get(TEXT_KEY).and_then(Value::as_text),
            Value::List(_) => None,
        }
    }

    /// True when the record carries no child elements: only `#text` and/or
    /// attribute entries. Such nodes are leaves for type inference.
    pub fn is_leaf_record(&self) -> bool {
        match self.entries() {
            Some(entries) => entries
                .iter()
                .all(|(k, _)| k == TEXT_KEY || k.starts_with(ATTR_PREFIX)),
            None => false,
        }
    }

    /// Child-element entries of a record, skipping attributes and `#text`.
    pub fn children(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.entries()
            .unwrap_or(&[])
            .iter()
            .filter(|(k, _)| k != TEXT_KEY && !k.starts_with(ATTR_PREFIX))
            .map(|(k, v)| (k.as_str(), v))
    }

    /// Converts the tree to JSON, preserving entry order and list structure.
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Value::Text(s) => json!(s),
            Value::List(items) => {
                serde_json::Value::Array(items.iter().map(Value::to_json).collect())
            }
            Value::Record(entries) => {
                let mut map = serde_json::Map::new();
                for (k, v) in entries {
                    map.insert(k.clone(), v.to_json());
                }
                serde_json::Value::Object(map)
            }
        }
    }
}
