//! Target-aware identifier sanitization.
//!
//! Source element and attribute names carry characters most sinks reject.
//! [`sanitize`] is a pure, deterministic, idempotent mapping from a source
//! name to a legal identifier under a target's [`SanitizeRules`].
//! Collision handling after sanitization is part of the same contract:
//! [`ColumnNamer`] assigns the first unused `_1`, `_2`, … suffix and keeps
//! the mapping stable for the run.

use std::collections::HashSet;

use crate::value::ATTR_PREFIX;

/// Per-target sanitization rules.
#[derive(Debug, Clone, Copy)]
pub struct SanitizeRules {
    /// Maximum identifier length; 0 means unlimited.
    pub max_len: usize,
    pub lowercase: bool,
}

impl SanitizeRules {
    pub const fn new(max_len: usize, lowercase: bool) -> SanitizeRules {
        SanitizeRules { max_len, lowercase }
    }
}

/// Sanitizes a source name for a target: `@` becomes `attr_`, `#` is
/// dropped, anything outside `[A-Za-z0-9_]` becomes `_`, leading/trailing
/// underscores are stripped, then length and case rules apply.
pub fn sanitize(name: &str, rules: &SanitizeRules) -> String {
    let renamed = if let Some(rest) = name.strip_prefix(ATTR_PREFIX) {
        format!("attr_{rest}")
    } else {
        name.to_string()
    };

    let mut out: String = renamed
        .chars()
        .filter(|c| *c != '#')
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' { c } else { '_' })
        .collect();

    if rules.lowercase {
        out = out.to_ascii_lowercase();
    }

    let mut out = out.trim_matches('_').to_string();
    if rules.max_len > 0 && out.len() > rules.max_len {
        out.truncate(rules.max_len);
    }
    // Truncation may expose a fresh trailing underscore.
    let out = out.trim_end_matches('_');
    if out.is_empty() {
        "field".to_string()
    } else {
        out.to_string()
    }
}

/// Assigns unique column names for one sink run.
#[derive(Debug)]
pub struct ColumnNamer {
    rules: SanitizeRules,
    taken: HashSet<String>,
}

impl ColumnNamer {
    pub fn new(rules: SanitizeRules) -> ColumnNamer {
        ColumnNamer {
            rules,
            taken: HashSet::new(),
        }
    }

    /// Sanitizes `source` and resolves collisions with the first unused
    /// numeric suffix. Every distinct call yields a distinct column name.
    pub fn assign(&mut self, source: &str) -> String {
        let base = sanitize(source, &self.rules);
        let mut candidate = base.clone();
        let mut n = 0u32;
        while self.taken.contains(&candidate) {
            n += 1;
            candidate = format!("{base}_{n}");
            if self.rules.max_len > 0 && candidate.len() > self.rules.max_len {
                let suffix = format!("_{n}");
                let keep = self.rules.max_len.saturating_sub(suffix.len());
                candidate = format!("{}{}", &base[..keep.min(base.len())], suffix);
            }
        }
        self.taken.insert(candidate.clone());
        candidate
    }
}
