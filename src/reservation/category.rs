//! Task categories built from configured task-info fields.
//!
//! A category is an ordered list of `(field, value)` pairs. It is encoded in
//! reservation keys as `field1:value1:field2:value2` with fields in sorted
//! order, so the same task always yields the same key segment.

use serde_json::Value;

/// Separator between fields and values in the encoded form.
const SEPARATOR: char = ':';

/// A category of tasks sharing the same values for the reservation fields.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Category {
    pairs: Vec<(String, String)>,
}

impl Category {
    /// Builds a category from explicit pairs, sorting by field name.
    ///
    /// Returns `None` if any field or value is empty or contains the separator.
    pub fn new<I, F, V>(pairs: I) -> Option<Self>
    where
        I: IntoIterator<Item = (F, V)>,
        F: Into<String>,
        V: Into<String>,
    {
        let mut pairs: Vec<(String, String)> = pairs
            .into_iter()
            .map(|(f, v)| (f.into(), v.into()))
            .collect();
        if pairs.is_empty() || pairs.iter().any(|(f, v)| !is_encodable(f) || !is_encodable(v)) {
            return None;
        }
        pairs.sort();
        pairs.dedup_by(|a, b| a.0 == b.0);
        Some(Self { pairs })
    }

    /// Extracts the category of a task from its `info` document.
    ///
    /// Every field must be present with a scalar value; `null`, empty strings,
    /// arrays and objects make the task uncategorizable.
    pub fn from_task_info(fields: &[String], info: &Value) -> Option<Self> {
        if fields.is_empty() {
            return None;
        }
        let pairs = fields
            .iter()
            .map(|field| info_text(info, field).map(|value| (field.clone(), value)))
            .collect::<Option<Vec<_>>>()?;
        Self::new(pairs)
    }

    /// Glob pattern matching every category over `fields`: `field1:*:field2:*`.
    pub fn wildcard(fields: &[String]) -> String {
        let mut sorted: Vec<&str> = fields.iter().map(String::as_str).collect();
        sorted.sort_unstable();
        sorted.dedup();
        sorted
            .iter()
            .map(|f| format!("{}{}*", f, SEPARATOR))
            .collect::<Vec<_>>()
            .join(&SEPARATOR.to_string())
    }

    /// Parses an encoded category segment.
    pub fn parse(encoded: &str) -> Option<Self> {
        let parts: Vec<&str> = encoded.split(SEPARATOR).collect();
        if parts.len() % 2 != 0 {
            return None;
        }
        Self::new(parts.chunks(2).map(|pair| (pair[0], pair[1])))
    }

    /// Encoded form used inside reservation keys.
    pub fn encode(&self) -> String {
        self.pairs
            .iter()
            .map(|(f, v)| format!("{}{}{}", f, SEPARATOR, v))
            .collect::<Vec<_>>()
            .join(&SEPARATOR.to_string())
    }

    /// The `(field, value)` pairs in canonical order.
    pub fn pairs(&self) -> &[(String, String)] {
        &self.pairs
    }

    /// Returns true if a task's `info` carries every value of this category.
    pub fn matches(&self, info: &Value) -> bool {
        self.pairs
            .iter()
            .all(|(field, value)| info_text(info, field).as_deref() == Some(value.as_str()))
    }
}

fn is_encodable(s: &str) -> bool {
    !s.is_empty() && !s.contains(SEPARATOR)
}

/// Text of an info field the way `info->>'field'` renders it.
pub(crate) fn info_text(info: &Value, field: &str) -> Option<String> {
    match info.get(field)? {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}
