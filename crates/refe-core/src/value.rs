//! Loosely-typed row values produced by the format adapters, plus the
//! locale-tolerant coercion helpers every normalizer goes through.

use serde::ser::{SerializeMap, Serializer};
use serde::Serialize;

/// One cell of a raw feed row.
///
/// Format adapters only ever produce these variants, so resolvers and
/// normalizers can match exhaustively instead of probing a dynamic value.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum RowValue {
    Null,
    Bool(bool),
    Number(f64),
    Text(String),
    List(Vec<RowValue>),
    Map(RawRow),
}

impl RowValue {
    pub fn text(value: impl Into<String>) -> Self {
        RowValue::Text(value.into())
    }

    /// True for null, whitespace-only text and empty lists.
    pub fn is_blank(&self) -> bool {
        match self {
            RowValue::Null => true,
            RowValue::Text(text) => text.trim().is_empty(),
            RowValue::List(items) => items.iter().all(RowValue::is_blank),
            RowValue::Map(row) => row.is_empty(),
            RowValue::Bool(_) | RowValue::Number(_) => false,
        }
    }

    pub fn as_map(&self) -> Option<&RawRow> {
        match self {
            RowValue::Map(row) => Some(row),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[RowValue]> {
        match self {
            RowValue::List(items) => Some(items),
            _ => None,
        }
    }
}

impl From<&str> for RowValue {
    fn from(value: &str) -> Self {
        RowValue::Text(value.to_string())
    }
}

impl From<String> for RowValue {
    fn from(value: String) -> Self {
        RowValue::Text(value)
    }
}

impl From<f64> for RowValue {
    fn from(value: f64) -> Self {
        RowValue::Number(value)
    }
}

impl From<bool> for RowValue {
    fn from(value: bool) -> Self {
        RowValue::Bool(value)
    }
}

/// Ordered column-name → value mapping. Insertion order is preserved so that
/// depth-first searches over nested feed documents are deterministic.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RawRow {
    fields: Vec<(String, RowValue)>,
}

impl RawRow {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Exact column lookup.
    pub fn get(&self, key: &str) -> Option<&RowValue> {
        self.fields.iter().find(|(k, _)| k == key).map(|(_, v)| v)
    }

    /// Exact lookup first, then a trimmed ASCII case-insensitive match, so
    /// `"Price "` headers still answer for `price`.
    pub fn lookup(&self, key: &str) -> Option<&RowValue> {
        self.get(key).or_else(|| {
            self.fields
                .iter()
                .find(|(k, _)| k.trim().eq_ignore_ascii_case(key.trim()))
                .map(|(_, v)| v)
        })
    }

    pub fn get_mut(&mut self, key: &str) -> Option<&mut RowValue> {
        self.fields.iter_mut().find(|(k, _)| k == key).map(|(_, v)| v)
    }

    /// Replaces an existing column in place, otherwise appends it.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<RowValue>) {
        let key = key.into();
        let value = value.into();
        match self.get_mut(&key) {
            Some(slot) => *slot = value,
            None => self.fields.push((key, value)),
        }
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.fields.iter().map(|(k, _)| k.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &RowValue)> {
        self.fields.iter().map(|(k, v)| (k.as_str(), v))
    }
}

impl From<RawRow> for RowValue {
    fn from(value: RawRow) -> Self {
        RowValue::Map(value)
    }
}

impl<K: Into<String>, V: Into<RowValue>> FromIterator<(K, V)> for RawRow {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut row = RawRow::new();
        for (k, v) in iter {
            row.insert(k, v);
        }
        row
    }
}

impl Serialize for RawRow {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.fields.len()))?;
        for (k, v) in &self.fields {
            map.serialize_entry(k, v)?;
        }
        map.end()
    }
}

/// Renders a scalar as text. Numbers use their shortest decimal form and
/// booleans become `true`/`false`; lists, maps and absent values are empty.
pub fn as_text(value: Option<&RowValue>) -> String {
    match value {
        Some(RowValue::Text(text)) => text.trim().to_string(),
        Some(RowValue::Number(n)) if n.is_finite() => n.to_string(),
        Some(RowValue::Bool(b)) => b.to_string(),
        _ => String::new(),
    }
}

/// Non-blank text or `None`.
pub fn as_opt_text(value: Option<&RowValue>) -> Option<String> {
    let text = as_text(value);
    if text.is_empty() {
        None
    } else {
        Some(text)
    }
}

/// Parses a feed number. Whitespace (including no-break spaces used as
/// thousands separators) is stripped and a comma is read as the decimal
/// point. Blank or non-finite input yields `None`.
pub fn as_number(value: Option<&RowValue>) -> Option<f64> {
    match value {
        Some(RowValue::Number(n)) => Some(*n).filter(|n| n.is_finite()),
        Some(RowValue::Text(text)) => parse_locale_number(text),
        _ => None,
    }
}

fn parse_locale_number(text: &str) -> Option<f64> {
    let cleaned: String = text
        .chars()
        .filter(|c| !c.is_whitespace() && *c != '\u{a0}' && *c != '\u{202f}')
        .map(|c| if c == ',' { '.' } else { c })
        .collect();
    if cleaned.is_empty() {
        return None;
    }
    cleaned.parse::<f64>().ok().filter(|n| n.is_finite())
}

/// Splits a scalar on `,` `;` `|`, or coerces each element of a list.
/// Blank entries are dropped; order is preserved.
pub fn as_text_list(value: Option<&RowValue>) -> Vec<String> {
    match value {
        Some(RowValue::List(items)) => items
            .iter()
            .map(|item| as_text(Some(item)))
            .filter(|s| !s.is_empty())
            .collect(),
        other => as_text(other)
            .split([',', ';', '|'])
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect(),
    }
}
